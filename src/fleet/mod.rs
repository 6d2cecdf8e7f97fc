pub mod actuator;
pub mod correlator;
pub mod liveness;
pub mod orchestrator;
pub mod poller;
pub mod registry;
pub mod router;
pub mod store;
pub mod transport;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize, Serializer};
use tokio::time::Instant;

use crate::error::{Error, Result};

pub type DeviceId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Camera,
    DistanceSensor,
    Actuator,
}

impl DeviceClass {
    /// Capabilities a device of this class answers to.
    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            DeviceClass::Camera => &[Capability::Heartbeat, Capability::Image],
            DeviceClass::DistanceSensor => &[Capability::Heartbeat, Capability::Distance],
            DeviceClass::Actuator => &[Capability::Heartbeat, Capability::Digital],
        }
    }

    pub fn supports(self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    #[serde(alias = "picture")]
    Image,
    Distance,
    Heartbeat,
    Digital,
}

impl Capability {
    /// Topic segment used on the bus.
    pub fn segment(self) -> &'static str {
        match self {
            Capability::Image => "picture",
            Capability::Distance => "distance",
            Capability::Heartbeat => "heartbeat",
            Capability::Digital => "digital",
        }
    }

    /// Payload published to the request topic.
    pub fn request_token(self) -> &'static str {
        match self {
            Capability::Heartbeat => "ping",
            _ => "get",
        }
    }

    /// Capabilities that answer on a response topic and can be correlated.
    pub fn is_queryable(self) -> bool {
        !matches!(self, Capability::Digital)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" | "picture" => Some(Capability::Image),
            "distance" => Some(Capability::Distance),
            "heartbeat" => Some(Capability::Heartbeat),
            "digital" => Some(Capability::Digital),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Image => "image",
            Capability::Distance => "distance",
            Capability::Heartbeat => "heartbeat",
            Capability::Digital => "digital",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPair {
    pub request: String,
    pub response: String,
}

/// Point in time of a request or response. Liveness math only looks at `at`;
/// `wall_ms` is carried for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub at: Instant,
    pub wall_ms: u64,
}

impl Stamp {
    pub fn now() -> Self {
        let wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            at: Instant::now(),
            wall_ms,
        }
    }
}

impl Serialize for Stamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.wall_ms)
    }
}

/// A decoded response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Image(Vec<u8>),
    /// Centimetres, as reported by the sensor.
    Distance(f32),
    Heartbeat(String),
}

impl Reading {
    pub fn decode(capability: Capability, payload: &[u8]) -> Result<Self> {
        let malformed = |reason: String| Error::MalformedPayload { capability, reason };
        match capability {
            Capability::Image => {
                if payload.is_empty() {
                    return Err(malformed("empty image".into()));
                }
                Ok(Reading::Image(payload.to_vec()))
            }
            Capability::Distance => {
                let bytes: [u8; 4] = payload
                    .try_into()
                    .map_err(|_| malformed(format!("expected 4 bytes, got {}", payload.len())))?;
                let value = f32::from_le_bytes(bytes);
                if value.is_nan() {
                    return Err(malformed("NaN distance".into()));
                }
                Ok(Reading::Distance(value))
            }
            Capability::Heartbeat => String::from_utf8(payload.to_vec())
                .map(Reading::Heartbeat)
                .map_err(|e| malformed(e.to_string())),
            Capability::Digital => Err(malformed("digital channels do not respond".into())),
        }
    }

    pub fn summary(&self) -> ReadingSummary {
        match self {
            Reading::Image(bytes) => ReadingSummary::Image { bytes: bytes.len() },
            Reading::Distance(value) => ReadingSummary::Distance { value: *value },
            Reading::Heartbeat(reply) => ReadingSummary::Heartbeat {
                reply: reply.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadingSummary {
    Image { bytes: usize },
    Distance { value: f32 },
    Heartbeat { reply: String },
}
