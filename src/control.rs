use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::fleet::actuator::ActuatorPanel;
use crate::fleet::correlator::Correlator;
use crate::fleet::liveness::{Verdict, Windows, evaluate, evaluate_age};
use crate::fleet::orchestrator::Orchestrator;
use crate::fleet::poller::PollFlags;
use crate::fleet::{Capability, Reading};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
    Toggle,
    /// Report the remembered state without commanding the channel.
    Query,
}

impl Switch {
    fn parse(payload: &str) -> Option<Self> {
        match payload.trim().to_ascii_lowercase().as_str() {
            "on" | "1" | "true" => Some(Switch::On),
            "off" | "0" | "false" => Some(Switch::Off),
            "toggle" | "" => Some(Switch::Toggle),
            "state" | "?" => Some(Switch::Query),
            _ => None,
        }
    }
}

/// Operator requests carried on `{prefix}/command/...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Refresh,
    /// Request a fresh value and wait for it.
    Read { device: String, capability: Capability },
    /// Report what the store holds without asking the device.
    Last { device: String, capability: Capability },
    Poll { capability: Capability, enabled: bool },
    Actuator { device: String, channel: String, switch: Switch },
    /// Publish a bare `get` to a request topic.
    Manual { topic: String },
}

/// Parse a command topic + payload.
/// Expected format: {prefix}/command/{verb}[/{args}]
pub fn parse_command(topic: &str, payload: &str, prefix: &str) -> Option<Command> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/command/")?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    match parts.as_slice() {
        ["refresh"] => Some(Command::Refresh),
        ["read", device, capability] => Some(Command::Read {
            device: device.to_string(),
            capability: Capability::parse(capability)?,
        }),
        ["last", device, capability] => Some(Command::Last {
            device: device.to_string(),
            capability: Capability::parse(capability)?,
        }),
        ["poll", capability] => {
            let enabled = match Switch::parse(payload)? {
                Switch::On => true,
                Switch::Off => false,
                Switch::Toggle | Switch::Query => return None,
            };
            Some(Command::Poll {
                capability: Capability::parse(capability)?,
                enabled,
            })
        }
        ["actuator", device, channel] => Some(Command::Actuator {
            device: device.to_string(),
            channel: channel.to_string(),
            switch: Switch::parse(payload)?,
        }),
        ["manual"] => {
            let topic = payload.trim();
            (!topic.is_empty()).then(|| Command::Manual {
                topic: topic.to_string(),
            })
        }
        _ => None,
    }
}

/// Executes operator commands and publishes their results as JSON.
pub struct Controller {
    prefix: String,
    read_timeout: Duration,
    windows: Windows,
    correlator: Correlator,
    orchestrator: Arc<Orchestrator>,
    flags: Arc<PollFlags>,
    panel: Arc<ActuatorPanel>,
}

impl Controller {
    pub fn new(
        prefix: impl Into<String>,
        read_timeout: Duration,
        windows: Windows,
        correlator: Correlator,
        orchestrator: Arc<Orchestrator>,
        flags: Arc<PollFlags>,
        panel: Arc<ActuatorPanel>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            read_timeout,
            windows,
            correlator,
            orchestrator,
            flags,
            panel,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn publish_json(&self, topic: &str, body: serde_json::Value) -> Result<()> {
        self.correlator
            .transport()
            .publish(topic, body.to_string().as_bytes())
    }

    fn state_topic(&self, device: &str, capability: Capability) -> String {
        format!("{}/state/{}/{}", self.prefix, device, capability)
    }

    fn value_json(reading: Option<&Reading>) -> serde_json::Value {
        reading
            .map(|r| serde_json::to_value(r.summary()).unwrap_or_default())
            .unwrap_or(serde_json::Value::Null)
    }

    fn state_json(
        device: &str,
        capability: Capability,
        verdict: Verdict,
        reading: Option<&Reading>,
    ) -> serde_json::Value {
        json!({
            "device": device,
            "capability": capability,
            "verdict": verdict,
            "value": Self::value_json(reading),
        })
    }

    /// Current verdict and value for one slot, as published on its state topic.
    /// While the capability is being polled the pollers' replies never match a
    /// stamped request, so freshness is judged by the reply's age instead.
    fn slot_json(&self, device: &str, capability: Capability) -> serde_json::Value {
        let snap = self.correlator.store().snapshot(device, capability);
        let window = self.windows.for_capability(capability);
        let verdict = if self.flags.enabled(capability) {
            evaluate_age(snap.responded, Instant::now(), window)
        } else {
            evaluate(snap.requested, snap.responded, window)
        };
        Self::state_json(device, capability, verdict, snap.reading.as_ref())
    }

    pub async fn handle(&self, command: Command) -> Result<()> {
        info!("Handling command {:?}", command);
        match command {
            Command::Refresh => {
                let report = self.orchestrator.refresh_all().await;
                let body = serde_json::to_value(&report)?;
                self.publish_json(&format!("{}/report", self.prefix), body)
            }
            Command::Read { device, capability } => {
                let topic = self.state_topic(&device, capability);
                match self
                    .correlator
                    .request_and_wait(&device, capability, self.read_timeout)
                    .await
                {
                    Ok(reply) => {
                        if let Reading::Image(bytes) = &reply.reading {
                            self.correlator
                                .transport()
                                .publish(&format!("{topic}/raw"), bytes)?;
                        }
                        let verdict = evaluate(
                            Some(reply.requested),
                            Some(reply.responded),
                            self.windows.for_capability(capability),
                        );
                        self.publish_json(
                            &topic,
                            Self::state_json(&device, capability, verdict, Some(&reply.reading)),
                        )
                    }
                    Err(e @ Error::Timeout { .. }) => {
                        let mut body = self.slot_json(&device, capability);
                        body["error"] = json!(e.to_string());
                        self.publish_json(&topic, body)
                    }
                    Err(e) => Err(e),
                }
            }
            Command::Last { device, capability } => {
                self.correlator.registry().topics_for(&device, capability)?;
                self.publish_json(
                    &self.state_topic(&device, capability),
                    self.slot_json(&device, capability),
                )
            }
            Command::Poll { capability, enabled } => {
                if !self.flags.set(capability, enabled) {
                    warn!("{} cannot be polled", capability);
                }
                Ok(())
            }
            Command::Actuator {
                device,
                channel,
                switch,
            } => {
                let state = match switch {
                    Switch::On => self.panel.set_state(&device, &channel, true)?,
                    Switch::Off => self.panel.set_state(&device, &channel, false)?,
                    Switch::Toggle => self.panel.toggle(&device, &channel)?,
                    Switch::Query => {
                        self.correlator.registry().command_topic(&device, &channel)?;
                        self.panel.state(&device, &channel)
                    }
                };
                self.publish_json(
                    &format!("{}/state/{}/{}", self.prefix, device, channel),
                    json!({ "state": state }),
                )
            }
            Command::Manual { topic } => {
                if !self.correlator.registry().is_request_topic(&topic) {
                    warn!("Refusing manual publish to unregistered topic {}", topic);
                    return Ok(());
                }
                self.correlator.transport().publish(&topic, b"get")
            }
        }
    }
}
