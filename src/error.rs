use std::time::Duration;

use thiserror::Error;

use crate::fleet::Capability;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No response arrived inside the wait window. Reported as offline, never fatal.
    #[error("{device} did not answer {capability} within {after:?}")]
    Timeout {
        device: String,
        capability: Capability,
        after: Duration,
    },

    /// Response bytes could not be decoded for the capability they arrived on.
    #[error("malformed {capability} payload: {reason}")]
    MalformedPayload {
        capability: Capability,
        reason: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    /// Shutdown was requested while a wait was in flight.
    #[error("cancelled while waiting for {device}/{capability}")]
    Cancelled {
        device: String,
        capability: Capability,
    },

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("{device} does not support {capability}")]
    UnsupportedCapability {
        device: String,
        capability: Capability,
    },

    #[error("registry error: {0}")]
    Registry(String),

    /// Serialising a report or state body failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rumqttc::ClientError> for Error {
    fn from(e: rumqttc::ClientError) -> Self {
        Error::Transport(e.to_string())
    }
}
