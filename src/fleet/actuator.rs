use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use super::registry::Registry;
use super::transport::Transport;
use crate::error::Result;

/// Fire-and-forget digital outputs. The commanded value is remembered here;
/// the device never confirms it.
pub struct ActuatorPanel {
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    commanded: Mutex<HashMap<(String, String), bool>>,
}

impl ActuatorPanel {
    pub fn new(registry: Arc<Registry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
            commanded: Mutex::new(HashMap::new()),
        }
    }

    /// Last commanded value; channels start off.
    pub fn state(&self, device: &str, channel: &str) -> bool {
        self.commanded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(device.to_string(), channel.to_string()))
            .copied()
            .unwrap_or(false)
    }

    /// Publish `on` to the channel and remember it. Returns the new state.
    pub fn set_state(&self, device: &str, channel: &str, on: bool) -> Result<bool> {
        let topic = self.registry.command_topic(device, channel)?;
        // Hold the lock across publish so concurrent toggles apply in order.
        let mut commanded = self.commanded.lock().unwrap_or_else(PoisonError::into_inner);
        self.transport.publish(&topic, if on { b"1" } else { b"0" })?;
        commanded.insert((device.to_string(), channel.to_string()), on);
        info!("{} {} -> {}", device, channel, if on { "on" } else { "off" });
        Ok(on)
    }

    /// Flip the remembered value and publish it.
    pub fn toggle(&self, device: &str, channel: &str) -> Result<bool> {
        let topic = self.registry.command_topic(device, channel)?;
        let mut commanded = self.commanded.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (device.to_string(), channel.to_string());
        let next = !commanded.get(&key).copied().unwrap_or(false);
        self.transport.publish(&topic, if next { b"1" } else { b"0" })?;
        commanded.insert(key, next);
        info!("{} {} toggled -> {}", device, channel, if next { "on" } else { "off" });
        Ok(next)
    }
}
