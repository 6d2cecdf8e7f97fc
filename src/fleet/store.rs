use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use super::{Capability, DeviceId, Reading, Stamp};

/// Atomic view of one device+capability slot.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub requested: Option<Stamp>,
    pub responded: Option<Stamp>,
    pub reading: Option<Reading>,
    /// Sequence of the most recent request.
    pub request_seq: u64,
    /// Request sequence that was outstanding when the latest response landed.
    pub answered_seq: u64,
}

#[derive(Default)]
struct Slot {
    state: Snapshot,
    notify: Arc<Notify>,
}

/// Last known state per device and capability. The only owner of that state.
#[derive(Default)]
pub struct StateStore {
    slots: Mutex<HashMap<(DeviceId, Capability), Slot>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<(DeviceId, Capability), Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp a new request and drop whatever response was held. Must run before
    /// the request is published. Returns the request's sequence number.
    pub fn record_request(&self, device: &str, capability: Capability, at: Stamp) -> u64 {
        let mut slots = self.slots();
        let slot = slots
            .entry((device.to_string(), capability))
            .or_default();
        slot.state.requested = Some(at);
        slot.state.responded = None;
        slot.state.reading = None;
        slot.state.request_seq += 1;
        slot.state.request_seq
    }

    /// Called from the inbound delivery path. Last writer wins; never waits.
    pub fn record_response(&self, device: &str, capability: Capability, reading: Reading, at: Stamp) {
        let notify = {
            let mut slots = self.slots();
            let slot = slots
                .entry((device.to_string(), capability))
                .or_default();
            slot.state.responded = Some(at);
            slot.state.reading = Some(reading);
            slot.state.answered_seq = slot.state.request_seq;
            debug!(
                "Recorded {}/{} response (seq {})",
                device, capability, slot.state.answered_seq
            );
            slot.notify.clone()
        };
        notify.notify_waiters();
    }

    pub fn snapshot(&self, device: &str, capability: Capability) -> Snapshot {
        self.slots()
            .get(&(device.to_string(), capability))
            .map(|slot| slot.state.clone())
            .unwrap_or_default()
    }

    /// Wake-up handle signalled by every `record_response` on this slot.
    pub fn subscribe(&self, device: &str, capability: Capability) -> Arc<Notify> {
        self.slots()
            .entry((device.to_string(), capability))
            .or_default()
            .notify
            .clone()
    }
}
