use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::registry::Registry;
use super::store::StateStore;
use super::{Capability, DeviceId, Reading, Stamp};

/// Inbound side of the bus: turns response messages into store writes.
/// Runs on the transport's delivery task, so it only decodes and records.
pub struct ResponseRouter {
    routes: HashMap<String, (DeviceId, Capability)>,
    store: Arc<StateStore>,
}

impl ResponseRouter {
    pub fn new(registry: &Registry, store: Arc<StateStore>) -> Self {
        Self {
            routes: registry.response_routes(),
            store,
        }
    }

    /// Topics to subscribe to.
    pub fn topics(&self) -> impl Iterator<Item = &str> + '_ {
        self.routes.keys().map(String::as_str)
    }

    /// Returns false if the topic is not a known response topic.
    pub fn on_message(&self, topic: &str, payload: &[u8]) -> bool {
        let Some((device, capability)) = self.routes.get(topic) else {
            return false;
        };
        match Reading::decode(*capability, payload) {
            Ok(reading) => {
                debug!("Response on {} ({} bytes)", topic, payload.len());
                self.store
                    .record_response(device, *capability, reading, Stamp::now());
            }
            // Prior state stays untouched.
            Err(e) => warn!("Dropping message on {}: {}", topic, e),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::DeviceClass;
    use crate::fleet::registry::DeviceSpec;

    fn router() -> (ResponseRouter, Arc<StateStore>) {
        let registry = Registry::new(vec![
            DeviceSpec::new("CAM_1", DeviceClass::Camera),
            DeviceSpec::new("WLEVEL_1", DeviceClass::DistanceSensor),
        ])
        .unwrap();
        let store = Arc::new(StateStore::new());
        (ResponseRouter::new(&registry, store.clone()), store)
    }

    #[test]
    fn records_decoded_responses() {
        let (router, store) = router();
        assert!(router.on_message("WLEVEL_1/distance/response", &12.34f32.to_le_bytes()));
        let snap = store.snapshot("WLEVEL_1", Capability::Distance);
        assert_eq!(snap.reading, Some(Reading::Distance(12.34)));
        assert!(snap.responded.is_some());
    }

    #[test]
    fn malformed_payload_keeps_prior_state() {
        let (router, store) = router();
        router.on_message("WLEVEL_1/distance/response", &1.5f32.to_le_bytes());
        let before = store.snapshot("WLEVEL_1", Capability::Distance).responded;

        assert!(router.on_message("WLEVEL_1/distance/response", b"garbage"));
        let snap = store.snapshot("WLEVEL_1", Capability::Distance);
        assert_eq!(snap.reading, Some(Reading::Distance(1.5)));
        assert_eq!(snap.responded, before);
    }

    #[test]
    fn ignores_unknown_topics() {
        let (router, store) = router();
        assert!(!router.on_message("CAM_1/picture/request", b"get"));
        assert!(!router.on_message("CAM_9/picture/response", b"\xff"));
        assert!(store.snapshot("CAM_1", Capability::Image).reading.is_none());
    }

    #[test]
    fn subscribes_to_every_response_topic() {
        let (router, _) = router();
        let mut topics: Vec<_> = router.topics().collect();
        topics.sort();
        assert_eq!(
            topics,
            [
                "CAM_1/heartbeat/response",
                "CAM_1/picture/response",
                "WLEVEL_1/distance/response",
                "WLEVEL_1/heartbeat/response",
            ]
        );
    }
}
