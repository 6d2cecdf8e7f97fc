use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::registry::Registry;
use super::store::StateStore;
use super::transport::Transport;
use super::{Capability, Reading, Stamp};
use crate::error::{Error, Result};

/// A correlated response together with the stamps it was matched under, read
/// from the slot in the same snapshot as the reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub reading: Reading,
    pub requested: Stamp,
    pub responded: Stamp,
}

/// Issues a request for one device capability and waits for the reply that follows it.
#[derive(Clone)]
pub struct Correlator {
    registry: Arc<Registry>,
    store: Arc<StateStore>,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
}

impl Correlator {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<StateStore>,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            store,
            transport,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Clear the slot, publish the request, then wait up to `timeout` for a response
    /// recorded after that request. On timeout the request stamp stays in the store.
    pub async fn request_and_wait(
        &self,
        device: &str,
        capability: Capability,
        timeout: Duration,
    ) -> Result<Reply> {
        let topics = self.registry.topics_for(device, capability)?;
        let notify = self.store.subscribe(device, capability);

        // Clear before publish: a reply racing the publish must not be wiped.
        let seq = self.store.record_request(device, capability, Stamp::now());
        if let Err(e) = self
            .transport
            .publish(&topics.request, capability.request_token().as_bytes())
        {
            warn!("Failed to publish {}: {}", topics.request, e);
            return Err(e);
        }
        debug!("Sent {} (seq {}), waiting {:?}", topics.request, seq, timeout);

        let deadline = Instant::now() + timeout;
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let snap = self.store.snapshot(device, capability);
            if snap.answered_seq >= seq {
                if let (Some(reading), Some(requested), Some(responded)) =
                    (snap.reading, snap.requested, snap.responded)
                {
                    return Ok(Reply {
                        reading,
                        requested,
                        responded,
                    });
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("{}/{} timed out after {:?}", device, capability, timeout);
                    return Err(Error::Timeout {
                        device: device.to_string(),
                        capability,
                        after: timeout,
                    });
                }
                _ = self.shutdown.cancelled() => {
                    return Err(Error::Cancelled {
                        device: device.to_string(),
                        capability,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::DeviceClass;
    use crate::fleet::liveness::{Verdict, evaluate};
    use crate::fleet::registry::DeviceSpec;
    use crate::fleet::transport::testing::FakeBus;

    fn setup() -> (Correlator, Arc<FakeBus>, Arc<StateStore>, CancellationToken) {
        let registry = Arc::new(
            Registry::new(vec![
                DeviceSpec::new("CAM_1", DeviceClass::Camera),
                DeviceSpec::new("WLEVEL_1", DeviceClass::DistanceSensor),
            ])
            .unwrap(),
        );
        let store = Arc::new(StateStore::new());
        let bus = FakeBus::new();
        bus.attach(store.clone());
        let shutdown = CancellationToken::new();
        let correlator = Correlator::new(registry, store.clone(), bus.clone(), shutdown.clone());
        (correlator, bus, store, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn returns_reply_recorded_after_request() {
        let (correlator, bus, _, _) = setup();
        bus.reply("WLEVEL_1", Capability::Distance, Duration::from_millis(200), 12.34f32.to_le_bytes());

        let reply = correlator
            .request_and_wait("WLEVEL_1", Capability::Distance, Duration::from_secs(4))
            .await
            .unwrap();
        assert_eq!(reply.reading, Reading::Distance(12.34));
        assert!(reply.responded.at >= reply.requested.at + Duration::from_millis(200));
        assert_eq!(bus.published(), vec![("WLEVEL_1/distance/request".to_string(), b"get".to_vec())]);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_at_1900ms_is_ack_and_2100ms_is_offline() {
        let window = Duration::from_secs(2);

        let (correlator, bus, store, _) = setup();
        bus.reply("CAM_1", Capability::Image, Duration::from_millis(1900), vec![0xff, 0xd8]);
        let reply = correlator
            .request_and_wait("CAM_1", Capability::Image, window)
            .await
            .unwrap();
        assert!(matches!(
            evaluate(Some(reply.requested), Some(reply.responded), window),
            Verdict::Ack(_)
        ));

        let (correlator, bus, store, _) = setup();
        bus.reply("CAM_1", Capability::Image, Duration::from_millis(2100), vec![0xff, 0xd8]);
        let got = correlator.request_and_wait("CAM_1", Capability::Image, window).await;
        assert!(matches!(got, Err(Error::Timeout { .. })));
        let snap = store.snapshot("CAM_1", Capability::Image);
        assert!(snap.requested.is_some());
        assert_eq!(evaluate(snap.requested, snap.responded, window), Verdict::Offline(None));

        // The late reply still lands and is judged outside the window.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let snap = store.snapshot("CAM_1", Capability::Image);
        assert!(matches!(
            evaluate(snap.requested, snap.responded, window),
            Verdict::Offline(Some(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_reply_is_not_returned() {
        let (correlator, _, store, _) = setup();
        store.record_request("CAM_1", Capability::Heartbeat, Stamp::now());
        store.record_response(
            "CAM_1",
            Capability::Heartbeat,
            Reading::Heartbeat("old".into()),
            Stamp::now(),
        );

        let got = correlator
            .request_and_wait("CAM_1", Capability::Heartbeat, Duration::from_secs(4))
            .await;
        assert!(matches!(got, Err(Error::Timeout { .. })));
        assert!(store.snapshot("CAM_1", Capability::Heartbeat).reading.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_propagates() {
        let (correlator, bus, store, _) = setup();
        bus.fail_publishes(true);
        let got = correlator
            .request_and_wait("CAM_1", Capability::Heartbeat, Duration::from_secs(4))
            .await;
        assert!(matches!(got, Err(Error::Transport(_))));
        assert!(store.snapshot("CAM_1", Capability::Heartbeat).requested.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_capability_is_rejected_without_publishing() {
        let (correlator, bus, _, _) = setup();
        let got = correlator
            .request_and_wait("CAM_1", Capability::Distance, Duration::from_secs(1))
            .await;
        assert!(matches!(got, Err(Error::UnsupportedCapability { .. })));
        assert!(bus.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_wait() {
        let (correlator, _, _, shutdown) = setup();
        let started = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            shutdown.cancel();
        });
        let got = correlator
            .request_and_wait("CAM_1", Capability::Heartbeat, Duration::from_secs(4))
            .await;
        assert!(matches!(got, Err(Error::Cancelled { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    /// Answers inside `publish`, before the correlator gets control back.
    struct InstantEcho {
        store: Arc<StateStore>,
    }

    impl Transport for InstantEcho {
        fn publish(&self, _topic: &str, _payload: &[u8]) -> Result<()> {
            self.store.record_response(
                "CAM_1",
                Capability::Heartbeat,
                Reading::Heartbeat("pong".into()),
                Stamp::now(),
            );
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reply_recorded_during_publish_is_kept() {
        let registry = Arc::new(
            Registry::new(vec![DeviceSpec::new("CAM_1", DeviceClass::Camera)]).unwrap(),
        );
        let store = Arc::new(StateStore::new());
        let echo = Arc::new(InstantEcho {
            store: store.clone(),
        });
        let correlator = Correlator::new(registry, store.clone(), echo, CancellationToken::new());

        let reply = correlator
            .request_and_wait("CAM_1", Capability::Heartbeat, Duration::from_secs(4))
            .await
            .unwrap();
        assert_eq!(reply.reading, Reading::Heartbeat("pong".into()));
        let snap = store.snapshot("CAM_1", Capability::Heartbeat);
        assert_eq!(snap.answered_seq, snap.request_seq);
        assert_eq!(snap.reading, Some(Reading::Heartbeat("pong".into())));
    }
}
