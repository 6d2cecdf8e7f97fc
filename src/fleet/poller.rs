use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Capability;
use super::registry::Registry;
use super::transport::Transport;

/// Continuous-poll switches, one per pollable capability. All start off.
#[derive(Debug, Default)]
pub struct PollFlags {
    image: AtomicBool,
    distance: AtomicBool,
    heartbeat: AtomicBool,
}

impl PollFlags {
    fn flag(&self, capability: Capability) -> Option<&AtomicBool> {
        match capability {
            Capability::Image => Some(&self.image),
            Capability::Distance => Some(&self.distance),
            Capability::Heartbeat => Some(&self.heartbeat),
            Capability::Digital => None,
        }
    }

    /// Returns false if the capability cannot be polled.
    pub fn set(&self, capability: Capability, enabled: bool) -> bool {
        match self.flag(capability) {
            Some(flag) => {
                flag.store(enabled, Ordering::Relaxed);
                info!(
                    "Continuous {} polling {}",
                    capability,
                    if enabled { "started" } else { "stopped" }
                );
                true
            }
            None => false,
        }
    }

    pub fn enabled(&self, capability: Capability) -> bool {
        self.flag(capability)
            .is_some_and(|f| f.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollPeriods {
    pub image: Duration,
    pub distance: Duration,
    pub heartbeat: Duration,
}

impl Default for PollPeriods {
    fn default() -> Self {
        Self {
            image: Duration::from_millis(500),
            distance: Duration::from_millis(500),
            heartbeat: Duration::from_secs(2),
        }
    }
}

/// Publish one request per device with `capability`. Errors are logged, never returned.
fn poll_once(registry: &Registry, transport: &dyn Transport, capability: Capability) {
    for device in registry.with_capability(capability) {
        let Ok(topics) = registry.topics_for(&device.id, capability) else {
            continue;
        };
        if let Err(e) = transport.publish(&topics.request, capability.request_token().as_bytes()) {
            warn!("Poll publish to {} failed: {}", topics.request, e);
        }
    }
}

/// Start one repeating task per pollable capability. Pollers only publish; they
/// never wait on replies or touch request bookkeeping.
pub fn spawn_pollers(
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    flags: Arc<PollFlags>,
    periods: PollPeriods,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    [
        (Capability::Distance, periods.distance),
        (Capability::Heartbeat, periods.heartbeat),
        (Capability::Image, periods.image),
    ]
    .into_iter()
    .filter(|(capability, _)| registry.with_capability(*capability).next().is_some())
    .map(|(capability, period)| {
        let registry = registry.clone();
        let transport = transport.clone();
        let flags = flags.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if flags.enabled(capability) {
                            poll_once(&registry, transport.as_ref(), capability);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            info!("{} poller stopped", capability);
        })
    })
    .collect()
}
