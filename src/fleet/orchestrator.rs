use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use super::correlator::Correlator;
use super::liveness::{Verdict, Windows, evaluate};
use super::registry::Device;
use super::{Capability, DeviceClass, DeviceId, ReadingSummary};
use crate::error::Error;

#[derive(Debug, Clone, Copy)]
pub struct RefreshSettings {
    /// Bounded wait for each request/response step.
    pub step_timeout: Duration,
    /// Pause between consecutive steps and devices.
    pub settle_delay: Duration,
    pub windows: Windows,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(4),
            settle_delay: Duration::from_millis(200),
            windows: Windows::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub capability: Capability,
    #[serde(flatten)]
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading: Option<ReadingSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device: DeviceId,
    pub class: DeviceClass,
    /// Heartbeat verdict, the device's overall liveness.
    pub status: Verdict,
    pub steps: Vec<StepReport>,
}

#[cfg(test)]
impl DeviceReport {
    pub fn step(&self, capability: Capability) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.capability == capability)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub devices: Vec<DeviceReport>,
    pub elapsed_ms: u64,
    /// False when shutdown cut the sweep short.
    pub complete: bool,
}

#[cfg(test)]
impl RefreshReport {
    pub fn device(&self, id: &str) -> Option<&DeviceReport> {
        self.devices.iter().find(|d| d.device == id)
    }
}

/// Heartbeat first, then whatever the device can be asked for. Actuators only
/// get a heartbeat; their outputs are commanded, not read back.
fn plan(device: &Device) -> Vec<Capability> {
    let mut steps: Vec<Capability> = device
        .capabilities
        .iter()
        .copied()
        .filter(|c| c.is_queryable())
        .collect();
    steps.sort_by_key(|c| *c != Capability::Heartbeat);
    steps
}

/// Sequential sweep over every registered device.
pub struct Orchestrator {
    correlator: Correlator,
    settings: RefreshSettings,
    running: Mutex<()>,
}

impl Orchestrator {
    pub fn new(correlator: Correlator, settings: RefreshSettings) -> Self {
        Self {
            correlator,
            settings,
            running: Mutex::new(()),
        }
    }

    /// Upper bound on one `refresh_all`: every step times out and every settle
    /// delay is taken.
    pub fn worst_case(&self) -> Duration {
        let mut total = Duration::ZERO;
        for (i, device) in self.correlator.registry().devices().iter().enumerate() {
            if i > 0 {
                total += self.settings.settle_delay;
            }
            for (j, _) in plan(device).iter().enumerate() {
                if j > 0 {
                    total += self.settings.settle_delay;
                }
                total += self.settings.step_timeout;
            }
        }
        total
    }

    /// Re-correlate every device in registry order. One sweep at a time; a dead
    /// device costs at most its step timeouts and never fails the sweep.
    pub async fn refresh_all(&self) -> RefreshReport {
        let _guard = self.running.lock().await;
        let started = Instant::now();
        info!("Refreshing {} devices", self.correlator.registry().devices().len());

        let mut devices = Vec::new();
        let mut complete = true;
        for (i, device) in self.correlator.registry().devices().iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.settle_delay).await;
            }
            let (report, cancelled) = self.refresh_device(device).await;
            info!("{}: {}", report.device, report.status.label());
            devices.push(report);
            if cancelled {
                complete = false;
                break;
            }
        }

        let elapsed = started.elapsed();
        info!("Refresh finished in {:?}", elapsed);
        RefreshReport {
            devices,
            elapsed_ms: elapsed.as_millis() as u64,
            complete,
        }
    }

    async fn refresh_device(&self, device: &Device) -> (DeviceReport, bool) {
        let mut steps = Vec::new();
        let mut cancelled = false;
        for (i, capability) in plan(device).into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.settle_delay).await;
            }
            let (step, was_cancelled) = self.step(&device.id, capability).await;
            steps.push(step);
            if was_cancelled {
                cancelled = true;
                break;
            }
        }

        let status = steps
            .iter()
            .find(|s| s.capability == Capability::Heartbeat)
            .or(steps.first())
            .map(|s| s.verdict)
            .unwrap_or(Verdict::Offline(None));

        let report = DeviceReport {
            device: device.id.clone(),
            class: device.class,
            status,
            steps,
        };
        (report, cancelled)
    }

    async fn step(&self, device: &str, capability: Capability) -> (StepReport, bool) {
        match self
            .correlator
            .request_and_wait(device, capability, self.settings.step_timeout)
            .await
        {
            Ok(reply) => {
                let window = self.settings.windows.for_capability(capability);
                let step = StepReport {
                    capability,
                    verdict: evaluate(Some(reply.requested), Some(reply.responded), window),
                    reading: Some(reply.reading.summary()),
                    error: None,
                };
                (step, false)
            }
            Err(e) => {
                warn!("{}/{}: {}", device, capability, e);
                let cancelled = matches!(e, Error::Cancelled { .. });
                let responded = self.correlator.store().snapshot(device, capability).responded;
                let step = StepReport {
                    capability,
                    verdict: Verdict::Offline(responded),
                    reading: None,
                    error: Some(e.to_string()),
                };
                (step, cancelled)
            }
        }
    }
}
