use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::{Capability, Stamp};

/// Ack/offline classification of a device's latest response against its latest request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "at", rename_all = "snake_case")]
pub enum Verdict {
    Ack(Stamp),
    Offline(Option<Stamp>),
}

impl Verdict {
    #[cfg(test)]
    pub fn is_ack(&self) -> bool {
        matches!(self, Verdict::Ack(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Ack(_) => "ack",
            Verdict::Offline(_) => "offline",
        }
    }
}

/// A response counts only if it landed at or after the request and inside `window`.
/// A response older than the request is stale and reads as offline.
pub fn evaluate(requested: Option<Stamp>, responded: Option<Stamp>, window: Duration) -> Verdict {
    let (Some(requested), Some(responded)) = (requested, responded) else {
        return Verdict::Offline(None);
    };
    match responded.at.checked_duration_since(requested.at) {
        Some(delta) if delta < window => Verdict::Ack(responded),
        _ => Verdict::Offline(Some(responded)),
    }
}

/// Judge a response by its age alone. Used while continuous polling is on,
/// since pollers answer requests the store never stamped.
pub fn evaluate_age(responded: Option<Stamp>, now: Instant, window: Duration) -> Verdict {
    let Some(responded) = responded else {
        return Verdict::Offline(None);
    };
    match now.checked_duration_since(responded.at) {
        Some(age) if age < window => Verdict::Ack(responded),
        _ => Verdict::Offline(Some(responded)),
    }
}

/// Per-capability liveness windows.
#[derive(Debug, Clone, Copy)]
pub struct Windows {
    pub heartbeat: Duration,
    pub image: Duration,
    pub distance: Duration,
}

impl Default for Windows {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(8),
            image: Duration::from_secs(2),
            distance: Duration::from_secs(3),
        }
    }
}

impl Windows {
    pub fn for_capability(&self, capability: Capability) -> Duration {
        match capability {
            Capability::Heartbeat => self.heartbeat,
            Capability::Image => self.image,
            Capability::Distance => self.distance,
            Capability::Digital => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(base: Instant, offset_ms: u64) -> Stamp {
        Stamp {
            at: base + Duration::from_millis(offset_ms),
            wall_ms: offset_ms,
        }
    }

    const WINDOW: Duration = Duration::from_secs(2);

    #[test]
    fn missing_timestamps_are_offline_without_time() {
        let base = Instant::now();
        assert_eq!(evaluate(None, None, WINDOW), Verdict::Offline(None));
        assert_eq!(evaluate(Some(stamp(base, 0)), None, WINDOW), Verdict::Offline(None));
        assert_eq!(evaluate(None, Some(stamp(base, 0)), WINDOW), Verdict::Offline(None));
    }

    #[test]
    fn ack_inside_window() {
        let base = Instant::now();
        let resp = stamp(base, 1900);
        assert_eq!(evaluate(Some(stamp(base, 0)), Some(resp), WINDOW), Verdict::Ack(resp));
    }

    #[test]
    fn zero_delta_is_ack() {
        let base = Instant::now();
        let at = stamp(base, 0);
        assert!(evaluate(Some(at), Some(at), WINDOW).is_ack());
    }

    #[test]
    fn window_edge_is_offline() {
        let base = Instant::now();
        let resp = stamp(base, 2000);
        assert_eq!(
            evaluate(Some(stamp(base, 0)), Some(resp), WINDOW),
            Verdict::Offline(Some(resp))
        );
        assert!(!evaluate(Some(stamp(base, 0)), Some(stamp(base, 2100)), WINDOW).is_ack());
    }

    #[test]
    fn stale_response_before_request_is_offline() {
        let base = Instant::now();
        let resp = stamp(base, 100);
        let req = stamp(base, 500);
        assert_eq!(evaluate(Some(req), Some(resp), WINDOW), Verdict::Offline(Some(resp)));
    }

    #[test]
    fn age_verdict_tracks_reply_age() {
        let base = Instant::now();
        let resp = stamp(base, 1000);
        assert_eq!(evaluate_age(None, base, WINDOW), Verdict::Offline(None));
        assert_eq!(
            evaluate_age(Some(resp), base + Duration::from_millis(2900), WINDOW),
            Verdict::Ack(resp)
        );
        assert_eq!(
            evaluate_age(Some(resp), base + Duration::from_millis(3000), WINDOW),
            Verdict::Offline(Some(resp))
        );
    }

    #[test]
    fn serializes_with_status_tag() {
        let base = Instant::now();
        let json = serde_json::to_value(Verdict::Ack(stamp(base, 42))).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ack", "at": 42}));
        let json = serde_json::to_value(Verdict::Offline(None)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "offline", "at": null}));
    }
}
