//! Quorumcast server -- heartbeat failure detector.
//!
//! Piggybacks on the discovery beacon tick: each tick the node probes
//! its left neighbor, and declares it crashed when no ack arrived for a
//! full timeout window. Detection re-arms only after a fresh ack, so a
//! single silent neighbor produces one crash notice, not a storm.

use tokio::time::{Duration, Instant};

use crate::protocol::ServerId;
use crate::server::ring::RingView;

/// Failure detector bookkeeping.
#[derive(Debug)]
pub struct HeartbeatState {
    /// Last time an ack (or quiescence) refreshed the detector.
    pub last_beat: Instant,

    /// Whether an ack has been seen since the previous declared crash.
    pub ack_received: bool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    pub fn new() -> Self {
        HeartbeatState {
            last_beat: Instant::now(),
            ack_received: true,
        }
    }

    /// Refreshes the detector, e.g. on a received ack.
    pub fn touch(&mut self, now: Instant) {
        self.last_beat = now;
        self.ack_received = true;
    }
}

/// What the detector decided this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HeartbeatVerdict {
    /// No real neighbor to watch; detector idles.
    Quiescent,
    /// Probe the left neighbor with a heartbeat.
    Probe(ServerId),
    /// The left neighbor missed a full timeout window: declare it dead.
    Crashed(ServerId),
}

/// Runs one detector tick against the current ring view.
pub(crate) fn detector_tick(
    view: &RingView,
    hb: &mut HeartbeatState,
    now: Instant,
    timeout: Duration,
) -> HeartbeatVerdict {
    let left = match view.left.as_ref() {
        Some(left) if *left != view.me => left.clone(),
        _ => {
            // alone in the ring: keep the detector fresh
            hb.touch(now);
            return HeartbeatVerdict::Quiescent;
        }
    };

    if now.duration_since(hb.last_beat) > timeout && hb.ack_received {
        hb.ack_received = false;
        return HeartbeatVerdict::Crashed(left);
    }
    HeartbeatVerdict::Probe(left)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(3);

    #[test]
    fn quiescent_when_alone() {
        let view = RingView::new("a:1".into());
        let mut hb = HeartbeatState::new();
        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(
            detector_tick(&view, &mut hb, later, TIMEOUT),
            HeartbeatVerdict::Quiescent
        );
        // quiescence refreshed the window
        assert_eq!(hb.last_beat, later);
        assert!(hb.ack_received);
    }

    #[test]
    fn probes_healthy_neighbor() {
        let mut view = RingView::new("a:1".into());
        view.add("b:2");
        let mut hb = HeartbeatState::new();
        assert_eq!(
            detector_tick(&view, &mut hb, Instant::now(), TIMEOUT),
            HeartbeatVerdict::Probe("b:2".into())
        );
    }

    #[test]
    fn declares_crash_after_timeout() {
        let mut view = RingView::new("a:1".into());
        view.add("b:2");
        let mut hb = HeartbeatState::new();
        let start = Instant::now();
        hb.last_beat = start;

        let late = start + TIMEOUT + Duration::from_millis(1);
        assert_eq!(
            detector_tick(&view, &mut hb, late, TIMEOUT),
            HeartbeatVerdict::Crashed("b:2".into())
        );
        // no second declaration until a fresh ack arrives
        assert_eq!(
            detector_tick(&view, &mut hb, late, TIMEOUT),
            HeartbeatVerdict::Probe("b:2".into())
        );
        hb.touch(late);
        let later = late + TIMEOUT + Duration::from_millis(1);
        assert_eq!(
            detector_tick(&view, &mut hb, later, TIMEOUT),
            HeartbeatVerdict::Crashed("b:2".into())
        );
    }

    #[test]
    fn ack_within_window_keeps_probing() {
        let mut view = RingView::new("a:1".into());
        view.add("b:2");
        let mut hb = HeartbeatState::new();
        let start = Instant::now();
        hb.last_beat = start;
        let almost = start + TIMEOUT - Duration::from_millis(1);
        assert_eq!(
            detector_tick(&view, &mut hb, almost, TIMEOUT),
            HeartbeatVerdict::Probe("b:2".into())
        );
    }
}
