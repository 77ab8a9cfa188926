use std::time::{Duration, Instant};

use tracing::warn;

const OVERLOAD_FRAMES: u32 = 200;
const OVERLOAD_WINDOW: Duration = Duration::from_secs(10);

/// Detects sustained emulated-CPU overload.
///
/// The engine marks a quantum overloaded when it could not reach its cycle
/// target within the budget. Enough of those in a short window means the host
/// cannot keep up with the configured rate.
#[derive(Debug, Clone, Default)]
pub struct OverloadMonitor {
    count: u32,
    window_start: Option<Instant>,
}

impl OverloadMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the host should be told about the overload.
    pub fn record(&mut self, overloaded: bool, relaxed: bool, now: Instant) -> bool {
        if relaxed {
            self.reset();
            return false;
        }
        if !overloaded {
            return false;
        }
        let start = *self.window_start.get_or_insert(now);
        self.count += 1;
        if self.count < OVERLOAD_FRAMES {
            return false;
        }
        let elapsed = now.saturating_duration_since(start);
        self.reset();
        if elapsed > OVERLOAD_WINDOW {
            return false;
        }
        warn!(
            frames = OVERLOAD_FRAMES,
            secs = elapsed.as_secs_f32(),
            "emulated CPU is overloaded"
        );
        true
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.window_start = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_burst_then_restarts() {
        let mut m = OverloadMonitor::new();
        let t0 = Instant::now();
        let fired: Vec<bool> = (0..400)
            .map(|i| m.record(true, false, t0 + Duration::from_millis(i * 16)))
            .collect();
        assert_eq!(fired.iter().filter(|f| **f).count(), 2);
        assert!(fired[199]);
        assert!(fired[399]);
    }

    #[test]
    fn slow_trickle_does_not_fire() {
        let mut m = OverloadMonitor::new();
        let t0 = Instant::now();
        let fired = (0..200).any(|i| m.record(true, false, t0 + Duration::from_millis(i * 100)));
        assert!(!fired);
        assert_eq!(m.count, 0);
    }

    #[test]
    fn relaxed_frames_reset_the_count() {
        let mut m = OverloadMonitor::new();
        let t0 = Instant::now();
        for _ in 0..150 {
            m.record(true, false, t0);
        }
        m.record(false, true, t0);
        assert!(!(0..150).any(|_| m.record(true, false, t0)));
    }
}
