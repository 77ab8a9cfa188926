use tracing::debug;

use super::types::HostTiming;

/// Rates below this (in Hz) are treated as unknown.
const MIN_RATE_HZ: f64 = 1.0;

/// Error-feedback accumulator converting a rate difference into whole skip units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateAccumulator {
    acc: i64,
}

impl RateAccumulator {
    /// Adds `excess` and emits how many whole `period`s have accumulated.
    /// A non-positive excess or period resets the accumulator.
    pub fn tick(&mut self, excess: i64, period: i64) -> u32 {
        if excess <= 0 || period <= 0 {
            self.reset();
            return 0;
        }
        self.acc += excess;
        if self.acc < period {
            return 0;
        }
        let n = self.acc / period;
        self.acc -= n * period;
        n.min(i64::from(u32::MAX)) as u32
    }

    #[inline]
    pub fn reset(&mut self) {
        self.acc = 0;
    }

    #[inline]
    pub fn value(&self) -> i64 {
        self.acc
    }
}

/// What the host should do this refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipDecision {
    /// The host refreshes faster than the guest; do not advance the engine.
    pub skip_emulation: bool,
    /// The guest runs faster than the host; run this many unpresented quanta.
    pub extra_quanta: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RateKey {
    host_millihz: i64,
    guest_millihz: i64,
    throttle: u8,
}

/// Reconciles the guest's frame rate with the host's refresh rate.
#[derive(Debug, Clone, Default)]
pub struct FrameRateConverter {
    emulation: RateAccumulator,
    render: RateAccumulator,
    key: Option<RateKey>,
}

impl FrameRateConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.emulation.reset();
        self.render.reset();
    }

    pub fn evaluate(&mut self, guest_fps: f64, timing: &HostTiming) -> SkipDecision {
        let key = RateKey {
            host_millihz: to_millihz(timing.refresh_hz),
            guest_millihz: to_millihz(guest_fps),
            throttle: timing.throttle.class(),
        };
        if self.key != Some(key) {
            if self.key.is_some() {
                debug!(
                    host = timing.refresh_hz,
                    guest = guest_fps,
                    "refresh rates changed, resetting skip accumulators"
                );
            }
            self.key = Some(key);
            self.reset();
        }

        if !timing.throttle.is_normal()
            || timing.refresh_hz < MIN_RATE_HZ
            || guest_fps < MIN_RATE_HZ
        {
            self.reset();
            return SkipDecision::default();
        }

        let period = key.host_millihz;
        let skip_emulation = self.emulation.tick(key.host_millihz - key.guest_millihz, period) > 0;
        let extra_quanta = self.render.tick(key.guest_millihz - key.host_millihz, period);
        SkipDecision {
            skip_emulation,
            extra_quanta,
        }
    }
}

fn to_millihz(hz: f64) -> i64 {
    if hz.is_finite() {
        (hz * 1000.0).round() as i64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::types::Throttle;
    use proptest::prelude::*;

    fn timing(host: f64) -> HostTiming {
        HostTiming {
            refresh_hz: host,
            ..HostTiming::default()
        }
    }

    /// Quanta produced over `ticks` host refreshes.
    fn produced(conv: &mut FrameRateConverter, guest: f64, host: f64, ticks: u32) -> i64 {
        let t = timing(host);
        (0..ticks)
            .map(|_| {
                let d = conv.evaluate(guest, &t);
                if d.skip_emulation { 0 } else { 1 + i64::from(d.extra_quanta) }
            })
            .sum()
    }

    #[test]
    fn converges_for_common_ratios() {
        let host = 60.0;
        for ratio in [0.5, 1.0, 1.5, 2.0, 1.0 / 3.0] {
            let mut conv = FrameRateConverter::new();
            let ticks = 3_000;
            let got = produced(&mut conv, host * ratio, host, ticks);
            let expected = ratio * f64::from(ticks);
            assert!(
                (got as f64 - expected).abs() <= 1.0,
                "ratio {ratio}: produced {got}, expected {expected}"
            );
        }
    }

    #[test]
    fn never_skips_both_ways() {
        let mut conv = FrameRateConverter::new();
        for guest in [30.0, 59.94, 60.0, 70.086, 144.0] {
            for _ in 0..100 {
                let d = conv.evaluate(guest, &timing(60.0));
                assert!(!(d.skip_emulation && d.extra_quanta > 0));
            }
        }
    }

    #[test]
    fn resets_on_throttle_and_bad_rates() {
        let mut conv = FrameRateConverter::new();
        conv.evaluate(30.0, &timing(60.0));
        assert!(conv.emulation.value() > 0);

        let ff = HostTiming {
            throttle: Throttle::FastForward { multiplier: 0.0 },
            ..timing(60.0)
        };
        assert_eq!(conv.evaluate(30.0, &ff), SkipDecision::default());
        assert_eq!(conv.emulation.value(), 0);

        conv.evaluate(30.0, &timing(60.0));
        assert_eq!(conv.evaluate(0.5, &timing(60.0)), SkipDecision::default());
        assert_eq!(conv.evaluate(30.0, &timing(0.0)), SkipDecision::default());
        assert_eq!(conv.emulation.value(), 0);
    }

    #[test]
    fn accumulator_emits_whole_periods() {
        let mut acc = RateAccumulator::default();
        assert_eq!(acc.tick(70, 100), 0);
        assert_eq!(acc.tick(70, 100), 1);
        assert_eq!(acc.value(), 40);
        assert_eq!(acc.tick(250, 100), 2);
        assert_eq!(acc.value(), 90);
        assert_eq!(acc.tick(0, 100), 0);
        assert_eq!(acc.value(), 0);
    }

    proptest! {
        #[test]
        fn long_run_error_is_bounded(
            host in 24.0f64..240.0,
            guest in 1.0f64..240.0,
            ticks in 1u32..2_000,
        ) {
            let mut conv = FrameRateConverter::new();
            let got = produced(&mut conv, guest, host, ticks);
            let (h, g) = ((host * 1000.0).round(), (guest * 1000.0).round());
            let expected = g / h * f64::from(ticks);
            prop_assert!((got as f64 - expected).abs() <= 1.0, "{got} vs {expected}");
        }
    }
}
