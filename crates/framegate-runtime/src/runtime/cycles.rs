use tracing::debug;

use super::types::{CycleConfig, HostTiming, ModeSignature, Throttle};

const HISTORY: usize = 8;
const RECOMPUTE_EVERY: usize = 4;
const UNITY: u64 = 1024;
const MAX_RATIO: u64 = 16 * UNITY;
const FAST_MAX_RATIO: u64 = 5 * UNITY;
const DAMPING_THRESHOLD: u64 = 800;
const OUTLIER_FACTOR: u64 = 3;
/// Cycles per microsecond of observed emulator time the rate may never exceed.
const SAFETY_CYCLES_PER_MICRO: u64 = 280;
const SLOW_MOTION_DEFAULT: f64 = 0.5;

/// One completed quantum as measured by the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSample {
    pub cycles_issued: u64,
    /// Issued cycles minus those the engine reported as I/O or instrumentation inflation.
    pub real_cycles: u64,
    /// Wall time spent executing, excluding time blocked on the gate.
    pub emulator_micros: u64,
    /// Host frame time for the refresh that consumed this quantum.
    pub frame_micros: u64,
}

/// Everything besides the sample itself that decides whether to adjust.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PacingContext {
    pub mode: ModeSignature,
    pub timing: HostTiming,
    /// The engine runs in its extended (protected) execution mode.
    pub extended_mode: bool,
}

/// Rolling-window feedback loop choosing the engine's cycle rate in cycles per
/// emulated millisecond.
#[derive(Debug, Clone)]
pub struct CycleController {
    config: CycleConfig,
    rate: u32,
    /// Rate to restore when a fast-forward or slow-motion override ends.
    steady_rate: u32,
    overriding: bool,
    history: [CycleSample; HISTORY],
    cursor: usize,
    /// Samples recorded since the last reset.
    recorded: usize,
    mode: Option<ModeSignature>,
}

impl CycleController {
    pub fn new(config: CycleConfig) -> Self {
        let rate = config
            .initial_rate
            .max(config.floor_baseline.min(config.floor_extended))
            .min(config.max_rate.max(1));
        Self {
            config,
            rate,
            steady_rate: rate,
            overriding: false,
            history: [CycleSample::default(); HISTORY],
            cursor: 0,
            recorded: 0,
            mode: None,
        }
    }

    #[inline]
    pub fn rate(&self) -> u32 {
        self.rate
    }

    #[inline]
    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    /// Cycles to issue for a quantum covering `quantum_ms` emulated milliseconds.
    pub fn quantum_cycles(&self, quantum_ms: f64) -> u64 {
        (f64::from(self.rate) * quantum_ms.max(0.0)).round() as u64
    }

    /// Clears the sample window.
    pub fn reset_history(&mut self) {
        self.cursor = 0;
        self.recorded = 0;
    }

    /// Records a completed quantum and returns the new rate if it changed.
    pub fn record(&mut self, sample: CycleSample, ctx: &PacingContext) -> Option<u32> {
        let previous = self.rate;

        match ctx.timing.throttle {
            Throttle::FastForward { multiplier } => {
                let factor = if multiplier.is_finite() && multiplier > 1.0 {
                    f64::from(multiplier)
                } else {
                    f64::from(self.config.fast_forward_multiplier)
                };
                self.apply_override(factor, ctx.extended_mode);
                return self.changed(previous, "fast-forward");
            }
            Throttle::SlowMotion { multiplier } => {
                let m = f64::from(multiplier);
                let factor = if !m.is_finite() || m <= 0.0 {
                    SLOW_MOTION_DEFAULT
                } else if m > 1.0 {
                    1.0 / m
                } else {
                    m
                };
                self.apply_override(factor, ctx.extended_mode);
                return self.changed(previous, "slow-motion");
            }
            _ if self.overriding => {
                self.overriding = false;
                self.rate = self.steady_rate;
                self.reset_history();
                return self.changed(previous, "override ended");
            }
            _ => {}
        }

        if !self.config.enabled || !ctx.timing.throttle.is_normal() || ctx.timing.tampered {
            self.reset_history();
            return None;
        }
        if self.mode != Some(ctx.mode) {
            if self.mode.is_some() {
                debug!(mode = ?ctx.mode, "mode changed, discarding cycle history");
            }
            self.mode = Some(ctx.mode);
            self.reset_history();
            return None;
        }

        self.history[self.cursor] = sample;
        self.cursor = (self.cursor + 1) % HISTORY;
        self.recorded += 1;
        if self.recorded % RECOMPUTE_EVERY != 0 {
            return None;
        }

        let next = self.recompute(ctx)?;
        self.rate = next;
        self.steady_rate = next;
        self.changed(previous, "feedback")
    }

    fn apply_override(&mut self, factor: f64, extended: bool) {
        if !self.overriding {
            self.overriding = true;
            self.steady_rate = self.rate;
        }
        let scaled = (f64::from(self.steady_rate) * factor).round();
        let floor = self.floor(extended);
        self.rate = (scaled.min(f64::from(u32::MAX)) as u32)
            .min(self.config.max_rate)
            .max(floor);
        self.reset_history();
    }

    fn changed(&mut self, previous: u32, reason: &'static str) -> Option<u32> {
        if self.rate == previous {
            return None;
        }
        debug!(from = previous, to = self.rate, reason, "cycle rate changed");
        // A new rate invalidates the timing of samples taken at the old one.
        self.reset_history();
        Some(self.rate)
    }

    fn floor(&self, extended: bool) -> u32 {
        if extended {
            self.config.floor_extended
        } else {
            self.config.floor_baseline
        }
    }

    /// Budget for one quantum in microseconds.
    ///
    /// The frame rate converter runs `native` quanta per wall second whatever
    /// the host refresh is (skipping or adding quanta), so one quantum may
    /// use at most `1e6 / native` of it.
    pub fn target_micros(&self, ctx: &PacingContext) -> Option<u64> {
        let native = ctx.mode.fps();
        if native < 1.0 {
            return None;
        }
        Some((1_000_000.0 / native * self.config.headroom).round() as u64)
    }

    fn recompute(&self, ctx: &PacingContext) -> Option<u32> {
        let target = self.target_micros(ctx)?;
        let n = self.recorded.min(HISTORY);
        let window: Vec<CycleSample> = (1..=n)
            .map(|back| self.history[(self.cursor + HISTORY - back) % HISTORY])
            .collect();
        let latest = window.first()?;
        if latest.emulator_micros == 0 || latest.cycles_issued == 0 {
            return None;
        }

        let mean_frame = window.iter().map(|s| s.frame_micros).sum::<u64>() / n as u64;
        let valid: Vec<&CycleSample> = window
            .iter()
            .filter(|s| mean_frame == 0 || s.frame_micros <= OUTLIER_FACTOR * mean_frame)
            .collect();
        if valid.len() * 2 < n {
            return None;
        }

        let avg_emu = valid.iter().map(|s| s.emulator_micros).sum::<u64>() / valid.len() as u64;
        if avg_emu == 0 {
            return None;
        }
        let issued: u64 = valid.iter().map(|s| s.cycles_issued).sum();
        let real: u64 = valid.iter().map(|s| s.real_cycles.min(s.cycles_issued)).sum();
        let fraction = if issued == 0 { UNITY } else { (real * UNITY / issued).min(UNITY) };

        let mut ratio = target * UNITY / avg_emu * fraction / UNITY;
        ratio = ratio.min(MAX_RATIO);
        if self.rate > self.config.fast_threshold {
            ratio = ratio.min(FAST_MAX_RATIO);
        }

        let rate = u64::from(self.rate);
        let mut next = match ratio.cmp(&UNITY) {
            std::cmp::Ordering::Less => {
                let scaled = rate * ratio / UNITY;
                if ratio < DAMPING_THRESHOLD {
                    scaled * ratio * ratio / (DAMPING_THRESHOLD * DAMPING_THRESHOLD)
                } else {
                    scaled
                }
            }
            std::cmp::Ordering::Greater => (rate + rate * ratio / UNITY) / 2,
            std::cmp::Ordering::Equal => rate,
        };

        next = next.min(u64::from(self.config.max_rate));
        let safety = SAFETY_CYCLES_PER_MICRO * avg_emu * 1000 / target.max(1);
        next = next.min(safety);
        next = next.max(u64::from(self.floor(ctx.extended_mode)));
        Some(next.min(u64::from(u32::MAX)) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ctx(fps: f64, host: f64, throttle: Throttle) -> PacingContext {
        PacingContext {
            mode: ModeSignature::new(320, 200, fps, 8),
            timing: HostTiming {
                refresh_hz: host,
                throttle,
                tampered: false,
            },
            extended_mode: false,
        }
    }

    /// Synthetic engine that executes `speed` cycles per microsecond.
    fn run(controller: &mut CycleController, ctx: &PacingContext, speed: f64, frames: usize) {
        let quantum_ms = 1000.0 / ctx.mode.fps();
        for _ in 0..frames {
            let cycles = controller.quantum_cycles(quantum_ms);
            let micros = (cycles as f64 / speed).round().max(1.0) as u64;
            let sample = CycleSample {
                cycles_issued: cycles,
                real_cycles: cycles,
                emulator_micros: micros,
                frame_micros: 16_667,
            };
            controller.record(sample, ctx);
        }
    }

    #[test]
    fn quanta_per_second_fit_in_real_time() {
        let c = CycleController::new(CycleConfig::default());
        let same = c.target_micros(&ctx(60.0, 60.0, Throttle::Normal));
        assert_eq!(same, Some((1_000_000.0 / 60.0 * 0.9925_f64).round() as u64));
        // Whatever the host refresh, the converter runs `guest` quanta per second.
        for (guest, host) in [(70.0, 60.0), (30.0, 60.0), (60.0, 144.0)] {
            let target = c.target_micros(&ctx(guest, host, Throttle::Normal)).expect("target");
            let per_second = target as f64 * guest;
            assert!(
                per_second <= 1_000_000.0 * 0.9925 + guest,
                "{guest}/{host}: {per_second} us of work per second"
            );
            assert!(per_second >= 1_000_000.0 * 0.99, "{guest}/{host}: budget too small");
        }
        assert_eq!(c.target_micros(&ctx(0.0, 60.0, Throttle::Normal)), None);
    }

    #[test]
    fn on_target_samples_are_a_fixed_point() {
        let mut c = CycleController::new(CycleConfig::default());
        let cx = ctx(60.0, 60.0, Throttle::Normal);
        let target = c.target_micros(&cx).expect("target");
        let sample = CycleSample {
            cycles_issued: 50_000,
            real_cycles: 50_000,
            emulator_micros: target,
            frame_micros: 16_667,
        };
        for _ in 0..64 {
            assert_eq!(c.record(sample, &cx), None);
        }
        assert_eq!(c.rate(), 3_000);
    }

    #[test]
    fn settles_after_throughput_step() {
        let config = CycleConfig::default();
        let mut c = CycleController::new(config);
        let cx = ctx(60.0, 60.0, Throttle::Normal);
        let target = c.target_micros(&cx).expect("target") as f64;

        run(&mut c, &cx, 20.0, 600);
        let fast = c.rate();
        let expected = 20.0 * target * 60.0 / 1000.0;
        assert!((fast as f64 - expected).abs() / expected < 0.05, "{fast} vs {expected}");

        // The host suddenly gets four times slower.
        run(&mut c, &cx, 5.0, 600);
        let slow = c.rate();
        let expected = 5.0 * target * 60.0 / 1000.0;
        assert!((slow as f64 - expected).abs() / expected < 0.05, "{slow} vs {expected}");
        assert!(slow >= config.floor_baseline && slow <= config.max_rate);
    }

    #[test]
    fn first_sample_after_mode_change_only_resets() {
        let mut c = CycleController::new(CycleConfig::default());
        let a = ctx(60.0, 60.0, Throttle::Normal);
        let slow = CycleSample {
            cycles_issued: 50_000,
            real_cycles: 50_000,
            emulator_micros: 100_000,
            frame_micros: 16_667,
        };
        for _ in 0..3 {
            c.record(slow, &a);
        }
        assert_eq!(c.recorded, 2);
        let b = ctx(70.0, 60.0, Throttle::Normal);
        c.record(slow, &b);
        assert_eq!(c.recorded, 0);
    }

    #[test]
    fn stalled_frames_are_excluded() {
        let mut c = CycleController::new(CycleConfig::default());
        let cx = ctx(60.0, 60.0, Throttle::Normal);
        c.record(CycleSample::default(), &cx);
        let normal = CycleSample {
            cycles_issued: 50_000,
            real_cycles: 50_000,
            emulator_micros: 8_000,
            frame_micros: 16_667,
        };
        let stall = CycleSample {
            emulator_micros: 80_000,
            frame_micros: 1_000_000,
            ..normal
        };
        c.record(normal, &cx);
        c.record(stall, &cx);
        c.record(normal, &cx);
        // Averaged with the stall the engine would look too slow and the rate would drop.
        let rate = c.record(normal, &cx).expect("adjusted");
        assert!(rate > 3_000);
    }

    #[test]
    fn zero_latest_sample_vetoes() {
        let mut c = CycleController::new(CycleConfig::default());
        let cx = ctx(60.0, 60.0, Throttle::Normal);
        c.record(CycleSample::default(), &cx);
        let normal = CycleSample {
            cycles_issued: 50_000,
            real_cycles: 50_000,
            emulator_micros: 1_000,
            frame_micros: 16_667,
        };
        for _ in 0..3 {
            c.record(normal, &cx);
        }
        assert_eq!(c.record(CycleSample::default(), &cx), None);
        assert_eq!(c.rate(), 3_000);
    }

    #[test]
    fn inflated_cycles_are_not_rewarded() {
        let mut plain = CycleController::new(CycleConfig::default());
        let mut inflated = CycleController::new(CycleConfig::default());
        let cx = ctx(60.0, 60.0, Throttle::Normal);
        plain.record(CycleSample::default(), &cx);
        inflated.record(CycleSample::default(), &cx);
        for _ in 0..4 {
            let s = CycleSample {
                cycles_issued: 50_000,
                real_cycles: 50_000,
                emulator_micros: 8_000,
                frame_micros: 16_667,
            };
            plain.record(s, &cx);
            inflated.record(CycleSample { real_cycles: 25_000, ..s }, &cx);
        }
        assert!(plain.rate() > inflated.rate());
    }

    #[test]
    fn fast_forward_scales_and_restores_steady_rate() {
        let mut c = CycleController::new(CycleConfig::default());
        let ff = ctx(60.0, 60.0, Throttle::FastForward { multiplier: 0.0 });
        assert_eq!(c.record(CycleSample::default(), &ff), Some(12_000));
        let ff2 = ctx(60.0, 60.0, Throttle::FastForward { multiplier: 2.0 });
        assert_eq!(c.record(CycleSample::default(), &ff2), Some(6_000));
        let slow = ctx(60.0, 60.0, Throttle::SlowMotion { multiplier: 4.0 });
        assert_eq!(c.record(CycleSample::default(), &slow), Some(750));
        let normal = ctx(60.0, 60.0, Throttle::Normal);
        assert_eq!(c.record(CycleSample::default(), &normal), Some(3_000));
        assert_eq!(c.record(CycleSample::default(), &normal), None);
    }

    #[test]
    fn disabled_or_tampered_never_adjusts() {
        let mut c = CycleController::new(CycleConfig {
            enabled: false,
            ..CycleConfig::default()
        });
        let cx = ctx(60.0, 60.0, Throttle::Normal);
        run(&mut c, &cx, 50.0, 64);
        assert_eq!(c.rate(), 3_000);

        let mut c = CycleController::new(CycleConfig::default());
        let mut tampered = cx;
        tampered.timing.tampered = true;
        run(&mut c, &tampered, 50.0, 64);
        assert_eq!(c.rate(), 3_000);
    }

    #[test]
    fn extended_mode_raises_the_floor() {
        let config = CycleConfig::default();
        let mut c = CycleController::new(config);
        let mut cx = ctx(60.0, 60.0, Throttle::Normal);
        cx.extended_mode = true;
        run(&mut c, &cx, 0.01, 200);
        assert_eq!(c.rate(), config.floor_extended);
    }

    proptest! {
        #[test]
        fn rate_stays_within_bounds(
            speeds in prop::collection::vec(0.01f64..500.0, 1..6),
            extended in any::<bool>(),
        ) {
            let config = CycleConfig::default();
            let mut c = CycleController::new(config);
            let mut cx = ctx(70.0, 60.0, Throttle::Normal);
            cx.extended_mode = extended;
            let floor = if extended { config.floor_extended } else { config.floor_baseline };
            for speed in speeds {
                run(&mut c, &cx, speed, 40);
                prop_assert!(c.rate() <= config.max_rate);
                prop_assert!(c.rate() >= config.floor_baseline.min(floor));
            }
        }
    }
}
