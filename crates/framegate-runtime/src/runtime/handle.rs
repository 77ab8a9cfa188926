use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::audio::{self, AudioBudget, AudioFrame, AudioSource};

use super::{
    cycles::CycleController,
    engine::{Engine, Exchange, FrameOutput, VideoFrame},
    frame_rate::{FrameRateConverter, SkipDecision},
    gate::{FrameGate, HostAccess, Phase},
    overload::OverloadMonitor,
    queue::{EventQueue, EventSender},
    runner::Runner,
    types::{
        DEFAULT_HOST_FPS, ExitStatus, HostFrame, HostTiming, Notification, PacerConfig,
        PacerError, WARMUP_FRAMES,
    },
};

const THREAD_NAME: &str = "framegate-emu";

/// Host-thread bookkeeping, reused across refreshes.
struct HostSide {
    converter: FrameRateConverter,
    budget: AudioBudget,
    audio: AudioSource,
    overload: OverloadMonitor,
    samples: Vec<AudioFrame>,
    frames: u64,
    last_begin: Option<Instant>,
}

/// Host-side owner of the emulation thread.
///
/// Every refresh the host calls [`Pacer::begin_host_frame`], presents what the
/// returned [`FrameHandle`] exposes, then hands the engine its next frame with
/// [`Pacer::end_host_frame`].
pub struct Pacer {
    gate: Arc<FrameGate<Exchange>>,
    queue: Arc<EventQueue>,
    notifier: Sender<Notification>,
    notifications: Receiver<Notification>,
    host: Mutex<HostSide>,
    join: Mutex<Option<JoinHandle<()>>>,
    config: PacerConfig,
}

impl Pacer {
    pub fn start<E: Engine>(engine: E, config: PacerConfig) -> Result<Self, PacerError> {
        config.validate()?;

        let queue = Arc::new(EventQueue::new(config.queue));
        let (notifier, notifications) = unbounded();
        let (sink, source) = audio::channel(config.audio_capacity * 2);
        let (gate, token) = FrameGate::new(Exchange::default());

        let runner = Runner::new(
            engine,
            Arc::clone(&queue),
            CycleController::new(config.cycles),
            sink,
            notifier.clone(),
        );
        let join = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || runner.run(token))?;
        info!(
            queue = config.queue.capacity,
            rate = config.cycles.initial_rate,
            "pacer started"
        );

        Ok(Self {
            gate,
            queue,
            notifier,
            notifications,
            host: Mutex::new(HostSide {
                converter: FrameRateConverter::new(),
                budget: AudioBudget::new(config.audio_sample_rate, config.audio_capacity),
                audio: source,
                overload: OverloadMonitor::new(),
                samples: Vec::with_capacity(config.audio_capacity),
                frames: 0,
                last_begin: None,
            }),
            join: Mutex::new(Some(join)),
            config,
        })
    }

    /// Waits for the in-flight frame and opens this refresh.
    pub fn begin_host_frame(&self, frame: HostFrame) -> FrameHandle<'_> {
        let mut host = self.host.lock();

        if frame.throttle.is_fast_forward() && frame.refresh_hz >= 1.0 {
            let budget = Duration::from_secs_f64((1.0 + 700.0 / frame.refresh_hz) / 1000.0);
            if let Some(last) = host.last_begin {
                if let Some(nap) = budget.checked_sub(last.elapsed()) {
                    thread::sleep(nap);
                }
            }
        }
        host.last_begin = Some(Instant::now());

        let mut access = self.gate.request_finish();
        let timing = HostTiming {
            refresh_hz: frame.refresh_hz,
            throttle: frame.throttle,
            tampered: frame.frame_micros == Some(0),
        };
        let frame_micros = frame
            .frame_micros
            .filter(|micros| *micros > 0)
            .unwrap_or_else(|| nominal_micros(frame.refresh_hz));
        access.timing = timing;
        access.frame_micros = frame_micros;

        let exit_status = self.gate.exit_status();
        let decision = if exit_status.is_some() {
            SkipDecision::default()
        } else {
            host.converter.evaluate(access.output.mode.fps(), &timing)
        };
        if decision.skip_emulation || decision.extra_quanta > 0 {
            debug!(
                skip = decision.skip_emulation,
                extra = decision.extra_quanta,
                "frame rate conversion"
            );
        }

        let relaxed =
            host.frames < WARMUP_FRAMES || timing.tampered || timing.throttle.is_fast_forward();
        let host_side = &mut *host;
        host_side.samples.clear();
        let wanted = host_side.budget.plan(
            frame_micros as f64 / 1_000_000.0,
            host_side.audio.available(),
            relaxed,
        );
        host_side.audio.take(wanted, &mut host_side.samples);
        if timing.throttle.is_fast_forward() {
            // Whatever is left would only add latency once normal speed resumes.
            host_side.audio.clear();
        }
        host_side.frames += 1;

        FrameHandle {
            access,
            host,
            decision,
            exit_status,
            timing,
            relaxed,
        }
    }

    /// Closes the refresh. With `skip` the engine is left parked and the same
    /// output is presented again; otherwise it runs `1 + extra_quanta` quanta.
    pub fn end_host_frame(&self, handle: FrameHandle<'_>, skip: bool) {
        let FrameHandle {
            access,
            mut host,
            decision,
            relaxed,
            ..
        } = handle;
        let overloaded = access.output.overloaded;
        drop(access);

        if host.overload.record(overloaded, relaxed, Instant::now()) {
            let _ = self.notifier.send(Notification::CpuOverloaded);
        }
        drop(host);

        if skip {
            self.gate.resume();
        } else {
            self.gate.advance(decision.extra_quanta.saturating_add(1));
        }
    }

    /// Runs `f` with the engine parked at its next checkpoint, then lets it
    /// continue the interrupted frame.
    pub fn paused<R>(&self, f: impl FnOnce(&mut Exchange) -> R) -> R {
        let mut access = self.gate.request_pause();
        let result = f(&mut *access);
        drop(access);
        self.gate.resume();
        result
    }

    pub fn events(&self) -> EventSender {
        EventSender::new(Arc::clone(&self.queue))
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn notifications(&self) -> &Receiver<Notification> {
        &self.notifications
    }

    pub fn phase(&self) -> Phase {
        self.gate.phase()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.gate.exit_status()
    }

    pub fn frames_completed(&self) -> u64 {
        self.gate.frames_completed()
    }

    pub fn config(&self) -> &PacerConfig {
        &self.config
    }

    /// Stops the engine and joins its thread. Safe to call more than once.
    pub fn shutdown(&self) {
        self.gate.shutdown();
        if let Some(join) = self.join.lock().take() {
            if join.join().is_err() {
                warn!("emulation thread panicked outside the engine");
            }
            info!("pacer stopped");
        }
        self.queue.clear();
        let mut host = self.host.lock();
        host.audio.clear();
        host.budget.reset();
    }
}

impl Drop for Pacer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One host refresh, between [`Pacer::begin_host_frame`] and
/// [`Pacer::end_host_frame`]. The engine is parked while this is alive.
pub struct FrameHandle<'a> {
    access: HostAccess<Exchange>,
    host: MutexGuard<'a, HostSide>,
    decision: SkipDecision,
    exit_status: Option<ExitStatus>,
    timing: HostTiming,
    relaxed: bool,
}

impl FrameHandle<'_> {
    /// Last completed output.
    pub fn output(&self) -> &FrameOutput {
        &self.access.output
    }

    pub fn video(&self) -> &VideoFrame {
        &self.access.output.video
    }

    /// Audio budgeted for this refresh.
    pub fn audio(&self) -> &[AudioFrame] {
        &self.host.samples
    }

    pub fn cycle_rate(&self) -> u32 {
        self.access.output.cycle_rate
    }

    pub fn decision(&self) -> SkipDecision {
        self.decision
    }

    /// The host refreshes faster than the guest and should present the
    /// previous picture again.
    pub fn should_skip(&self) -> bool {
        self.decision.skip_emulation
    }

    pub fn exit_status(&self) -> Option<&ExitStatus> {
        self.exit_status.as_ref()
    }

    pub fn timing(&self) -> HostTiming {
        self.timing
    }
}

fn nominal_micros(refresh_hz: f64) -> u64 {
    if refresh_hz >= 1.0 {
        (1_000_000.0 / refresh_hz).round() as u64
    } else {
        (1_000_000.0 / DEFAULT_HOST_FPS).round() as u64
    }
}
