use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};

use crossbeam_channel::Sender;
use tracing::{debug, info};

use crate::audio::AudioSink;

use super::{
    cycles::{CycleController, CycleSample, PacingContext},
    engine::{Engine, Exchange, Quantum, QuantumOutcome},
    gate::{EmulationToken, Flow},
    queue::EventQueue,
    types::{DEFAULT_HOST_FPS, ExitStatus, ModeSignature, Notification},
};

/// Drives the engine on the emulation thread, one quantum per granted frame.
pub(crate) struct Runner<E> {
    engine: E,
    queue: Arc<EventQueue>,
    controller: CycleController,
    audio: AudioSink,
    notifier: Sender<Notification>,
    mode: ModeSignature,
    extended_mode: bool,
}

impl<E: Engine> Runner<E> {
    pub(crate) fn new(
        engine: E,
        queue: Arc<EventQueue>,
        controller: CycleController,
        audio: AudioSink,
        notifier: Sender<Notification>,
    ) -> Self {
        Self {
            engine,
            queue,
            controller,
            audio,
            notifier,
            mode: ModeSignature::default(),
            extended_mode: false,
        }
    }

    /// Runs until the engine exits, the host shuts down, or the engine panics.
    /// The exit status is always published before returning.
    pub(crate) fn run(mut self, mut token: EmulationToken<Exchange>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_loop(&mut token)));
        let status = match outcome {
            Ok(()) => ExitStatus::Clean,
            Err(payload) => ExitStatus::Crashed(panic_message(payload.as_ref())),
        };
        token.exit(status.clone());
        // The host may already be gone.
        let _ = self.notifier.send(Notification::EngineExited(status));
    }

    fn run_loop(&mut self, token: &mut EmulationToken<Exchange>) {
        if token.wait_start() == Flow::Stop {
            return;
        }
        loop {
            let engine = &mut self.engine;
            let drained = self.queue.drain(|event| engine.handle_event(event));
            if drained > 0 {
                debug!(drained, "delivered input events");
            }

            let fps = self.mode.fps();
            let quantum_ms = 1000.0 / if fps >= 1.0 { fps } else { DEFAULT_HOST_FPS };
            let target = self.controller.quantum_cycles(quantum_ms);

            let started = Instant::now();
            let mut quantum = Quantum::new(
                token,
                &mut self.audio,
                target,
                quantum_ms,
                self.mode,
                self.extended_mode,
            );
            let outcome = self.engine.run_quantum(&mut quantum);
            let report = quantum.finish();
            let emulator_micros = started
                .elapsed()
                .saturating_sub(report.blocked)
                .as_micros() as u64;

            if report.mode != self.mode {
                info!(
                    width = report.mode.width,
                    height = report.mode.height,
                    fps = report.mode.fps(),
                    "video mode changed"
                );
                self.mode = report.mode;
                let _ = self.notifier.send(Notification::ModeChanged(report.mode));
            }
            self.extended_mode = report.extended_mode;

            let exchange = token.exchange();
            let ctx = PacingContext {
                mode: self.mode,
                timing: exchange.timing,
                extended_mode: self.extended_mode,
            };
            let sample = CycleSample {
                cycles_issued: report.issued,
                real_cycles: report.real,
                emulator_micros,
                frame_micros: exchange.frame_micros,
            };
            self.controller.record(sample, &ctx);

            let output = &mut exchange.output;
            output.mode = self.mode;
            output.cycle_rate = self.controller.rate();
            output.emulator_micros = emulator_micros;
            output.overloaded = report.overloaded;
            output.quanta += 1;

            if report.stopped || outcome == QuantumOutcome::Exit {
                return;
            }
            if token.frame_complete() == Flow::Stop {
                return;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "engine panicked".to_string()
    }
}
