use std::time::{Duration, Instant};

use crate::audio::{AudioFrame, AudioSink};

use super::{
    gate::{EmulationToken, Flow},
    types::{Event, HostTiming, ModeSignature},
};

/// The emulation engine driven by the pacer.
///
/// The engine runs on its own thread. Between two quanta the pacer feeds it
/// queued input through [`Engine::handle_event`].
pub trait Engine: Send + 'static {
    fn handle_event(&mut self, event: Event);

    /// Runs one quantum (one video frame worth of emulation).
    fn run_quantum(&mut self, quantum: &mut Quantum<'_>) -> QuantumOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantumOutcome {
    /// A frame was produced; keep going.
    Frame,
    /// The engine's run loop is over.
    Exit,
}

/// Last produced picture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Packed pixels, `width * height` entries.
    pub pixels: Vec<u32>,
    /// Bumped by the engine each time it writes a new picture.
    pub seq: u64,
}

impl VideoFrame {
    /// Resizes the buffer for a new resolution, keeping the allocation.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pixels.resize(width as usize * height as usize, 0);
    }
}

/// What the engine leaves behind for the host after each quantum.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameOutput {
    pub video: VideoFrame,
    pub mode: ModeSignature,
    pub cycle_rate: u32,
    pub emulator_micros: u64,
    pub overloaded: bool,
    pub quanta: u64,
}

/// State handed back and forth through the gate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Exchange {
    pub output: FrameOutput,
    pub timing: HostTiming,
    /// Host frame time of the latest refresh.
    pub frame_micros: u64,
}

/// Per-quantum view the engine works through.
pub struct Quantum<'a> {
    token: &'a mut EmulationToken<Exchange>,
    audio: &'a mut AudioSink,
    target_cycles: u64,
    quantum_ms: f64,
    mode: ModeSignature,
    extended_mode: bool,
    issued: u64,
    inflation: u64,
    overloaded: bool,
    blocked: Duration,
    stopped: bool,
}

impl<'a> Quantum<'a> {
    pub(crate) fn new(
        token: &'a mut EmulationToken<Exchange>,
        audio: &'a mut AudioSink,
        target_cycles: u64,
        quantum_ms: f64,
        mode: ModeSignature,
        extended_mode: bool,
    ) -> Self {
        Self {
            token,
            audio,
            target_cycles,
            quantum_ms,
            mode,
            extended_mode,
            issued: 0,
            inflation: 0,
            overloaded: false,
            blocked: Duration::ZERO,
            stopped: false,
        }
    }

    /// Cycles the engine should execute in this quantum.
    #[inline]
    pub fn target_cycles(&self) -> u64 {
        self.target_cycles
    }

    /// Emulated time this quantum covers.
    #[inline]
    pub fn quantum_ms(&self) -> f64 {
        self.quantum_ms
    }

    /// Host timing published for this refresh.
    pub fn timing(&mut self) -> HostTiming {
        self.token.exchange().timing
    }

    /// Safe point where the host may inspect shared state. Engines should
    /// return promptly once this yields [`Flow::Stop`].
    pub fn checkpoint(&mut self) -> Flow {
        let started = Instant::now();
        let flow = self.token.checkpoint();
        self.blocked += started.elapsed();
        if flow == Flow::Stop {
            self.stopped = true;
        }
        flow
    }

    pub fn output(&mut self) -> &mut FrameOutput {
        &mut self.token.exchange().output
    }

    /// Queues audio for the host. Returns how many frames fit.
    pub fn push_audio(&mut self, frames: &[AudioFrame]) -> usize {
        self.audio.push(frames)
    }

    #[inline]
    pub fn mode(&self) -> ModeSignature {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ModeSignature) {
        self.mode = mode;
    }

    /// Marks the guest as running a mode that needs the raised cycle floor.
    pub fn set_extended_mode(&mut self, extended: bool) {
        self.extended_mode = extended;
    }

    /// Accounts executed cycles; `io_inflation` of them were spent waiting on
    /// I/O or instrumentation and do not count as real work.
    pub fn add_cycles(&mut self, issued: u64, io_inflation: u64) {
        self.issued += issued;
        self.inflation += io_inflation.min(issued);
    }

    /// The engine could not reach its target within the budget.
    pub fn mark_overloaded(&mut self) {
        self.overloaded = true;
    }

    pub(crate) fn finish(self) -> QuantumReport {
        let issued = if self.issued == 0 {
            self.target_cycles
        } else {
            self.issued
        };
        QuantumReport {
            issued,
            real: issued - self.inflation.min(issued),
            mode: self.mode,
            extended_mode: self.extended_mode,
            overloaded: self.overloaded,
            blocked: self.blocked,
            stopped: self.stopped,
        }
    }
}

/// Accounting of a finished quantum for the runner.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QuantumReport {
    pub(crate) issued: u64,
    pub(crate) real: u64,
    pub(crate) mode: ModeSignature,
    pub(crate) extended_mode: bool,
    pub(crate) overloaded: bool,
    pub(crate) blocked: Duration,
    pub(crate) stopped: bool,
}
