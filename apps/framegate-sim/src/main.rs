use std::{
    f32::consts::TAU,
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use framegate_runtime::{
    Bind, BindTarget, CycleConfig, Device, Engine, Event, ExitStatus, Flow, HostFrame, InputMapper,
    InputState, Key, ModeSignature, Notification, Pacer, PacerConfig, Quantum, QuantumOutcome,
    QueueConfig, Throttle,
};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Headless pacing simulator
#[derive(Parser, Debug)]
#[command(name = "framegate-sim")]
#[command(about = "Drives a synthetic engine through the frame gate and reports pacing", long_about = None)]
struct Args {
    /// Host refreshes to simulate
    #[arg(short, long, default_value_t = 600)]
    frames: u64,

    /// Host display refresh rate in Hz
    #[arg(long, default_value_t = 60.0)]
    host_hz: f64,

    /// Guest video refresh rate in Hz
    #[arg(long, default_value_t = 70.0)]
    guest_fps: f64,

    /// Guest resolution
    #[arg(long, default_value_t = 320)]
    width: u32,
    #[arg(long, default_value_t = 200)]
    height: u32,

    /// Emulated cycles the synthetic engine executes per wall-clock microsecond
    #[arg(long, default_value_t = 40)]
    speed: u64,

    /// Run in fast-forward with this multiplier (1.0 means unlimited)
    #[arg(long)]
    fast_forward: Option<f32>,

    /// Starting cycles per emulated millisecond
    #[arg(long, default_value_t = 3_000)]
    initial_rate: u32,

    /// Ceiling in cycles per emulated millisecond
    #[arg(long, default_value_t = 1_000_000)]
    max_rate: u32,

    /// Keep the cycle rate fixed
    #[arg(long)]
    fixed_rate: bool,

    /// Guest runs in its extended execution mode (raises the cycle floor)
    #[arg(long)]
    extended: bool,

    /// Event queue slots
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,

    /// Do not sleep between host refreshes
    #[arg(long)]
    no_vsync: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

/// Burns wall time in proportion to the cycles it is asked to run.
struct SimEngine {
    mode: ModeSignature,
    speed: u64,
    extended: bool,
    sample_rate: f64,
    phase: f32,
    audio: Vec<[i16; 2]>,
}

const SLICES: u64 = 4;

impl SimEngine {
    fn burn(&self, cycles: u64) {
        let until = Instant::now() + Duration::from_micros(cycles / self.speed.max(1));
        while Instant::now() < until {
            std::hint::spin_loop();
        }
    }

    fn synthesize(&mut self, quantum_ms: f64) {
        let count = (self.sample_rate * quantum_ms / 1000.0).round() as usize;
        let step = TAU * 440.0 / self.sample_rate as f32;
        self.audio.clear();
        for _ in 0..count {
            let v = (self.phase.sin() * 8_000.0) as i16;
            self.audio.push([v, v]);
            self.phase = (self.phase + step) % TAU;
        }
    }
}

impl Engine for SimEngine {
    fn handle_event(&mut self, event: Event) {
        debug!(?event, "engine input");
    }

    fn run_quantum(&mut self, quantum: &mut Quantum<'_>) -> QuantumOutcome {
        quantum.set_mode(self.mode);
        quantum.set_extended_mode(self.extended);
        let started = Instant::now();
        let target = quantum.target_cycles();
        let slice = target / SLICES;
        for i in 0..SLICES {
            let cycles = if i + 1 == SLICES {
                target - slice * (SLICES - 1)
            } else {
                slice
            };
            self.burn(cycles);
            quantum.add_cycles(cycles, 0);
            if quantum.checkpoint() == Flow::Stop {
                return QuantumOutcome::Exit;
            }
        }
        if started.elapsed().as_secs_f64() * 1000.0 > quantum.quantum_ms() {
            quantum.mark_overloaded();
        }

        self.synthesize(quantum.quantum_ms());
        quantum.push_audio(&self.audio);

        let (width, height) = (self.mode.width, self.mode.height);
        let output = quantum.output();
        output.video.resize(width, height);
        output.video.seq += 1;
        let shade = (output.video.seq & 0xff) as u32;
        output.video.pixels.fill((shade << 16) | (shade << 8) | shade);
        QuantumOutcome::Frame
    }
}

/// Frontend stand-in: a pad whose first button toggles every 45 refreshes
/// and a pointer drifting diagonally.
#[derive(Debug, Default)]
struct ScriptedInput {
    refresh: u64,
}

impl InputState for ScriptedInput {
    fn poll(&mut self) {
        self.refresh += 1;
    }

    fn state(&self, _port: u8, device: Device, _index: u8, id: u16) -> i16 {
        let held = device == Device::Joypad && id == 0 && (self.refresh / 45) % 2 == 1;
        i16::from(held)
    }

    fn key_down(&self, _key: Key) -> bool {
        false
    }

    fn mouse_delta(&self) -> (i32, i32) {
        (1, -1)
    }
}

#[derive(Debug, Default)]
struct Stats {
    events: usize,
    skipped: u64,
    extra_quanta: u64,
    audio_frames: u64,
    overloads: u64,
    mode_changes: u64,
    min_rate: u32,
    max_rate: u32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = PacerConfig {
        queue: QueueConfig {
            capacity: args.queue_capacity,
        },
        cycles: CycleConfig {
            enabled: !args.fixed_rate,
            initial_rate: args.initial_rate,
            max_rate: args.max_rate,
            ..CycleConfig::default()
        },
        ..PacerConfig::default()
    };
    let engine = SimEngine {
        mode: ModeSignature::new(args.width, args.height, args.guest_fps, 32),
        speed: args.speed,
        extended: args.extended,
        sample_rate: config.audio_sample_rate,
        phase: 0.0,
        audio: Vec::new(),
    };
    let pacer = Pacer::start(engine, config)?;
    let events = pacer.events();
    let mut mapper = InputMapper::new();
    mapper.bind(Bind::new(0, Device::Joypad, 0, 0, BindTarget::Key(Key::SPACE)));
    let mut input = ScriptedInput::default();

    let throttle = match args.fast_forward {
        Some(multiplier) => Throttle::FastForward { multiplier },
        None => Throttle::Normal,
    };
    let period = Duration::from_secs_f64(1.0 / args.host_hz.max(1.0));
    let mut stats = Stats {
        min_rate: u32::MAX,
        ..Stats::default()
    };
    let mut next = Instant::now();
    let mut last = Instant::now();
    let started = Instant::now();

    for refresh in 0..args.frames {
        if !args.no_vsync {
            next += period;
            if let Some(wait) = next.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }
        let now = Instant::now();
        let frame_micros = now.duration_since(last).as_micros() as u64;
        last = now;

        stats.events += mapper.poll(&mut input, &events);

        let frame = pacer.begin_host_frame(HostFrame {
            refresh_hz: args.host_hz,
            throttle,
            frame_micros: Some(frame_micros.max(1)),
        });
        if let Some(status) = frame.exit_status() {
            warn!(?status, "engine stopped early");
            pacer.end_host_frame(frame, true);
            break;
        }
        let skip = frame.should_skip();
        stats.skipped += u64::from(skip);
        stats.extra_quanta += u64::from(frame.decision().extra_quanta);
        stats.audio_frames += frame.audio().len() as u64;
        stats.min_rate = stats.min_rate.min(frame.cycle_rate());
        stats.max_rate = stats.max_rate.max(frame.cycle_rate());
        if refresh % 120 == 0 {
            info!(
                refresh,
                rate = frame.cycle_rate(),
                micros = frame.output().emulator_micros,
                "pacing"
            );
        }
        pacer.end_host_frame(frame, skip);

        for note in pacer.notifications().try_iter() {
            match note {
                Notification::CpuOverloaded => stats.overloads += 1,
                Notification::ModeChanged(_) => stats.mode_changes += 1,
                Notification::EngineExited(_) => {}
            }
        }
    }

    let elapsed = started.elapsed();
    let quanta = pacer.frames_completed();
    let final_rate = pacer.paused(|exchange| exchange.output.cycle_rate);
    pacer.shutdown();
    let exit = pacer.exit_status();
    if exit.as_ref().is_some_and(ExitStatus::is_crash) {
        warn!(?exit, "engine crashed");
    }

    info!(
        refreshes = args.frames,
        quanta,
        secs = elapsed.as_secs_f64(),
        guest_fps = quanta as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        skipped = stats.skipped,
        extra_quanta = stats.extra_quanta,
        events = stats.events,
        audio_frames = stats.audio_frames,
        overloads = stats.overloads,
        mode_changes = stats.mode_changes,
        min_rate = stats.min_rate,
        max_rate = stats.max_rate,
        final_rate,
        exit = ?exit,
        "simulation finished"
    );
    Ok(())
}
