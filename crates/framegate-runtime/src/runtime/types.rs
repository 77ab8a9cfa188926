use std::fmt;

use bitflags::bitflags;
use strum::{EnumCount, EnumDiscriminants, EnumIter};

/// Logical keyboard key of the emulated machine.
///
/// Codes follow the engine's scan table: `1..=10` are the digit row, `11..=36`
/// letters, `37..=48` function keys and so on up to the numeric keypad. Code
/// `0` is reserved for "no key" and is never a valid [`Key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(u8);

const KEY_NAMES: [&str; Key::COUNT] = [
    "None", "1", "2", "3", "4", "5", "6", "7", "8", "9", "0", "Q", "W", "E", "R", "T", "Y", "U",
    "I", "O", "P", "A", "S", "D", "F", "G", "H", "J", "K", "L", "Z", "X", "C", "V", "B", "N", "M",
    "F1", "F2", "F3", "F4", "F5", "F6", "F7", "F8", "F9", "F10", "F11", "F12", "Esc", "Tab",
    "Backspace", "Enter", "Space", "Left-Alt", "Right-Alt", "Left-Ctrl", "Right-Ctrl",
    "Left-Shift", "Right-Shift", "Caps-Lock", "Scroll-Lock", "Num-Lock", "Grave", "Minus",
    "Equals", "Backslash", "Left-Bracket", "Right-Bracket", "Semicolon", "Quote", "Period",
    "Comma", "Slash", "Extra-Lt-Gt", "Print-Screen", "Pause", "Insert", "Home", "Page-Up",
    "Delete", "End", "Page-Down", "Left", "Up", "Down", "Right", "NP-1", "NP-2", "NP-3", "NP-4",
    "NP-5", "NP-6", "NP-7", "NP-8", "NP-9", "NP-0", "NP-Divide", "NP-Multiply", "NP-Minus",
    "NP-Plus", "NP-Enter", "NP-Period",
];

impl Key {
    /// Number of key codes including the reserved `0`.
    pub const COUNT: usize = 103;

    pub const ESC: Key = Key(49);
    pub const TAB: Key = Key(50);
    pub const ENTER: Key = Key(52);
    pub const SPACE: Key = Key(53);
    pub const LEFT_ALT: Key = Key(54);
    pub const LEFT_CTRL: Key = Key(56);
    pub const LEFT_SHIFT: Key = Key(58);
    pub const LEFT: Key = Key(83);
    pub const UP: Key = Key(84);
    pub const DOWN: Key = Key(85);
    pub const RIGHT: Key = Key(86);

    pub const fn new(code: u8) -> Option<Self> {
        if code != 0 && (code as usize) < Self::COUNT {
            Some(Self(code))
        } else {
            None
        }
    }

    #[inline]
    pub const fn code(self) -> u8 {
        self.0
    }

    pub fn name(self) -> &'static str {
        KEY_NAMES[self.0 as usize]
    }

    /// Iterates every valid key code.
    pub fn all() -> impl Iterator<Item = Key> {
        (1..Self::COUNT as u8).map(Key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Emulated joystick port (player).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter)]
pub enum Port {
    One,
    Two,
}

impl Port {
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Port::One => 0,
            Port::Two => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter)]
pub enum Axis {
    X,
    Y,
}

/// Mouse speed modifier held on a shoulder button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter)]
pub enum SpeedToggle {
    Faster,
    Slower,
}

/// Number of joystick buttons tracked per port.
pub const JOY_BUTTONS: u8 = 4;

bitflags! {
    /// Hat switch direction bits as the engine's joystick model expects them.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct HatBits: u8 {
        const LEFT = 1 << 0;
        const DOWN = 1 << 1;
        const RIGHT = 1 << 2;
        const UP = 1 << 3;
    }
}

/// Discrete input or state event crossing from producers to the engine.
///
/// The set is closed: every variant has a fixed coalescing slot in the
/// [`EventQueue`](super::EventQueue) overflow table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumDiscriminants)]
#[strum_discriminants(name(EventKind), derive(Hash, EnumCount, EnumIter))]
pub enum Event {
    KeyDown(Key),
    KeyUp(Key),
    /// Relative pointer motion.
    MouseMove { dx: i32, dy: i32 },
    MouseDown(MouseButton),
    MouseUp(MouseButton),
    /// Relative wheel motion.
    MouseWheel(i32),
    /// Absolute analog stick position in `-32768..=32767`.
    JoyAxis { port: Port, axis: Axis, value: i16 },
    JoyDown { port: Port, button: u8 },
    JoyUp { port: Port, button: u8 },
    HatSet(HatBits),
    HatUnset(HatBits),
    SpeedSet(SpeedToggle),
    SpeedReset(SpeedToggle),
    MenuToggle,
    /// Composite stick pair driving the emulated mouse.
    AxisPair { x: i16, y: i16 },
    MountsChanged,
    SystemRefresh,
}

impl Event {
    #[inline]
    pub fn kind(&self) -> EventKind {
        EventKind::from(self)
    }
}

impl EventKind {
    /// Kinds whose payload is a relative delta that can be summed. Absolute
    /// positions (`JoyAxis`, `AxisPair`) keep their latest value instead.
    #[inline]
    pub fn is_accumulatable(self) -> bool {
        matches!(self, EventKind::MouseMove | EventKind::MouseWheel)
    }

    /// Kinds that are releases of a previously pressed input.
    #[inline]
    pub fn is_release(self) -> bool {
        matches!(
            self,
            EventKind::KeyUp
                | EventKind::MouseUp
                | EventKind::JoyUp
                | EventKind::HatUnset
                | EventKind::SpeedReset
        )
    }
}

/// Video mode identity; any change invalidates pacing history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ModeSignature {
    pub width: u32,
    pub height: u32,
    pub refresh_millihz: u32,
    pub depth: u8,
}

impl ModeSignature {
    pub fn new(width: u32, height: u32, fps: f64, depth: u8) -> Self {
        Self {
            width,
            height,
            refresh_millihz: (fps * 1000.0).round().max(0.0) as u32,
            depth,
        }
    }

    #[inline]
    pub fn fps(&self) -> f64 {
        f64::from(self.refresh_millihz) / 1000.0
    }
}

/// Host-reported playback mode.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Throttle {
    #[default]
    Normal,
    /// `multiplier <= 1.0` (or non-finite) means "unlimited"; the configured
    /// fast-forward multiplier is used instead.
    FastForward { multiplier: f32 },
    SlowMotion { multiplier: f32 },
    Rewinding,
    FrameStepping,
    Paused,
}

impl Throttle {
    #[inline]
    pub fn is_normal(&self) -> bool {
        matches!(self, Throttle::Normal)
    }

    #[inline]
    pub fn is_fast_forward(&self) -> bool {
        matches!(self, Throttle::FastForward { .. })
    }

    /// Coarse class used to detect throttle changes without comparing floats.
    pub(crate) fn class(&self) -> u8 {
        match self {
            Throttle::Normal => 0,
            Throttle::FastForward { .. } => 1,
            Throttle::SlowMotion { .. } => 2,
            Throttle::Rewinding => 3,
            Throttle::FrameStepping => 4,
            Throttle::Paused => 5,
        }
    }
}

/// Pacing inputs the host publishes to the emulation thread every refresh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostTiming {
    pub refresh_hz: f64,
    pub throttle: Throttle,
    /// The frontend reported a zero frame time (frame stepping, menu, netplay
    /// catch-up); wall-clock measurements are meaningless for this frame.
    pub tampered: bool,
}

impl Default for HostTiming {
    fn default() -> Self {
        Self {
            refresh_hz: DEFAULT_HOST_FPS,
            throttle: Throttle::Normal,
            tampered: false,
        }
    }
}

/// Arguments for [`Pacer::begin_host_frame`](super::Pacer::begin_host_frame).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostFrame {
    pub refresh_hz: f64,
    pub throttle: Throttle,
    /// Microseconds the frontend says elapsed since the previous refresh.
    pub frame_micros: Option<u64>,
}

impl Default for HostFrame {
    fn default() -> Self {
        Self {
            refresh_hz: DEFAULT_HOST_FPS,
            throttle: Throttle::Normal,
            frame_micros: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    Crashed(String),
}

impl ExitStatus {
    #[inline]
    pub fn is_crash(&self) -> bool {
        matches!(self, ExitStatus::Crashed(_))
    }
}

/// Out-of-band messages from the pacing layer to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    EngineExited(ExitStatus),
    CpuOverloaded,
    ModeChanged(ModeSignature),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueConfig {
    /// Total slots including the overflow aggregate slot.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: EVENT_QUEUE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleConfig {
    /// Adaptive adjustment on/off. When off the rate stays at `initial_rate`.
    pub enabled: bool,
    /// Starting cycles per emulated millisecond.
    pub initial_rate: u32,
    /// User ceiling in cycles per millisecond.
    pub max_rate: u32,
    /// Floor while the engine runs in its baseline (real) mode.
    pub floor_baseline: u32,
    /// Floor while the engine runs in its extended (protected) mode.
    pub floor_extended: u32,
    /// Above this rate a single adjustment may grow the rate at most 5x.
    pub fast_threshold: u32,
    /// Fraction of the frame budget the engine may use.
    pub headroom: f64,
    /// Multiplier used for unlimited fast-forward.
    pub fast_forward_multiplier: f32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_rate: 3_000,
            max_rate: 1_000_000,
            floor_baseline: 500,
            floor_extended: 2_000,
            fast_threshold: 100_000,
            headroom: 0.9925,
            fast_forward_multiplier: 4.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacerConfig {
    pub queue: QueueConfig,
    pub cycles: CycleConfig,
    pub audio_sample_rate: f64,
    /// Most samples handed to the host in a single refresh.
    pub audio_capacity: usize,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            cycles: CycleConfig::default(),
            audio_sample_rate: DEFAULT_SAMPLE_RATE,
            audio_capacity: AUDIO_BUFFER_FRAMES,
        }
    }
}

impl PacerConfig {
    pub fn validate(&self) -> Result<(), PacerError> {
        if self.queue.capacity < 2 {
            return Err(PacerError::InvalidQueueCapacity {
                capacity: self.queue.capacity,
            });
        }
        let c = &self.cycles;
        if c.floor_baseline == 0 || c.floor_extended == 0 || c.max_rate < c.floor_extended.max(c.floor_baseline)
        {
            return Err(PacerError::InvalidCycleBounds {
                floor: c.floor_baseline.max(c.floor_extended),
                ceiling: c.max_rate,
            });
        }
        if !(c.headroom > 0.0 && c.headroom <= 1.0) {
            return Err(PacerError::InvalidHeadroom {
                headroom: c.headroom,
            });
        }
        if !(self.audio_sample_rate > 0.0) || self.audio_capacity == 0 {
            return Err(PacerError::InvalidAudio {
                sample_rate: self.audio_sample_rate,
                capacity: self.audio_capacity,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PacerError {
    #[error("event queue needs at least 2 slots (got {capacity})")]
    InvalidQueueCapacity { capacity: usize },
    #[error("cycle ceiling {ceiling} is below the floor {floor}")]
    InvalidCycleBounds { floor: u32, ceiling: u32 },
    #[error("headroom must be in (0, 1] (got {headroom})")]
    InvalidHeadroom { headroom: f64 },
    #[error("invalid audio setup: {sample_rate} Hz with {capacity} frames")]
    InvalidAudio { sample_rate: f64, capacity: usize },
    #[error("failed to spawn the emulation thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

pub(crate) const EVENT_QUEUE_SIZE: usize = 256;
pub(crate) const DEFAULT_HOST_FPS: f64 = 60.0;
pub(crate) const DEFAULT_SAMPLE_RATE: f64 = 48_000.0;
// 96 kHz at 30 fps
pub(crate) const AUDIO_BUFFER_FRAMES: usize = 4096;
// Frames after start during which timing noise is ignored.
pub(crate) const WARMUP_FRAMES: u64 = 10;
