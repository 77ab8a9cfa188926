mod cycles;
mod engine;
mod frame_rate;
mod gate;
mod handle;
mod input;
mod keys;
mod overload;
mod queue;
mod runner;
mod types;

pub use cycles::{CycleController, CycleSample, PacingContext};
pub use engine::{Engine, Exchange, FrameOutput, Quantum, QuantumOutcome, VideoFrame};
pub use frame_rate::{FrameRateConverter, RateAccumulator, SkipDecision};
pub use gate::{EmulationToken, Flow, FrameGate, HostAccess, Phase};
pub use handle::{FrameHandle, Pacer};
pub use input::{Bind, BindTarget, Device, InputMapper, InputState};
pub use keys::{INPUT_ID_COUNT, InputId, KeyState};
pub use overload::OverloadMonitor;
pub use queue::{EventQueue, EventSender, InputSource};
pub use types::{
    Axis, CycleConfig, Event, EventKind, ExitStatus, HatBits, HostFrame, HostTiming, JOY_BUTTONS,
    Key, ModeSignature, MouseButton, Notification, PacerConfig, PacerError, Port, QueueConfig,
    SpeedToggle, Throttle,
};
