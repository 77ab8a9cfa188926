pub mod audio;
pub mod runtime;

pub use audio::{AudioBudget, AudioFrame, AudioSink, AudioSource};
pub use runtime::{
    Axis, Bind, BindTarget, CycleConfig, CycleController, CycleSample, Device, EmulationToken,
    Engine, Event, EventKind, EventQueue, EventSender, Exchange, ExitStatus, Flow, FrameGate,
    FrameHandle, FrameOutput, FrameRateConverter, HatBits, HostAccess, HostFrame, HostTiming,
    InputId, InputMapper, InputSource, InputState, Key, KeyState, ModeSignature, MouseButton,
    Notification, OverloadMonitor, Pacer, PacerConfig, PacerError, PacingContext, Phase, Port,
    Quantum, QuantumOutcome, QueueConfig, RateAccumulator, SkipDecision, SpeedToggle, Throttle,
    VideoFrame,
};
