use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info};

use super::types::ExitStatus;

/// Lifecycle of the emulation thread as seen through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Booting,
    FirstFrame,
    Running,
    /// Parked mid-frame at a checkpoint.
    Paused,
    Exited,
}

/// Which thread may touch engine-owned state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Turn {
    Host,
    Emulation,
}

/// What the engine should do after a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    Continue,
    Stop,
}

/// Handshake state. Every transition is a plain method so the blocking gate
/// and the model check in the tests share one definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct GateState {
    pub(crate) phase: Phase,
    pub(crate) turn: Turn,
    pub(crate) frame_pending: bool,
    pub(crate) pause_requested: bool,
    pub(crate) paused_mid_frame: bool,
    pub(crate) stop_requested: bool,
    pub(crate) frames_remaining: u32,
    pub(crate) frames_completed: u64,
}

impl GateState {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Booting,
            turn: Turn::Host,
            frame_pending: false,
            pause_requested: false,
            paused_mid_frame: false,
            stop_requested: false,
            frames_remaining: 0,
            frames_completed: 0,
        }
    }

    #[inline]
    pub(crate) fn host_turn(&self) -> bool {
        self.turn == Turn::Host
    }

    #[inline]
    pub(crate) fn emulation_turn(&self) -> bool {
        self.turn == Turn::Emulation
    }

    #[inline]
    pub(crate) fn exited(&self) -> bool {
        self.phase == Phase::Exited
    }

    /// Returns `true` when the host has to wait for [`Self::host_turn`].
    pub(crate) fn begin_pause(&mut self) -> bool {
        if self.host_turn() {
            return false;
        }
        self.pause_requested = true;
        true
    }

    /// A pause stays outstanding only if the engine parked mid-frame.
    pub(crate) fn end_pause(&mut self) {
        self.pause_requested = self.paused_mid_frame && !self.exited();
    }

    /// Returns `true` when the turn went back to the engine.
    pub(crate) fn resume(&mut self) -> bool {
        let parked = self.pause_requested && self.paused_mid_frame && !self.exited();
        self.pause_requested = false;
        if parked {
            self.turn = Turn::Emulation;
        }
        parked
    }

    /// Returns `true` when the turn went back to the engine.
    pub(crate) fn begin_finish(&mut self) -> bool {
        self.resume()
    }

    pub(crate) fn finish_ready(&self) -> bool {
        self.host_turn() && (!self.frame_pending || self.exited())
    }

    /// Returns `true` when the turn went to the engine.
    pub(crate) fn advance(&mut self, frames: u32) -> bool {
        if self.exited() {
            return false;
        }
        assert!(
            !self.frame_pending,
            "advance called while a frame is still pending (phase {:?})",
            self.phase
        );
        assert!(self.host_turn(), "advance called without holding the turn");
        self.frame_pending = true;
        self.frames_remaining = frames.max(1);
        self.turn = Turn::Emulation;
        if self.phase == Phase::Booting {
            self.phase = Phase::FirstFrame;
        }
        true
    }

    /// One shutdown round trip. Returns `false` once the engine has exited,
    /// otherwise hands the turn to the engine and the host waits for it back.
    pub(crate) fn shutdown_step(&mut self) -> bool {
        if self.exited() {
            return false;
        }
        self.stop_requested = true;
        self.pause_requested = false;
        self.frame_pending = true;
        self.frames_remaining = 1;
        self.turn = Turn::Emulation;
        true
    }

    /// `None` means the engine parked and must wait for its turn.
    pub(crate) fn checkpoint(&mut self) -> Option<Flow> {
        if self.stop_requested {
            return Some(Flow::Stop);
        }
        if self.pause_requested {
            self.park();
            return None;
        }
        Some(Flow::Continue)
    }

    /// `None` means the engine gave up the turn and must wait for it.
    pub(crate) fn frame_complete(&mut self) -> Option<Flow> {
        self.frames_completed += 1;
        if self.phase == Phase::FirstFrame {
            self.phase = Phase::Running;
        }
        if self.stop_requested {
            return Some(Flow::Stop);
        }
        if self.frames_remaining > 1 {
            self.frames_remaining -= 1;
            return self.checkpoint();
        }
        self.frames_remaining = 0;
        self.frame_pending = false;
        self.turn = Turn::Host;
        None
    }

    /// Called by the engine after every wait once it holds the turn again.
    pub(crate) fn wake(&mut self) -> Flow {
        if self.paused_mid_frame {
            self.paused_mid_frame = false;
            self.phase = if self.frames_completed == 0 {
                Phase::FirstFrame
            } else {
                Phase::Running
            };
        }
        if self.stop_requested {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    pub(crate) fn exit(&mut self) {
        self.phase = Phase::Exited;
        self.turn = Turn::Host;
        self.frame_pending = false;
        self.frames_remaining = 0;
        self.pause_requested = false;
        self.paused_mid_frame = false;
    }

    fn park(&mut self) {
        self.paused_mid_frame = true;
        self.phase = Phase::Paused;
        self.turn = Turn::Host;
    }
}

struct Shared {
    state: GateState,
    exit_status: Option<ExitStatus>,
}

/// Two-thread rendezvous between the host and the emulation thread.
///
/// The gate owns a value `T` shared by both sides. The host reaches it only
/// through a [`HostAccess`] minted while it holds the turn; the emulation
/// thread only through its unique [`EmulationToken`].
pub struct FrameGate<T> {
    shared: Mutex<Shared>,
    cond: Condvar,
    exchange: UnsafeCell<T>,
    host_access_out: AtomicBool,
}

// SAFETY: `exchange` is only reached by the side holding the turn. The turn
// changes under `shared`'s lock, which orders the accesses.
unsafe impl<T: Send> Sync for FrameGate<T> {}

impl<T> FrameGate<T> {
    pub fn new(exchange: T) -> (Arc<Self>, EmulationToken<T>) {
        let gate = Arc::new(Self {
            shared: Mutex::new(Shared {
                state: GateState::new(),
                exit_status: None,
            }),
            cond: Condvar::new(),
            exchange: UnsafeCell::new(exchange),
            host_access_out: AtomicBool::new(false),
        });
        let token = EmulationToken {
            gate: Arc::clone(&gate),
            exited: false,
        };
        (gate, token)
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().state.phase
    }

    pub fn frames_completed(&self) -> u64 {
        self.shared.lock().state.frames_completed
    }

    pub fn is_exited(&self) -> bool {
        self.shared.lock().state.exited()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.shared.lock().exit_status.clone()
    }

    /// Stops the engine at its next checkpoint or frame end, whichever comes
    /// first. Returns immediately if no frame is in flight.
    pub fn request_pause(self: &Arc<Self>) -> HostAccess<T> {
        let mut shared = self.shared.lock();
        if shared.state.begin_pause() {
            debug!("waiting for the engine to pause");
            self.wait_host_turn(&mut shared);
            shared.state.end_pause();
        }
        self.mint(&shared)
    }

    /// Lets a paused engine continue its interrupted frame.
    pub fn resume(&self) {
        self.assert_no_host_access("resume");
        let mut shared = self.shared.lock();
        if shared.state.resume() {
            self.cond.notify_all();
        }
    }

    /// Waits for the in-flight frame to complete (or the engine to exit).
    pub fn request_finish(self: &Arc<Self>) -> HostAccess<T> {
        self.assert_no_host_access("request_finish");
        let mut shared = self.shared.lock();
        if shared.state.begin_finish() {
            self.cond.notify_all();
        }
        while !shared.state.finish_ready() {
            self.cond.wait(&mut shared);
        }
        self.mint(&shared)
    }

    /// Lets the engine produce the next `frames` quanta.
    pub fn advance(&self, frames: u32) {
        self.assert_no_host_access("advance");
        let mut shared = self.shared.lock();
        if shared.state.advance(frames) {
            self.cond.notify_all();
        }
    }

    /// Stops the engine and waits until it has exited. Idempotent.
    pub fn shutdown(&self) {
        self.assert_no_host_access("shutdown");
        let mut shared = self.shared.lock();
        if shared.state.exited() {
            return;
        }
        if shared.state.begin_pause() {
            self.wait_host_turn(&mut shared);
            shared.state.end_pause();
        }
        let mut rounds = 0u32;
        while shared.state.shutdown_step() {
            rounds += 1;
            self.cond.notify_all();
            self.wait_host_turn(&mut shared);
        }
        debug!(rounds, "engine stopped");
    }

    fn wait_host_turn(&self, shared: &mut MutexGuard<'_, Shared>) {
        while !shared.state.host_turn() {
            self.cond.wait(shared);
        }
    }

    fn mint(self: &Arc<Self>, shared: &MutexGuard<'_, Shared>) -> HostAccess<T> {
        assert!(shared.state.host_turn(), "host access minted without the turn");
        assert!(
            !self.host_access_out.swap(true, Ordering::AcqRel),
            "a HostAccess is already outstanding"
        );
        HostAccess {
            gate: Arc::clone(self),
        }
    }

    fn assert_no_host_access(&self, op: &str) {
        assert!(
            !self.host_access_out.load(Ordering::Acquire),
            "{op} called while a HostAccess is still held"
        );
    }

    fn emulation_wait(&self, shared: &mut MutexGuard<'_, Shared>) -> Flow {
        self.cond.notify_all();
        while !shared.state.emulation_turn() {
            self.cond.wait(shared);
        }
        shared.state.wake()
    }
}

/// Host-side view of the shared value while the engine is parked.
///
/// Only one can exist at a time; the gate refuses to hand the turn back while
/// it is alive.
pub struct HostAccess<T> {
    gate: Arc<FrameGate<T>>,
}

impl<T> HostAccess<T> {
    pub fn gate(&self) -> &Arc<FrameGate<T>> {
        &self.gate
    }
}

impl<T> Deref for HostAccess<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: minted while the host holds the turn; the turn cannot move
        // until this value is dropped.
        unsafe { &*self.gate.exchange.get() }
    }
}

impl<T> DerefMut for HostAccess<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `deref`; `host_access_out` makes this the only host view.
        unsafe { &mut *self.gate.exchange.get() }
    }
}

impl<T> Drop for HostAccess<T> {
    fn drop(&mut self) {
        self.gate.host_access_out.store(false, Ordering::Release);
    }
}

/// The emulation thread's unique handle on the gate.
///
/// Dropping it without calling [`EmulationToken::exit`] (for example while
/// unwinding) reports a crash so the host never waits forever.
pub struct EmulationToken<T> {
    gate: Arc<FrameGate<T>>,
    exited: bool,
}

impl<T> EmulationToken<T> {
    /// Blocks until the host requests the first frame.
    pub fn wait_start(&mut self) -> Flow {
        let mut shared = self.gate.shared.lock();
        let flow = self.gate.emulation_wait(&mut shared);
        info!(phase = ?shared.state.phase, "engine started");
        flow
    }

    /// Safe point inside a frame where the host may inspect shared state.
    pub fn checkpoint(&mut self) -> Flow {
        let mut shared = self.gate.shared.lock();
        match shared.state.checkpoint() {
            Some(flow) => flow,
            None => {
                debug!("parked at checkpoint");
                self.gate.emulation_wait(&mut shared)
            }
        }
    }

    /// Marks one quantum as produced.
    pub fn frame_complete(&mut self) -> Flow {
        let mut shared = self.gate.shared.lock();
        let first = shared.state.phase == Phase::FirstFrame;
        let outcome = shared.state.frame_complete();
        if first {
            info!("first frame completed");
        }
        match outcome {
            Some(flow) => flow,
            None => self.gate.emulation_wait(&mut shared),
        }
    }

    /// Publishes the exit status and hands the turn back for good.
    pub fn exit(mut self, status: ExitStatus) {
        self.finish(status);
    }

    /// Shared value; the emulation thread holds the turn whenever it runs.
    pub fn exchange(&mut self) -> &mut T {
        debug_assert!(self.gate.shared.lock().state.emulation_turn());
        // SAFETY: the emulation thread only runs while holding the turn and
        // this token is unique, so no other reference exists.
        unsafe { &mut *self.gate.exchange.get() }
    }

    pub fn gate(&self) -> &Arc<FrameGate<T>> {
        &self.gate
    }

    fn finish(&mut self, status: ExitStatus) {
        if self.exited {
            return;
        }
        self.exited = true;
        match &status {
            ExitStatus::Clean => info!("engine exited"),
            ExitStatus::Crashed(reason) => error!(%reason, "engine crashed"),
        }
        let mut shared = self.gate.shared.lock();
        shared.exit_status = Some(status);
        shared.state.exit();
        self.gate.cond.notify_all();
    }
}

impl<T> Drop for EmulationToken<T> {
    fn drop(&mut self) {
        if !self.exited {
            self.finish(ExitStatus::Crashed(
                "emulation thread ended without reporting an exit".to_string(),
            ));
        }
    }
}
