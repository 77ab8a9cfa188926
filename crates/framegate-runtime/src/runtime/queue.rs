use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering},
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use strum::{EnumCount, IntoEnumIterator};
use tracing::{debug, warn};

use super::{
    keys::{INPUT_ID_COUNT, InputId, KeyState},
    types::{Axis, Event, EventKind, HatBits, Key, MouseButton, Port, QueueConfig, SpeedToggle},
};

/// Where an event came from. Keyboard callbacks get override semantics in the
/// press-count table; everything else is a plain counted source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputSource {
    Keyboard,
    #[default]
    Binding,
}

const FIRST_DOWN: u8 = 1 << 0;
const LAST_DOWN: u8 = 1 << 1;
const LEVEL_DIRTY: u8 = 1 << 2;
/// The latest state changed at least once after the first.
const LEVEL_FLIPPED: u8 = 1 << 3;

const AXIS_DIRTY: u32 = 1 << 16;
const PAIR_DIRTY: u64 = 1 << 32;

/// Replay position of an overflow slot. `0` means unset.
struct Stamp(AtomicU64);

impl Stamp {
    const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Keeps the earliest stamp since the last take.
    fn first(&self, stamp: u64) {
        let _ = self
            .0
            .compare_exchange(0, stamp, Ordering::AcqRel, Ordering::Acquire);
    }

    fn latest(&self, stamp: u64) {
        self.0.store(stamp, Ordering::Release);
    }

    /// A slot whose stamp is not published yet sorts last.
    fn take(&self) -> u64 {
        match self.0.swap(0, Ordering::AcqRel) {
            0 => u64::MAX,
            stamp => stamp,
        }
    }
}

/// Down/up state of one input since the last drain.
///
/// Both the first and the latest state are kept, so a press followed by its
/// release replays as two events instead of collapsing into the release. A
/// slot that flipped and came back replays three edges.
struct LevelSlot {
    state: AtomicU8,
    first: Stamp,
    last: Stamp,
}

impl LevelSlot {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
            first: Stamp::new(),
            last: Stamp::new(),
        }
    }

    fn fold(&self, down: bool, stamp: u64) {
        let bits = if down { FIRST_DOWN | LAST_DOWN } else { 0 };
        let update = |state: u8| {
            if state & LEVEL_DIRTY == 0 {
                return Some(LEVEL_DIRTY | bits);
            }
            let mut next = (state & !LAST_DOWN) | (bits & LAST_DOWN);
            if next & LAST_DOWN != state & LAST_DOWN {
                next |= LEVEL_FLIPPED;
            }
            Some(next)
        };
        let (Ok(prev) | Err(prev)) =
            self.state
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, update);
        if prev & LEVEL_DIRTY == 0 {
            self.first.latest(stamp);
        }
        self.last.latest(stamp);
    }

    fn take(&self, pending: &mut Vec<(u64, Event)>, event: impl Fn(bool) -> Event) {
        let state = self.state.swap(0, Ordering::AcqRel);
        let (first, last) = (self.first.take(), self.last.take());
        if state & LEVEL_DIRTY == 0 {
            return;
        }
        let first_down = state & FIRST_DOWN != 0;
        let last_down = state & LAST_DOWN != 0;
        pending.push((first, event(first_down)));
        if last_down == first_down && state & LEVEL_FLIPPED != 0 {
            // Went away and came back: replay the opposite edge in between.
            pending.push((last, event(!first_down)));
            pending.push((last, event(last_down)));
        } else if last_down != first_down {
            pending.push((last, event(last_down)));
        }
    }
}

/// Last aggregate slot of the queue.
///
/// Once the ring is full, events are folded in here instead of being dropped.
/// Every [`EventKind`] has a slot, so folding cannot fail. Each slot carries
/// the stamp of the push that touched it first (or last, for absolute
/// positions) and [`OverflowTable::take`] replays slots in stamp order.
struct OverflowTable {
    seq: AtomicU64,
    /// Counted inputs by [`InputId`]; hat directions use their bit ids.
    levels: Box<[LevelSlot]>,
    /// Joystick buttons outside the counted range.
    joy_levels: Box<[LevelSlot]>,
    /// Latest stick position per port and axis, tagged with [`AXIS_DIRTY`].
    axes: [AtomicU32; Port::COUNT * Axis::COUNT],
    axis_stamps: [Stamp; Port::COUNT * Axis::COUNT],
    axis_pair: AtomicU64,
    pair_stamp: Stamp,
    mouse_dx: AtomicI32,
    mouse_dy: AtomicI32,
    mouse_stamp: Stamp,
    wheel: AtomicI32,
    wheel_stamp: Stamp,
    menu_toggles: AtomicU32,
    menu_stamp: Stamp,
    mounts_changed: AtomicBool,
    mounts_stamp: Stamp,
    system_refresh: AtomicBool,
    refresh_stamp: Stamp,
}

impl OverflowTable {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            levels: (0..INPUT_ID_COUNT).map(|_| LevelSlot::new()).collect(),
            joy_levels: (0..Port::COUNT * 256).map(|_| LevelSlot::new()).collect(),
            axes: std::array::from_fn(|_| AtomicU32::new(0)),
            axis_stamps: std::array::from_fn(|_| Stamp::new()),
            axis_pair: AtomicU64::new(0),
            pair_stamp: Stamp::new(),
            mouse_dx: AtomicI32::new(0),
            mouse_dy: AtomicI32::new(0),
            mouse_stamp: Stamp::new(),
            wheel: AtomicI32::new(0),
            wheel_stamp: Stamp::new(),
            menu_toggles: AtomicU32::new(0),
            menu_stamp: Stamp::new(),
            mounts_changed: AtomicBool::new(false),
            mounts_stamp: Stamp::new(),
            system_refresh: AtomicBool::new(false),
            refresh_stamp: Stamp::new(),
        }
    }

    fn fold(&self, event: Event) {
        let stamp = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let kind = event.kind();
        if kind.is_accumulatable() {
            self.accumulate(event, stamp);
            return;
        }
        let down = !kind.is_release();
        match event {
            Event::MouseMove { .. } | Event::MouseWheel(_) => self.accumulate(event, stamp),
            Event::KeyDown(key) | Event::KeyUp(key) => {
                self.levels[InputId::key(key).index()].fold(down, stamp)
            }
            Event::MouseDown(button) | Event::MouseUp(button) => {
                self.levels[InputId::mouse(button).index()].fold(down, stamp)
            }
            Event::JoyDown { port, button } | Event::JoyUp { port, button } => {
                self.joy_slot(port, button).fold(down, stamp)
            }
            Event::HatSet(bits) | Event::HatUnset(bits) => {
                for bit in bits.iter() {
                    if let Some(id) = InputId::hat(bit) {
                        self.levels[id.index()].fold(down, stamp);
                    }
                }
            }
            Event::SpeedSet(toggle) | Event::SpeedReset(toggle) => {
                self.levels[InputId::speed(toggle).index()].fold(down, stamp)
            }
            Event::JoyAxis { port, axis, value } => {
                let slot = axis_slot(port, axis);
                self.axes[slot].store(AXIS_DIRTY | u32::from(value as u16), Ordering::Release);
                self.axis_stamps[slot].latest(stamp);
            }
            Event::AxisPair { x, y } => {
                let packed = PAIR_DIRTY | (u64::from(x as u16) << 16) | u64::from(y as u16);
                self.axis_pair.store(packed, Ordering::Release);
                self.pair_stamp.latest(stamp);
            }
            Event::MenuToggle => {
                self.menu_toggles.fetch_add(1, Ordering::AcqRel);
                self.menu_stamp.first(stamp);
            }
            Event::MountsChanged => {
                self.mounts_changed.store(true, Ordering::Release);
                self.mounts_stamp.first(stamp);
            }
            Event::SystemRefresh => {
                self.system_refresh.store(true, Ordering::Release);
                self.refresh_stamp.first(stamp);
            }
        }
    }

    /// Sums a relative delta into its slot.
    fn accumulate(&self, event: Event, stamp: u64) {
        match event {
            Event::MouseMove { dx, dy } => {
                self.mouse_dx.fetch_add(dx, Ordering::AcqRel);
                self.mouse_dy.fetch_add(dy, Ordering::AcqRel);
                self.mouse_stamp.first(stamp);
            }
            Event::MouseWheel(delta) => {
                self.wheel.fetch_add(delta, Ordering::AcqRel);
                self.wheel_stamp.first(stamp);
            }
            other => debug_assert!(false, "no accumulator for {:?}", other.kind()),
        }
    }

    fn joy_slot(&self, port: Port, button: u8) -> &LevelSlot {
        match InputId::joy(port, button) {
            Some(id) => &self.levels[id.index()],
            None => &self.joy_levels[port.index() * 256 + button as usize],
        }
    }

    /// Empties the table, replaying the dirty slots in the order they were
    /// first touched.
    fn take(&self, f: &mut impl FnMut(Event)) -> usize {
        let mut pending = Vec::new();

        for key in Key::all() {
            self.levels[InputId::key(key).index()].take(&mut pending, |down| {
                if down { Event::KeyDown(key) } else { Event::KeyUp(key) }
            });
        }
        for button in MouseButton::iter() {
            self.levels[InputId::mouse(button).index()].take(&mut pending, |down| {
                if down { Event::MouseDown(button) } else { Event::MouseUp(button) }
            });
        }
        for port in Port::iter() {
            for button in 0..=u8::MAX {
                self.joy_slot(port, button).take(&mut pending, |down| {
                    if down {
                        Event::JoyDown { port, button }
                    } else {
                        Event::JoyUp { port, button }
                    }
                });
            }
        }
        for bit in HatBits::all().iter() {
            let Some(id) = InputId::hat(bit) else { continue };
            self.levels[id.index()].take(&mut pending, |down| {
                if down { Event::HatSet(bit) } else { Event::HatUnset(bit) }
            });
        }
        for toggle in SpeedToggle::iter() {
            self.levels[InputId::speed(toggle).index()].take(&mut pending, |down| {
                if down { Event::SpeedSet(toggle) } else { Event::SpeedReset(toggle) }
            });
        }
        for port in Port::iter() {
            for axis in Axis::iter() {
                let slot = axis_slot(port, axis);
                let raw = self.axes[slot].swap(0, Ordering::AcqRel);
                let stamp = self.axis_stamps[slot].take();
                if raw & AXIS_DIRTY != 0 {
                    let value = raw as u16 as i16;
                    pending.push((stamp, Event::JoyAxis { port, axis, value }));
                }
            }
        }
        let pair = self.axis_pair.swap(0, Ordering::AcqRel);
        let stamp = self.pair_stamp.take();
        if pair & PAIR_DIRTY != 0 {
            let (x, y) = ((pair >> 16) as u16 as i16, pair as u16 as i16);
            pending.push((stamp, Event::AxisPair { x, y }));
        }
        let dx = self.mouse_dx.swap(0, Ordering::AcqRel);
        let dy = self.mouse_dy.swap(0, Ordering::AcqRel);
        let stamp = self.mouse_stamp.take();
        if dx != 0 || dy != 0 {
            pending.push((stamp, Event::MouseMove { dx, dy }));
        }
        let wheel = self.wheel.swap(0, Ordering::AcqRel);
        let stamp = self.wheel_stamp.take();
        if wheel != 0 {
            pending.push((stamp, Event::MouseWheel(wheel)));
        }
        // An even number of toggles cancels out.
        let toggles = self.menu_toggles.swap(0, Ordering::AcqRel);
        let stamp = self.menu_stamp.take();
        if toggles % 2 == 1 {
            pending.push((stamp, Event::MenuToggle));
        }
        let stamp = self.mounts_stamp.take();
        if self.mounts_changed.swap(false, Ordering::AcqRel) {
            pending.push((stamp, Event::MountsChanged));
        }
        let stamp = self.refresh_stamp.take();
        if self.system_refresh.swap(false, Ordering::AcqRel) {
            pending.push((stamp, Event::SystemRefresh));
        }

        // Stable, so slots without a published stamp keep the scan order.
        pending.sort_by_key(|&(stamp, _)| stamp);
        let emitted = pending.len();
        for (_, event) in pending {
            f(event);
        }
        emitted
    }

    fn reset(&self) {
        self.take(&mut |_| {});
    }
}

#[inline]
fn axis_slot(port: Port, axis: Axis) -> usize {
    port.index() * Axis::COUNT
        + match axis {
            Axis::X => 0,
            Axis::Y => 1,
        }
}

/// Bounded multi-producer queue carrying input from the host side to the
/// engine.
///
/// Pushing never blocks. The ring holds `capacity - 1` events; the last slot
/// is the overflow table which absorbs everything pushed while the ring is full
/// and replays it, coalesced, after the ring has been drained.
pub struct EventQueue {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    keys: KeyState,
    overflow: OverflowTable,
    /// Pushes route to the overflow table while set.
    overflowed: AtomicBool,
    /// The overflow table may hold unread events.
    overflow_dirty: AtomicBool,
    capacity: usize,
}

impl EventQueue {
    /// Creates a queue with `config.capacity` slots. Callers validate the
    /// config first; a capacity below 2 is raised to 2.
    pub fn new(config: QueueConfig) -> Self {
        let capacity = config.capacity.max(2);
        let (tx, rx) = bounded(capacity - 1);
        Self {
            tx,
            rx,
            keys: KeyState::new(),
            overflow: OverflowTable::new(),
            overflowed: AtomicBool::new(false),
            overflow_dirty: AtomicBool::new(false),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events waiting in the ring (the overflow table is not counted).
    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty() && !self.overflow_dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    pub fn keys(&self) -> &KeyState {
        &self.keys
    }

    /// Queues an event. Returns `false` when press counting suppressed it
    /// (a duplicate down or a release while other sources still hold the input).
    pub fn push(&self, source: InputSource, event: Event) -> bool {
        match self.admit(source, event) {
            Some(event) => {
                self.enqueue(event);
                true
            }
            None => false,
        }
    }

    /// Releases every key the keyboard still holds but whose physical key is
    /// no longer down. Returns the number of keys released.
    pub fn release_stale_keys(&self, mut is_down: impl FnMut(Key) -> bool) -> usize {
        if self.keys.keys_down() == 0 {
            return 0;
        }
        let stale: Vec<Key> = self.keys.keyboard_held().filter(|&key| !is_down(key)).collect();
        let mut released = 0;
        for key in stale {
            if self.keys.release_keyboard(InputId::key(key)) {
                debug!(key = %key, "releasing stale key");
                self.enqueue(Event::KeyUp(key));
                released += 1;
            }
        }
        released
    }

    /// Discards pending events and press counts.
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
        self.overflow_dirty.store(false, Ordering::Release);
        self.overflow.reset();
        self.overflowed.store(false, Ordering::Release);
        self.keys.clear();
    }

    /// Dispatches everything queued so far: the ring in FIFO order, then the
    /// overflow table. Only the engine thread calls this, once per quantum.
    pub(crate) fn drain(&self, mut f: impl FnMut(Event)) -> usize {
        // Bounded so producers cannot starve the engine.
        let pending = self.rx.len();
        let mut dispatched = 0;
        for _ in 0..pending {
            match self.rx.try_recv() {
                Ok(event) => {
                    f(event);
                    dispatched += 1;
                }
                Err(_) => break,
            }
        }
        if self.rx.is_empty() {
            self.overflowed.store(false, Ordering::Release);
        }
        if self.overflow_dirty.swap(false, Ordering::AcqRel) {
            dispatched += self.overflow.take(&mut f);
        }
        dispatched
    }

    fn admit(&self, source: InputSource, event: Event) -> Option<Event> {
        match event {
            Event::HatSet(bits) | Event::HatUnset(bits) => {
                let down = event.kind() == EventKind::HatSet;
                let mut changed = HatBits::empty();
                for bit in bits.iter() {
                    let Some(id) = InputId::hat(bit) else { continue };
                    if self.count(source, id, down) {
                        changed |= bit;
                    }
                }
                if changed.is_empty() {
                    None
                } else if down {
                    Some(Event::HatSet(changed))
                } else {
                    Some(Event::HatUnset(changed))
                }
            }
            _ => match InputId::for_event(&event) {
                Some((id, down)) => self.count(source, id, down).then_some(event),
                None => Some(event),
            },
        }
    }

    fn count(&self, source: InputSource, id: InputId, down: bool) -> bool {
        match (source, down) {
            (InputSource::Keyboard, true) => self.keys.press_keyboard(id),
            (InputSource::Keyboard, false) => self.keys.release_keyboard(id),
            (InputSource::Binding, true) => self.keys.press(id),
            (InputSource::Binding, false) => self.keys.release(id),
        }
    }

    fn enqueue(&self, event: Event) {
        if !self.overflowed.load(Ordering::Acquire) {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    if !self.overflowed.swap(true, Ordering::AcqRel) {
                        warn!(
                            capacity = self.capacity,
                            kind = ?event.kind(),
                            "event queue full, coalescing until the engine drains it"
                        );
                    }
                }
            }
        }
        self.overflow.fold(event);
        self.overflow_dirty.store(true, Ordering::Release);
    }
}

/// Cloneable producer handle onto the pacer's [`EventQueue`].
#[derive(Clone)]
pub struct EventSender {
    queue: Arc<EventQueue>,
}

impl EventSender {
    pub(crate) fn new(queue: Arc<EventQueue>) -> Self {
        Self { queue }
    }

    #[inline]
    pub fn push(&self, event: Event) -> bool {
        self.queue.push(InputSource::Binding, event)
    }

    #[inline]
    pub fn push_from(&self, source: InputSource, event: Event) -> bool {
        self.queue.push(source, event)
    }

    /// Keyboard callback entry point.
    pub fn keyboard(&self, key: Key, down: bool) -> bool {
        let event = if down { Event::KeyDown(key) } else { Event::KeyUp(key) };
        self.queue.push(InputSource::Keyboard, event)
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn queue(capacity: usize) -> EventQueue {
        EventQueue::new(QueueConfig { capacity })
    }

    fn drained(q: &EventQueue) -> Vec<Event> {
        let mut out = Vec::new();
        q.drain(|e| out.push(e));
        out
    }

    #[test]
    fn mouse_moves_coalesce_into_last_slot() {
        let q = queue(8);
        for dx in [1, 1, 1, 1, 1, 1, 1, 1, 5] {
            q.push(InputSource::Binding, Event::MouseMove { dx, dy: 0 });
        }
        assert!(q.is_overflowed());
        let events = drained(&q);
        assert!(events.len() <= 8);
        let total: i32 = events
            .iter()
            .map(|e| match e {
                Event::MouseMove { dx, .. } => *dx,
                other => panic!("unexpected {other:?}"),
            })
            .sum();
        assert_eq!(total, 13);
        assert_eq!(events.last(), Some(&Event::MouseMove { dx: 6, dy: 0 }));
        assert!(!q.is_overflowed());
        assert!(q.is_empty());
    }

    #[test]
    fn pushes_route_to_ring_again_after_drain() {
        let q = queue(2);
        q.push(InputSource::Binding, Event::MouseWheel(1));
        q.push(InputSource::Binding, Event::MouseWheel(2));
        assert!(q.is_overflowed());
        assert_eq!(drained(&q), vec![Event::MouseWheel(1), Event::MouseWheel(2)]);
        q.push(InputSource::Binding, Event::MouseWheel(3));
        assert!(!q.is_overflowed());
        assert_eq!(q.len(), 1);
        assert_eq!(drained(&q), vec![Event::MouseWheel(3)]);
    }

    #[test]
    fn duplicate_downs_collapse() {
        let q = queue(16);
        assert!(q.push(InputSource::Binding, Event::KeyDown(Key::SPACE)));
        assert!(!q.push(InputSource::Binding, Event::KeyDown(Key::SPACE)));
        assert!(!q.push(InputSource::Binding, Event::KeyUp(Key::SPACE)));
        assert!(q.push(InputSource::Binding, Event::KeyUp(Key::SPACE)));
        assert_eq!(
            drained(&q),
            vec![Event::KeyDown(Key::SPACE), Event::KeyUp(Key::SPACE)]
        );
    }

    #[test]
    fn hat_bits_counted_individually() {
        let q = queue(16);
        q.push(InputSource::Binding, Event::HatSet(HatBits::UP));
        q.push(InputSource::Binding, Event::HatSet(HatBits::UP | HatBits::LEFT));
        q.push(InputSource::Binding, Event::HatUnset(HatBits::UP));
        assert_eq!(
            drained(&q),
            vec![Event::HatSet(HatBits::UP), Event::HatSet(HatBits::LEFT)]
        );
    }

    #[test]
    fn overflow_replays_in_first_touched_order() {
        let q = queue(2);
        q.push(InputSource::Binding, Event::SystemRefresh);
        q.push(InputSource::Binding, Event::JoyAxis { port: Port::One, axis: Axis::X, value: 100 });
        q.push(InputSource::Binding, Event::JoyAxis { port: Port::One, axis: Axis::X, value: -7 });
        q.push(InputSource::Binding, Event::MenuToggle);
        q.push(InputSource::Binding, Event::MenuToggle);
        q.push(InputSource::Binding, Event::MenuToggle);
        q.push(InputSource::Binding, Event::KeyDown(Key::ESC));
        q.push(InputSource::Binding, Event::KeyUp(Key::ESC));
        q.push(InputSource::Binding, Event::MountsChanged);
        q.push(InputSource::Binding, Event::AxisPair { x: -3, y: 9 });
        assert_eq!(
            drained(&q),
            vec![
                Event::SystemRefresh,
                Event::JoyAxis { port: Port::One, axis: Axis::X, value: -7 },
                Event::MenuToggle,
                Event::KeyDown(Key::ESC),
                Event::KeyUp(Key::ESC),
                Event::MountsChanged,
                Event::AxisPair { x: -3, y: 9 },
            ]
        );
    }

    #[test]
    fn taps_and_drags_survive_a_full_ring() {
        let q = queue(2);
        q.push(InputSource::Binding, Event::MouseWheel(1));
        q.push(InputSource::Binding, Event::KeyDown(Key::ESC));
        q.push(InputSource::Binding, Event::KeyUp(Key::ESC));
        q.push(InputSource::Binding, Event::MouseDown(MouseButton::Left));
        q.push(InputSource::Binding, Event::MouseMove { dx: 4, dy: 0 });
        q.push(InputSource::Binding, Event::MouseMove { dx: 6, dy: 0 });
        q.push(InputSource::Binding, Event::MouseUp(MouseButton::Left));
        assert!(q.is_overflowed());
        assert_eq!(
            drained(&q),
            vec![
                Event::MouseWheel(1),
                Event::KeyDown(Key::ESC),
                Event::KeyUp(Key::ESC),
                Event::MouseDown(MouseButton::Left),
                Event::MouseMove { dx: 10, dy: 0 },
                Event::MouseUp(MouseButton::Left),
            ]
        );
    }

    #[test]
    fn release_and_repress_keeps_every_edge() {
        let q = queue(2);
        q.push(InputSource::Binding, Event::MenuToggle);
        q.push(InputSource::Binding, Event::HatSet(HatBits::UP));
        q.push(InputSource::Binding, Event::HatUnset(HatBits::UP));
        q.push(InputSource::Binding, Event::HatSet(HatBits::UP));
        assert_eq!(
            drained(&q),
            vec![
                Event::MenuToggle,
                Event::HatSet(HatBits::UP),
                Event::HatUnset(HatBits::UP),
                Event::HatSet(HatBits::UP),
            ]
        );
        assert!(q.keys().is_down(InputId::hat(HatBits::UP).expect("hat id")));
    }

    #[test]
    fn every_kind_folds() {
        let table = OverflowTable::new();
        let samples = [
            Event::KeyDown(Key::TAB),
            Event::KeyUp(Key::TAB),
            Event::MouseMove { dx: 1, dy: 2 },
            Event::MouseDown(MouseButton::Right),
            Event::MouseUp(MouseButton::Right),
            Event::MouseWheel(-1),
            Event::JoyAxis { port: Port::Two, axis: Axis::Y, value: 5 },
            Event::JoyDown { port: Port::Two, button: 9 },
            Event::JoyUp { port: Port::One, button: 1 },
            Event::HatSet(HatBits::DOWN),
            Event::HatUnset(HatBits::RIGHT),
            Event::SpeedSet(SpeedToggle::Faster),
            Event::SpeedReset(SpeedToggle::Slower),
            Event::MenuToggle,
            Event::AxisPair { x: 1, y: 1 },
            Event::MountsChanged,
            Event::SystemRefresh,
        ];
        let kinds: std::collections::HashSet<EventKind> = samples.iter().map(Event::kind).collect();
        assert_eq!(kinds.len(), EventKind::COUNT);
        assert!(EventKind::iter().all(|kind| kinds.contains(&kind)));
        for event in samples {
            table.fold(event);
        }
        let mut out = Vec::new();
        table.take(&mut |e| out.push(e));
        assert!(out.contains(&Event::JoyDown { port: Port::Two, button: 9 }));
        assert!(out.contains(&Event::KeyUp(Key::TAB)));
        assert!(out.contains(&Event::MouseMove { dx: 1, dy: 2 }));
        assert_eq!(out.first(), Some(&Event::KeyDown(Key::TAB)));
        assert_eq!(out.last(), Some(&Event::SystemRefresh));
        assert_eq!(table.take(&mut |_| {}), 0);
    }

    #[test]
    fn only_relative_deltas_are_summed() {
        let table = OverflowTable::new();
        let pairs = [
            (Event::MouseWheel(2), Event::MouseWheel(3)),
            (Event::AxisPair { x: 5, y: 5 }, Event::AxisPair { x: 7, y: -1 }),
            (
                Event::JoyAxis { port: Port::One, axis: Axis::Y, value: 10 },
                Event::JoyAxis { port: Port::One, axis: Axis::Y, value: 20 },
            ),
        ];
        for (a, b) in pairs {
            table.fold(a);
            table.fold(b);
            let mut out = Vec::new();
            table.take(&mut |e| out.push(e));
            let expected = match (a, b) {
                (Event::MouseWheel(x), Event::MouseWheel(y)) => Event::MouseWheel(x + y),
                _ => b,
            };
            assert_eq!(a.kind().is_accumulatable(), expected != b);
            assert_eq!(out, vec![expected]);
        }
    }

    #[test]
    fn stale_keyboard_keys_are_released() {
        let q = queue(16);
        let sender = EventSender::new(Arc::new(q));
        sender.keyboard(Key::LEFT_ALT, true);
        sender.keyboard(Key::TAB, true);
        let q = sender.queue();
        assert_eq!(q.release_stale_keys(|key| key == Key::TAB), 1);
        assert_eq!(
            drained(q),
            vec![
                Event::KeyDown(Key::LEFT_ALT),
                Event::KeyDown(Key::TAB),
                Event::KeyUp(Key::LEFT_ALT),
            ]
        );
        assert_eq!(q.keys().keys_down(), 1);
    }

    #[test]
    fn clear_discards_everything() {
        let q = queue(2);
        q.push(InputSource::Binding, Event::KeyDown(Key::UP));
        q.push(InputSource::Binding, Event::MouseWheel(3));
        q.clear();
        assert!(drained(&q).is_empty());
        assert!(!q.keys().is_down(InputId::key(Key::UP)));
    }

    proptest! {
        #[test]
        fn displacement_is_preserved(
            capacity in 2usize..16,
            moves in prop::collection::vec((-50i32..50, -50i32..50), 0..64),
        ) {
            let q = queue(capacity);
            for &(dx, dy) in &moves {
                q.push(InputSource::Binding, Event::MouseMove { dx, dy });
            }
            let events = drained(&q);
            prop_assert!(events.len() <= capacity);
            let (mut sx, mut sy) = (0, 0);
            for e in events {
                if let Event::MouseMove { dx, dy } = e {
                    sx += dx;
                    sy += dy;
                }
            }
            prop_assert_eq!(sx, moves.iter().map(|m| m.0).sum::<i32>());
            prop_assert_eq!(sy, moves.iter().map(|m| m.1).sum::<i32>());
        }

        #[test]
        fn final_key_state_survives_overflow(
            ops in prop::collection::vec((0u8..4, any::<bool>()), 0..48),
        ) {
            let q = queue(4);
            let keys = [Key::UP, Key::DOWN, Key::LEFT, Key::RIGHT];
            let mut held = [false; 4];
            for (k, down) in ops {
                let key = keys[k as usize];
                // One source per key, so each accepted push toggles the state.
                if down != held[k as usize] {
                    let event = if down { Event::KeyDown(key) } else { Event::KeyUp(key) };
                    prop_assert!(q.push(InputSource::Binding, event));
                    held[k as usize] = down;
                }
            }
            let mut seen = [false; 4];
            for e in drained(&q) {
                match e {
                    Event::KeyDown(key) => seen[keys.iter().position(|&k| k == key).unwrap_or(0)] = true,
                    Event::KeyUp(key) => seen[keys.iter().position(|&k| k == key).unwrap_or(0)] = false,
                    _ => {}
                }
            }
            prop_assert_eq!(seen, held);
        }
    }
}
