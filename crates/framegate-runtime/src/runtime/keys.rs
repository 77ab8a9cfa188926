use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use strum::EnumCount;

use super::types::{Event, HatBits, JOY_BUTTONS, Key, MouseButton, Port, SpeedToggle};

const KEY_BASE: usize = 0;
const MOUSE_BASE: usize = 128;
const JOY_BASE: usize = MOUSE_BASE + MouseButton::COUNT;
const HAT_BASE: usize = JOY_BASE + Port::COUNT * JOY_BUTTONS as usize;
const SPEED_BASE: usize = HAT_BASE + 4;

/// Size of the press-count table.
pub const INPUT_ID_COUNT: usize = SPEED_BASE + SpeedToggle::COUNT;

const HELD_BY_KEYBOARD: u8 = 0x80;
const COUNT_MASK: u8 = 0x7f;

/// Logical input whose down/up transitions are reference counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputId(u8);

impl InputId {
    #[inline]
    pub fn key(key: Key) -> Self {
        Self((KEY_BASE + key.code() as usize) as u8)
    }

    #[inline]
    pub fn mouse(button: MouseButton) -> Self {
        let offset = match button {
            MouseButton::Left => 0,
            MouseButton::Right => 1,
            MouseButton::Middle => 2,
        };
        Self((MOUSE_BASE + offset) as u8)
    }

    pub fn joy(port: Port, button: u8) -> Option<Self> {
        (button < JOY_BUTTONS)
            .then(|| Self((JOY_BASE + port.index() * JOY_BUTTONS as usize + button as usize) as u8))
    }

    /// Id for a single hat direction. Returns `None` unless exactly one bit is set.
    pub fn hat(bit: HatBits) -> Option<Self> {
        let raw = bit.bits();
        (raw.count_ones() == 1).then(|| Self((HAT_BASE + raw.trailing_zeros() as usize) as u8))
    }

    #[inline]
    pub fn speed(toggle: SpeedToggle) -> Self {
        let offset = match toggle {
            SpeedToggle::Faster => 0,
            SpeedToggle::Slower => 1,
        };
        Self((SPEED_BASE + offset) as u8)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The keyboard key this id stands for, if it is one.
    pub fn as_key(self) -> Option<Key> {
        if self.index() < MOUSE_BASE {
            Key::new(self.0)
        } else {
            None
        }
    }

    /// Maps a counted down/up event to its id and direction (`true` = down).
    ///
    /// Hat events are per bit and handled by the caller; they return `None` here.
    pub fn for_event(event: &Event) -> Option<(Self, bool)> {
        match *event {
            Event::KeyDown(key) => Some((Self::key(key), true)),
            Event::KeyUp(key) => Some((Self::key(key), false)),
            Event::MouseDown(button) => Some((Self::mouse(button), true)),
            Event::MouseUp(button) => Some((Self::mouse(button), false)),
            Event::JoyDown { port, button } => Self::joy(port, button).map(|id| (id, true)),
            Event::JoyUp { port, button } => Self::joy(port, button).map(|id| (id, false)),
            Event::SpeedSet(toggle) => Some((Self::speed(toggle), true)),
            Event::SpeedReset(toggle) => Some((Self::speed(toggle), false)),
            _ => None,
        }
    }
}

/// Press-count table shared by every producer.
///
/// Each slot holds a 7-bit saturating count of sources holding the input plus a
/// flag bit recording that the primary keyboard is one of them. Only the 0 -> 1
/// and 1 -> 0 transitions produce events.
pub struct KeyState {
    slots: [AtomicU8; INPUT_ID_COUNT],
    keys_down: AtomicUsize,
}

impl Default for KeyState {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyState {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU8::new(0)),
            keys_down: AtomicUsize::new(0),
        }
    }

    /// Registers one more source holding `id`. Returns `true` on the 0 -> 1 transition.
    pub fn press(&self, id: InputId) -> bool {
        let prev = self.update(id, |v| {
            let count = v & COUNT_MASK;
            if count == COUNT_MASK {
                None
            } else {
                Some((v & HELD_BY_KEYBOARD) | (count + 1))
            }
        });
        let first = prev.is_some_and(|v| v & COUNT_MASK == 0);
        if first && id.as_key().is_some() {
            self.keys_down.fetch_add(1, Ordering::AcqRel);
        }
        first
    }

    /// Drops one source holding `id`. Returns `true` on the 1 -> 0 transition.
    /// Releases of an input nobody holds are ignored.
    pub fn release(&self, id: InputId) -> bool {
        let prev = self.update(id, |v| match v & COUNT_MASK {
            0 => None,
            1 => Some(0),
            count => Some((v & HELD_BY_KEYBOARD) | (count - 1)),
        });
        let last = prev.is_some_and(|v| v & COUNT_MASK == 1);
        if last && id.as_key().is_some() {
            self.keys_down.fetch_sub(1, Ordering::AcqRel);
        }
        last
    }

    /// Keyboard press: only counts when nobody holds the key yet, and marks it
    /// as held by the keyboard.
    pub fn press_keyboard(&self, id: InputId) -> bool {
        let prev = self.update(id, |v| (v == 0).then_some(HELD_BY_KEYBOARD | 1));
        let first = prev.is_some();
        if first && id.as_key().is_some() {
            self.keys_down.fetch_add(1, Ordering::AcqRel);
        }
        first
    }

    /// Keyboard release: overrides every other source holding the key. Returns
    /// `true` when the input went up.
    pub fn release_keyboard(&self, id: InputId) -> bool {
        let prev = self.update(id, |v| (v & HELD_BY_KEYBOARD != 0).then_some(0));
        let released = prev.is_some_and(|v| v & COUNT_MASK != 0);
        if released && id.as_key().is_some() {
            self.keys_down.fetch_sub(1, Ordering::AcqRel);
        }
        released
    }

    #[inline]
    pub fn count(&self, id: InputId) -> u8 {
        self.slots[id.index()].load(Ordering::Acquire) & COUNT_MASK
    }

    #[inline]
    pub fn is_down(&self, id: InputId) -> bool {
        self.count(id) != 0
    }

    #[inline]
    pub fn held_by_keyboard(&self, id: InputId) -> bool {
        self.slots[id.index()].load(Ordering::Acquire) & HELD_BY_KEYBOARD != 0
    }

    /// Number of keyboard keys (not buttons) currently down.
    #[inline]
    pub fn keys_down(&self) -> usize {
        self.keys_down.load(Ordering::Acquire)
    }

    /// Keys currently flagged as held by the keyboard.
    pub fn keyboard_held(&self) -> impl Iterator<Item = Key> + '_ {
        Key::all().filter(|&key| self.held_by_keyboard(InputId::key(key)))
    }

    pub fn clear(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Release);
        }
        self.keys_down.store(0, Ordering::Release);
    }

    fn update(&self, id: InputId, f: impl FnMut(u8) -> Option<u8>) -> Option<u8> {
        self.slots[id.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, f)
            .ok()
    }
}
