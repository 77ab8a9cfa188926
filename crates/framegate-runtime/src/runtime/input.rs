use super::{
    queue::EventSender,
    types::{Axis, Event, HatBits, Key, MouseButton, Port, SpeedToggle},
};

/// Analog magnitude above which an axis counts as pushed for axis-to-key binds.
const AXIS_KEY_THRESHOLD: i16 = 12_000;
const AXIS_MAX: i16 = i16::MAX;

/// Frontend device class a bind reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Joypad,
    Analog,
    Mouse,
    Keyboard,
}

/// Frontend input state as the host polls it once per refresh.
pub trait InputState {
    /// Latches the frontend's input for this refresh.
    fn poll(&mut self) {}

    fn state(&self, port: u8, device: Device, index: u8, id: u16) -> i16;

    /// Physical keyboard state, used to release stuck keys.
    fn key_down(&self, key: Key) -> bool;

    /// Relative pointer motion since the last poll.
    fn mouse_delta(&self) -> (i32, i32) {
        (0, 0)
    }
}

/// What a bound frontend input drives on the emulated side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindTarget {
    Key(Key),
    MouseButton(MouseButton),
    JoyButton { port: Port, button: u8 },
    Hat(HatBits),
    Speed(SpeedToggle),
    /// `digital` is `0` for analog sources, or `1`/`-1` for a button pushing the
    /// axis fully in that direction.
    Axis { port: Port, axis: Axis, digital: i8 },
    AxisToKey { negative: Key, positive: Key },
    MenuToggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bind {
    pub port: u8,
    pub device: Device,
    pub index: u8,
    pub id: u16,
    pub target: BindTarget,
    last: i16,
}

impl Bind {
    pub fn new(port: u8, device: Device, index: u8, id: u16, target: BindTarget) -> Self {
        Self {
            port,
            device,
            index,
            id,
            target,
            last: 0,
        }
    }

    fn read(&self, input: &impl InputState) -> i16 {
        input.state(self.port, self.device, self.index, self.id)
    }

    /// Axis value this bind contributes for a raw frontend reading.
    fn axis_value(&self, raw: i16) -> i16 {
        match self.target {
            BindTarget::Axis { digital: 0, .. } => raw,
            BindTarget::Axis { digital, .. } if raw != 0 => AXIS_MAX * i16::from(digital.signum()),
            _ => 0,
        }
    }
}

fn axis_direction(value: i16) -> i8 {
    if value < -AXIS_KEY_THRESHOLD {
        -1
    } else if value > AXIS_KEY_THRESHOLD {
        1
    } else {
        0
    }
}

/// Host-side binding table turning polled frontend state into queue events.
#[derive(Debug)]
pub struct InputMapper {
    binds: Vec<Bind>,
    intercept: bool,
    mouse_input: bool,
}

impl Default for InputMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl InputMapper {
    pub fn new() -> Self {
        Self {
            binds: Vec::new(),
            intercept: false,
            mouse_input: true,
        }
    }

    pub fn bind(&mut self, bind: Bind) -> &mut Self {
        self.binds.push(bind);
        self
    }

    pub fn binds(&self) -> &[Bind] {
        &self.binds
    }

    pub fn clear(&mut self) {
        self.binds.clear();
    }

    /// While intercepting (an on-screen UI owns the input), zero axis readings
    /// are forwarded as-is.
    pub fn set_intercept(&mut self, intercept: bool) {
        self.intercept = intercept;
    }

    pub fn set_mouse_input(&mut self, enabled: bool) {
        self.mouse_input = enabled;
    }

    /// Polls every bind and pushes the changes. Returns the number of events
    /// the queue accepted.
    pub fn poll(&mut self, input: &mut impl InputState, events: &EventSender) -> usize {
        input.poll();
        let mut pushed = 0;
        for i in 0..self.binds.len() {
            let bind = self.binds[i];
            let raw = bind.read(&*input);
            if raw == bind.last {
                continue;
            }
            pushed += self.dispatch(i, raw, &*input, events);
            self.binds[i].last = raw;
        }

        if self.mouse_input {
            let (dx, dy) = input.mouse_delta();
            if (dx != 0 || dy != 0) && events.push(Event::MouseMove { dx, dy }) {
                pushed += 1;
            }
        }

        pushed + events.queue().release_stale_keys(|key| input.key_down(key))
    }

    fn dispatch(&self, i: usize, raw: i16, input: &impl InputState, events: &EventSender) -> usize {
        let bind = &self.binds[i];
        let button = |down: Event, up: Event| usize::from(events.push(if raw != 0 { down } else { up }));
        match bind.target {
            BindTarget::Key(key) => button(Event::KeyDown(key), Event::KeyUp(key)),
            BindTarget::MouseButton(b) => button(Event::MouseDown(b), Event::MouseUp(b)),
            BindTarget::JoyButton { port, button: b } => button(
                Event::JoyDown { port, button: b },
                Event::JoyUp { port, button: b },
            ),
            BindTarget::Hat(bits) => button(Event::HatSet(bits), Event::HatUnset(bits)),
            BindTarget::Speed(t) => button(Event::SpeedSet(t), Event::SpeedReset(t)),
            BindTarget::MenuToggle => {
                usize::from(raw != 0 && bind.last == 0 && events.push(Event::MenuToggle))
            }
            BindTarget::Axis { port, axis, .. } => {
                let mut value = bind.axis_value(raw);
                if value == 0 && !self.intercept {
                    value = self.substitute_axis(i, port, axis, input);
                }
                usize::from(events.push(Event::JoyAxis { port, axis, value }))
            }
            BindTarget::AxisToKey { negative, positive } => {
                let key = |dir: i8| if dir < 0 { negative } else { positive };
                let (cur, last) = (axis_direction(raw), axis_direction(bind.last));
                match (last, cur) {
                    (l, c) if l == c => 0,
                    (0, c) => usize::from(events.push(Event::KeyDown(key(c)))),
                    (l, 0) => usize::from(events.push(Event::KeyUp(key(l)))),
                    (l, c) => {
                        usize::from(events.push(Event::KeyUp(key(l))))
                            + usize::from(events.push(Event::KeyDown(key(c))))
                    }
                }
            }
        }
    }

    /// Another input bound to the same axis may still be pushed; report it
    /// instead of centering the axis.
    fn substitute_axis(&self, skip: usize, port: Port, axis: Axis, input: &impl InputState) -> i16 {
        self.binds
            .iter()
            .enumerate()
            .filter(|&(j, b)| {
                j != skip
                    && matches!(b.target, BindTarget::Axis { port: p, axis: a, .. } if p == port && a == axis)
            })
            .map(|(_, b)| b.axis_value(b.read(input)))
            .find(|&v| v != 0)
            .unwrap_or(0)
    }
}
