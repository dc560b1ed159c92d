//! Keyboard and mouse injection.
//!
//! The service does not own an input stack. Packets are handed to an
//! [`InputSink`] supplied by whoever hosts the service; without one, injection
//! requests succeed and do nothing.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use memgate_proto::{KeyboardInput, MouseInput};

/// Receiver of injected input packets.
pub trait InputSink: Send + Sync {
    fn keyboard(&self, input: &KeyboardInput);

    fn mouse(&self, input: &MouseInput);

    /// The injection delay offset changed.
    fn set_delay(&self, _offset: i32) {}
}

const BUTTONS: [(u16, u16); 5] = [
    (MouseInput::LEFT_BUTTON_DOWN, MouseInput::LEFT_BUTTON_UP),
    (MouseInput::RIGHT_BUTTON_DOWN, MouseInput::RIGHT_BUTTON_UP),
    (MouseInput::MIDDLE_BUTTON_DOWN, MouseInput::MIDDLE_BUTTON_UP),
    (MouseInput::BUTTON_4_DOWN, MouseInput::BUTTON_4_UP),
    (MouseInput::BUTTON_5_DOWN, MouseInput::BUTTON_5_UP),
];

fn pack(x: i32, y: i32) -> u64 {
    ((x as u32 as u64) << 32) | y as u32 as u64
}

fn unpack(position: u64) -> (i32, i32) {
    ((position >> 32) as u32 as i32, position as u32 as i32)
}

/// Mouse state seen by injected packets: which buttons are held and the last
/// pointer position.
///
/// While an injection delay is active, movement is pinned: absolute moves are
/// replaced by the last recorded position and relative moves are zeroed.
/// Otherwise packets update the recorded position.
#[derive(Debug, Default)]
pub struct MouseState {
    held: AtomicU8,
    position: AtomicU64,
}

impl MouseState {
    pub const fn new() -> Self {
        Self {
            held: AtomicU8::new(0),
            position: AtomicU64::new(0),
        }
    }

    pub fn is_held(&self, button: usize) -> bool {
        button < BUTTONS.len() && self.held.load(Ordering::Acquire) & (1 << button) != 0
    }

    pub fn position(&self) -> (i32, i32) {
        unpack(self.position.load(Ordering::Acquire))
    }

    /// Strip redundant presses and releases from `input`, apply the movement
    /// rules for `delay`, then record what remains.
    pub fn sanitize(&self, input: &mut MouseInput, delay: i32) {
        let held = self.held.load(Ordering::Acquire);
        for (index, (down, up)) in BUTTONS.iter().enumerate() {
            let pressed = held & (1 << index) != 0;
            if pressed && input.button_flags & down != 0 {
                input.button_flags &= !down;
            }
            if !pressed && input.button_flags & up != 0 {
                input.button_flags &= !up;
            }
        }
        self.observe(input);

        let absolute = input.flags & MouseInput::MOVE_ABSOLUTE != 0;
        match (delay != 0, absolute) {
            (true, true) => (input.last_x, input.last_y) = self.position(),
            (true, false) => (input.last_x, input.last_y) = (0, 0),
            (false, true) => self
                .position
                .store(pack(input.last_x, input.last_y), Ordering::Release),
            (false, false) => {
                let (dx, dy) = (input.last_x, input.last_y);
                let _ = self
                    .position
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                        let (x, y) = unpack(current);
                        Some(pack(x.wrapping_add(dx), y.wrapping_add(dy)))
                    });
            }
        }
    }

    /// Update the held set from a packet.
    pub fn observe(&self, input: &MouseInput) {
        let mut held = self.held.load(Ordering::Acquire);
        loop {
            let mut next = held;
            for (index, (down, up)) in BUTTONS.iter().enumerate() {
                if input.button_flags & down != 0 {
                    next |= 1 << index;
                }
                if input.button_flags & up != 0 {
                    next &= !(1 << index);
                }
            }
            match self
                .held
                .compare_exchange_weak(held, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => held = current,
            }
        }
    }
}
