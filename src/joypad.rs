/// Joypad line state behind the FF00 register.
///
/// Both nibbles are active-low: bit clear means pressed. The CPU selects
/// which key group the low nibble reflects by writing the select bits.
pub struct Joypad {
    /// Right/Left/Up/Down in bits 0..3, active low.
    pub direction_keys: u8,
    /// A/B/Select/Start in bits 0..3, active low.
    pub action_keys: u8,
    action_mode: bool,
}

/// Which of the eight joypad lines a host key maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoypadLine {
    Right,
    Left,
    Up,
    Down,
    A,
    B,
    Select,
    Start,
}

impl JoypadLine {
    /// (direction-group, bit) addressing into the two key masks.
    fn slot(self) -> (bool, u8) {
        match self {
            JoypadLine::Right => (true, 0),
            JoypadLine::Left => (true, 1),
            JoypadLine::Up => (true, 2),
            JoypadLine::Down => (true, 3),
            JoypadLine::A => (false, 0),
            JoypadLine::B => (false, 1),
            JoypadLine::Select => (false, 2),
            JoypadLine::Start => (false, 3),
        }
    }
}

/// Host keycode to joypad line mapping, built once at startup and passed to
/// the machine instead of living in process-wide state.
#[derive(Debug, Clone)]
pub struct KeyMap {
    pub right: u32,
    pub left: u32,
    pub up: u32,
    pub down: u32,
    pub a: u32,
    pub b: u32,
    pub select: u32,
    pub start: u32,
}

impl KeyMap {
    pub fn lookup(&self, code: u32) -> Option<JoypadLine> {
        match code {
            c if c == self.right => Some(JoypadLine::Right),
            c if c == self.left => Some(JoypadLine::Left),
            c if c == self.up => Some(JoypadLine::Up),
            c if c == self.down => Some(JoypadLine::Down),
            c if c == self.a => Some(JoypadLine::A),
            c if c == self.b => Some(JoypadLine::B),
            c if c == self.select => Some(JoypadLine::Select),
            c if c == self.start => Some(JoypadLine::Start),
            _ => None,
        }
    }
}

impl Default for KeyMap {
    /// Arrow keys + Z/X/Backspace/Return as USB HID usage codes.
    fn default() -> Self {
        Self {
            right: 79,
            left: 80,
            up: 82,
            down: 81,
            a: 29,
            b: 27,
            select: 42,
            start: 40,
        }
    }
}

impl Joypad {
    pub fn new() -> Self {
        Self {
            direction_keys: 0xEF,
            action_keys: 0xDF,
            action_mode: false,
        }
    }

    pub fn reset(&mut self) {
        self.direction_keys = 0xEF;
        self.action_keys = 0xDF;
    }

    pub fn read(&self) -> u8 {
        let pressed = !(self.action_keys & self.direction_keys) & 0x0F;
        if pressed == 0 {
            // No key held anywhere: both select bits read back high.
            return 0xCF;
        }
        if self.action_mode {
            self.action_keys
        } else {
            self.direction_keys
        }
    }

    pub fn write(&mut self, val: u8) {
        self.action_mode = val == 0x10;
    }

    /// Returns true if the press is a new edge (joypad interrupt condition).
    pub fn press(&mut self, line: JoypadLine) -> bool {
        let (direction, bit) = line.slot();
        let mask = if direction {
            &mut self.direction_keys
        } else {
            &mut self.action_keys
        };
        let was_up = *mask & (1 << bit) != 0;
        *mask &= !(1 << bit);
        was_up
    }

    pub fn release(&mut self, line: JoypadLine) {
        let (direction, bit) = line.slot();
        if direction {
            self.direction_keys |= 1 << bit;
        } else {
            self.action_keys |= 1 << bit;
        }
    }
}

impl Default for Joypad {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_register_reads_cf() {
        let pad = Joypad::new();
        assert_eq!(pad.read(), 0xCF);
    }

    #[test]
    fn select_bits_choose_key_group() {
        let mut pad = Joypad::new();
        assert!(pad.press(JoypadLine::Start));
        pad.write(0x10);
        assert_eq!(pad.read() & 0x0F, 0x07, "Start (bit 3) low in action mode");
        pad.write(0x20);
        assert_eq!(pad.read() & 0x0F, 0x0F, "direction nibble unaffected");
        pad.release(JoypadLine::Start);
        assert_eq!(pad.read(), 0xCF);
    }

    #[test]
    fn repeat_press_is_not_a_new_edge() {
        let mut pad = Joypad::new();
        assert!(pad.press(JoypadLine::A));
        assert!(!pad.press(JoypadLine::A));
    }
}
