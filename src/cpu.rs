use thiserror::Error;

use crate::bus::{Bus, IF};

// CPU flag bits.
const FLAG_Z: u8 = 0x80; // Zero
const FLAG_N: u8 = 0x40; // Subtract
const FLAG_H: u8 = 0x20; // Half carry
const FLAG_C: u8 = 0x10; // Carry

// Interrupt vectors, in ascending bit priority order.
const INTERRUPT_VBLANK: u16 = 0x40;
const INTERRUPT_STAT: u16 = 0x48;
const INTERRUPT_TIMER: u16 = 0x50;
const INTERRUPT_SERIAL: u16 = 0x58;
const INTERRUPT_JOYPAD: u16 = 0x60;

/// Fixed cost of an interrupt dispatch in T-cycles.
const INTERRUPT_CYCLES: u32 = 20;

/// Errors that abort the running emulation session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmuError {
    /// Continuing past an undefined opcode would corrupt cycle accounting,
    /// so the run loop stops and surfaces the failing location instead.
    #[error("illegal opcode {opcode:#04X} at {pc:#06X}")]
    IllegalOpcode { opcode: u8, pc: u16 },
}

/// LR35902 core: fetch-decode-execute returning each instruction's T-cycle
/// cost for the orchestrator to distribute to the other components.
pub struct Cpu {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub pc: u16,
    pub sp: u16,
    pub ime: bool,
    /// EI takes effect after the following instruction.
    ime_pending: bool,
    pub halted: bool,
    /// One-shot flag: the orchestrator skips the next CPU step after a timer
    /// wake so the resumed instruction starts on a clean cycle boundary.
    pub skip_next: bool,
}

impl Cpu {
    pub fn new() -> Self {
        let mut cpu = Self {
            a: 0,
            f: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            pc: 0,
            sp: 0,
            ime: false,
            ime_pending: false,
            halted: false,
            skip_next: false,
        };
        cpu.reset(false);
        cpu
    }

    /// Post-boot register state for the selected hardware mode.
    pub fn reset(&mut self, cgb: bool) {
        if cgb {
            self.a = 0x11;
            self.f = 0x80;
            self.b = 0x00;
            self.c = 0x00;
            self.d = 0x00;
            self.e = 0x08;
            self.h = 0x00;
            self.l = 0x7C;
        } else {
            self.a = 0x01;
            self.f = 0xB0;
            self.b = 0x00;
            self.c = 0x13;
            self.d = 0x00;
            self.e = 0xD8;
            self.h = 0x01;
            self.l = 0x4D;
        }
        self.pc = 0x0100;
        self.sp = 0xFFFE;
        self.ime = false;
        self.ime_pending = false;
        self.halted = false;
        self.skip_next = false;
    }

    fn get_bc(&self) -> u16 {
        ((self.b as u16) << 8) | self.c as u16
    }

    fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = val as u8;
    }

    fn get_de(&self) -> u16 {
        ((self.d as u16) << 8) | self.e as u16
    }

    fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = val as u8;
    }

    pub fn get_hl(&self) -> u16 {
        ((self.h as u16) << 8) | self.l as u16
    }

    fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = val as u8;
    }

    #[inline]
    fn fetch8(&mut self, bus: &mut Bus) -> u8 {
        let val = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        val
    }

    #[inline]
    fn fetch16(&mut self, bus: &mut Bus) -> u16 {
        let lo = self.fetch8(bus) as u16;
        let hi = self.fetch8(bus) as u16;
        (hi << 8) | lo
    }

    fn push16(&mut self, bus: &mut Bus, val: u16) {
        self.sp = self.sp.wrapping_sub(1);
        bus.write(self.sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        bus.write(self.sp, val as u8);
    }

    fn pop16(&mut self, bus: &mut Bus) -> u16 {
        let lo = bus.read(self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        let hi = bus.read(self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        (hi << 8) | lo
    }

    /// Register by decode index; 6 is the (HL) memory cell.
    fn read_r8(&mut self, bus: &mut Bus, idx: u8) -> u8 {
        match idx {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => bus.read(self.get_hl()),
            _ => self.a,
        }
    }

    fn write_r8(&mut self, bus: &mut Bus, idx: u8, val: u8) {
        match idx {
            0 => self.b = val,
            1 => self.c = val,
            2 => self.d = val,
            3 => self.e = val,
            4 => self.h = val,
            5 => self.l = val,
            6 => bus.write(self.get_hl(), val),
            _ => self.a = val,
        }
    }

    // 8-bit ALU helpers. Each sets F completely.

    fn add_a(&mut self, val: u8, carry_in: bool) {
        let carry = (carry_in && self.f & FLAG_C != 0) as u8;
        let (res1, c1) = self.a.overflowing_add(val);
        let (res, c2) = res1.overflowing_add(carry);
        self.f = if res == 0 { FLAG_Z } else { 0 }
            | if (self.a & 0x0F) + (val & 0x0F) + carry > 0x0F {
                FLAG_H
            } else {
                0
            }
            | if c1 || c2 { FLAG_C } else { 0 };
        self.a = res;
    }

    fn sub_a(&mut self, val: u8, carry_in: bool, store: bool) {
        let carry = (carry_in && self.f & FLAG_C != 0) as u8;
        let (res1, b1) = self.a.overflowing_sub(val);
        let (res, b2) = res1.overflowing_sub(carry);
        self.f = FLAG_N
            | if res == 0 { FLAG_Z } else { 0 }
            | if (self.a & 0x0F) < (val & 0x0F) + carry {
                FLAG_H
            } else {
                0
            }
            | if b1 || b2 { FLAG_C } else { 0 };
        if store {
            self.a = res;
        }
    }

    fn and_a(&mut self, val: u8) {
        self.a &= val;
        self.f = if self.a == 0 { FLAG_Z } else { 0 } | FLAG_H;
    }

    fn xor_a(&mut self, val: u8) {
        self.a ^= val;
        self.f = if self.a == 0 { FLAG_Z } else { 0 };
    }

    fn or_a(&mut self, val: u8) {
        self.a |= val;
        self.f = if self.a == 0 { FLAG_Z } else { 0 };
    }

    fn inc8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_add(1);
        self.f = (self.f & FLAG_C)
            | if res == 0 { FLAG_Z } else { 0 }
            | if (val & 0x0F) + 1 > 0x0F { FLAG_H } else { 0 };
        res
    }

    fn dec8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_sub(1);
        self.f = (self.f & FLAG_C)
            | FLAG_N
            | if res == 0 { FLAG_Z } else { 0 }
            | if val & 0x0F == 0 { FLAG_H } else { 0 };
        res
    }

    fn add_hl(&mut self, val: u16) {
        let hl = self.get_hl();
        let res = hl.wrapping_add(val);
        self.f = (self.f & FLAG_Z)
            | if ((hl & 0x0FFF) + (val & 0x0FFF)) & 0x1000 != 0 {
                FLAG_H
            } else {
                0
            }
            | if (hl as u32) + (val as u32) > 0xFFFF {
                FLAG_C
            } else {
                0
            };
        self.set_hl(res);
    }

    /// SP + signed immediate, shared by ADD SP,r8 and LD HL,SP+r8.
    fn sp_plus_offset(&mut self, offset: u8) -> u16 {
        let val = offset as i8 as i16 as u16;
        let sp = self.sp;
        self.f = if (sp & 0x0F) + (val & 0x0F) > 0x0F {
            FLAG_H
        } else {
            0
        } | if (sp & 0xFF) + (val & 0xFF) > 0xFF {
            FLAG_C
        } else {
            0
        };
        sp.wrapping_add(val)
    }

    fn jr(&mut self, offset: u8) {
        self.pc = self.pc.wrapping_add(offset as i8 as u16);
    }

    fn condition(&self, idx: u8) -> bool {
        match idx {
            0 => self.f & FLAG_Z == 0,
            1 => self.f & FLAG_Z != 0,
            2 => self.f & FLAG_C == 0,
            _ => self.f & FLAG_C != 0,
        }
    }

    /// Service a pending enabled interrupt, if any. Returns the dispatch
    /// cost; also the point where a pending interrupt breaks HALT even with
    /// IME clear.
    fn service_interrupts(&mut self, bus: &mut Bus) -> Option<u32> {
        let if_val = bus.read_io(IF);
        let pending = if_val & bus.ie() & 0x1F;
        if pending == 0 {
            return None;
        }
        if !self.ime {
            self.halted = false;
            return None;
        }

        // Lowest set bit wins: VBlank > STAT > Timer > Serial > Joypad.
        let bit = pending & pending.wrapping_neg();
        let vector = match bit {
            0x01 => INTERRUPT_VBLANK,
            0x02 => INTERRUPT_STAT,
            0x04 => INTERRUPT_TIMER,
            0x08 => INTERRUPT_SERIAL,
            _ => INTERRUPT_JOYPAD,
        };
        self.halted = false;
        self.ime = false;
        self.ime_pending = false;
        bus.write_io(IF, if_val & !bit);
        self.push16(bus, self.pc);
        self.pc = vector;
        Some(INTERRUPT_CYCLES)
    }

    /// Execute one instruction (or service an interrupt, or idle in HALT)
    /// and return the elapsed T-cycles.
    pub fn update(&mut self, bus: &mut Bus) -> Result<u32, EmuError> {
        if let Some(cycles) = self.service_interrupts(bus) {
            return Ok(cycles);
        }
        if self.halted {
            return Ok(4);
        }

        let enable_ime = self.ime_pending;
        let pc = self.pc;
        let opcode = self.fetch8(bus);
        let cycles = self
            .execute(bus, opcode)
            .ok_or(EmuError::IllegalOpcode { opcode, pc })?;

        if enable_ime && self.ime_pending {
            self.ime = true;
            self.ime_pending = false;
        }
        Ok(cycles)
    }

    fn execute(&mut self, bus: &mut Bus, opcode: u8) -> Option<u32> {
        let cycles = match opcode {
            0x00 => 4,
            0x01 => {
                let val = self.fetch16(bus);
                self.set_bc(val);
                12
            }
            0x02 => {
                bus.write(self.get_bc(), self.a);
                8
            }
            0x03 => {
                let val = self.get_bc().wrapping_add(1);
                self.set_bc(val);
                8
            }
            0x04 => {
                self.b = self.inc8(self.b);
                4
            }
            0x05 => {
                self.b = self.dec8(self.b);
                4
            }
            0x06 => {
                self.b = self.fetch8(bus);
                8
            }
            0x07 => {
                let carry = self.a & 0x80 != 0;
                self.a = self.a.rotate_left(1);
                self.f = if carry { FLAG_C } else { 0 };
                4
            }
            0x08 => {
                let addr = self.fetch16(bus);
                bus.write(addr, self.sp as u8);
                bus.write(addr.wrapping_add(1), (self.sp >> 8) as u8);
                20
            }
            0x09 => {
                self.add_hl(self.get_bc());
                8
            }
            0x0A => {
                self.a = bus.read(self.get_bc());
                8
            }
            0x0B => {
                let val = self.get_bc().wrapping_sub(1);
                self.set_bc(val);
                8
            }
            0x0C => {
                self.c = self.inc8(self.c);
                4
            }
            0x0D => {
                self.c = self.dec8(self.c);
                4
            }
            0x0E => {
                self.c = self.fetch8(bus);
                8
            }
            0x0F => {
                let carry = self.a & 0x01 != 0;
                self.a = self.a.rotate_right(1);
                self.f = if carry { FLAG_C } else { 0 };
                4
            }
            0x10 => {
                // STOP: the operand byte is consumed; the divider resets.
                let _ = self.fetch8(bus);
                bus.div_reset = true;
                4
            }
            0x11 => {
                let val = self.fetch16(bus);
                self.set_de(val);
                12
            }
            0x12 => {
                bus.write(self.get_de(), self.a);
                8
            }
            0x13 => {
                let val = self.get_de().wrapping_add(1);
                self.set_de(val);
                8
            }
            0x14 => {
                self.d = self.inc8(self.d);
                4
            }
            0x15 => {
                self.d = self.dec8(self.d);
                4
            }
            0x16 => {
                self.d = self.fetch8(bus);
                8
            }
            0x17 => {
                let carry = self.a & 0x80 != 0;
                self.a = (self.a << 1) | ((self.f & FLAG_C != 0) as u8);
                self.f = if carry { FLAG_C } else { 0 };
                4
            }
            0x18 => {
                let offset = self.fetch8(bus);
                self.jr(offset);
                12
            }
            0x19 => {
                self.add_hl(self.get_de());
                8
            }
            0x1A => {
                self.a = bus.read(self.get_de());
                8
            }
            0x1B => {
                let val = self.get_de().wrapping_sub(1);
                self.set_de(val);
                8
            }
            0x1C => {
                self.e = self.inc8(self.e);
                4
            }
            0x1D => {
                self.e = self.dec8(self.e);
                4
            }
            0x1E => {
                self.e = self.fetch8(bus);
                8
            }
            0x1F => {
                let carry = self.a & 0x01 != 0;
                self.a = (self.a >> 1) | (((self.f & FLAG_C != 0) as u8) << 7);
                self.f = if carry { FLAG_C } else { 0 };
                4
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch8(bus);
                if self.condition((opcode >> 3) & 0x03) {
                    self.jr(offset);
                    12
                } else {
                    8
                }
            }
            0x21 => {
                let val = self.fetch16(bus);
                self.set_hl(val);
                12
            }
            0x22 => {
                let addr = self.get_hl();
                bus.write(addr, self.a);
                self.set_hl(addr.wrapping_add(1));
                8
            }
            0x23 => {
                let val = self.get_hl().wrapping_add(1);
                self.set_hl(val);
                8
            }
            0x24 => {
                self.h = self.inc8(self.h);
                4
            }
            0x25 => {
                self.h = self.dec8(self.h);
                4
            }
            0x26 => {
                self.h = self.fetch8(bus);
                8
            }
            0x27 => {
                // DAA: decimal-adjust after an 8-bit add/subtract.
                let mut correction = 0u8;
                let mut carry = false;
                if self.f & FLAG_H != 0 || (self.f & FLAG_N == 0 && self.a & 0x0F > 9) {
                    correction |= 0x06;
                }
                if self.f & FLAG_C != 0 || (self.f & FLAG_N == 0 && self.a > 0x99) {
                    correction |= 0x60;
                    carry = true;
                }
                if self.f & FLAG_N == 0 {
                    self.a = self.a.wrapping_add(correction);
                } else {
                    self.a = self.a.wrapping_sub(correction);
                }
                self.f = (self.f & FLAG_N)
                    | if self.a == 0 { FLAG_Z } else { 0 }
                    | if carry { FLAG_C } else { 0 };
                4
            }
            0x29 => {
                self.add_hl(self.get_hl());
                8
            }
            0x2A => {
                let addr = self.get_hl();
                self.a = bus.read(addr);
                self.set_hl(addr.wrapping_add(1));
                8
            }
            0x2B => {
                let val = self.get_hl().wrapping_sub(1);
                self.set_hl(val);
                8
            }
            0x2C => {
                self.l = self.inc8(self.l);
                4
            }
            0x2D => {
                self.l = self.dec8(self.l);
                4
            }
            0x2E => {
                self.l = self.fetch8(bus);
                8
            }
            0x2F => {
                self.a = !self.a;
                self.f = (self.f & (FLAG_Z | FLAG_C)) | FLAG_N | FLAG_H;
                4
            }
            0x31 => {
                self.sp = self.fetch16(bus);
                12
            }
            0x32 => {
                let addr = self.get_hl();
                bus.write(addr, self.a);
                self.set_hl(addr.wrapping_sub(1));
                8
            }
            0x33 => {
                self.sp = self.sp.wrapping_add(1);
                8
            }
            0x34 => {
                let addr = self.get_hl();
                let val = bus.read(addr);
                let res = self.inc8(val);
                bus.write(addr, res);
                12
            }
            0x35 => {
                let addr = self.get_hl();
                let val = bus.read(addr);
                let res = self.dec8(val);
                bus.write(addr, res);
                12
            }
            0x36 => {
                let val = self.fetch8(bus);
                bus.write(self.get_hl(), val);
                12
            }
            0x37 => {
                self.f = (self.f & FLAG_Z) | FLAG_C;
                4
            }
            0x39 => {
                self.add_hl(self.sp);
                8
            }
            0x3A => {
                let addr = self.get_hl();
                self.a = bus.read(addr);
                self.set_hl(addr.wrapping_sub(1));
                8
            }
            0x3B => {
                self.sp = self.sp.wrapping_sub(1);
                8
            }
            0x3C => {
                self.a = self.inc8(self.a);
                4
            }
            0x3D => {
                self.a = self.dec8(self.a);
                4
            }
            0x3E => {
                self.a = self.fetch8(bus);
                8
            }
            0x3F => {
                self.f = (self.f & FLAG_Z) | ((self.f & FLAG_C) ^ FLAG_C);
                4
            }
            0x76 => {
                // HALT. With IME clear and an interrupt already pending the
                // halt state is simply not entered.
                let pending = bus.read_io(IF) & bus.ie() & 0x1F;
                if self.ime || pending == 0 {
                    self.halted = true;
                }
                4
            }
            0x40..=0x7F => {
                let src = opcode & 0x07;
                let dst = (opcode >> 3) & 0x07;
                let val = self.read_r8(bus, src);
                self.write_r8(bus, dst, val);
                if src == 6 || dst == 6 { 8 } else { 4 }
            }
            0x80..=0xBF => {
                let src = opcode & 0x07;
                let val = self.read_r8(bus, src);
                match (opcode >> 3) & 0x07 {
                    0 => self.add_a(val, false),
                    1 => self.add_a(val, true),
                    2 => self.sub_a(val, false, true),
                    3 => self.sub_a(val, true, true),
                    4 => self.and_a(val),
                    5 => self.xor_a(val),
                    6 => self.or_a(val),
                    _ => self.sub_a(val, false, false), // CP
                }
                if src == 6 { 8 } else { 4 }
            }
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                if self.condition((opcode >> 3) & 0x03) {
                    self.pc = self.pop16(bus);
                    20
                } else {
                    8
                }
            }
            0xC1 => {
                let val = self.pop16(bus);
                self.set_bc(val);
                12
            }
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let addr = self.fetch16(bus);
                if self.condition((opcode >> 3) & 0x03) {
                    self.pc = addr;
                    16
                } else {
                    12
                }
            }
            0xC3 => {
                self.pc = self.fetch16(bus);
                16
            }
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let addr = self.fetch16(bus);
                if self.condition((opcode >> 3) & 0x03) {
                    self.push16(bus, self.pc);
                    self.pc = addr;
                    24
                } else {
                    12
                }
            }
            0xC5 => {
                let val = self.get_bc();
                self.push16(bus, val);
                16
            }
            0xC6 => {
                let val = self.fetch8(bus);
                self.add_a(val, false);
                8
            }
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                self.push16(bus, self.pc);
                self.pc = (opcode & 0x38) as u16;
                16
            }
            0xC9 => {
                self.pc = self.pop16(bus);
                16
            }
            0xCB => {
                let op = self.fetch8(bus);
                self.execute_cb(bus, op)
            }
            0xCD => {
                let addr = self.fetch16(bus);
                self.push16(bus, self.pc);
                self.pc = addr;
                24
            }
            0xCE => {
                let val = self.fetch8(bus);
                self.add_a(val, true);
                8
            }
            0xD1 => {
                let val = self.pop16(bus);
                self.set_de(val);
                12
            }
            0xD5 => {
                let val = self.get_de();
                self.push16(bus, val);
                16
            }
            0xD6 => {
                let val = self.fetch8(bus);
                self.sub_a(val, false, true);
                8
            }
            0xD9 => {
                // RETI enables interrupts without the EI delay.
                self.pc = self.pop16(bus);
                self.ime = true;
                16
            }
            0xDE => {
                let val = self.fetch8(bus);
                self.sub_a(val, true, true);
                8
            }
            0xE0 => {
                let offset = self.fetch8(bus);
                bus.write(0xFF00 | offset as u16, self.a);
                12
            }
            0xE1 => {
                let val = self.pop16(bus);
                self.set_hl(val);
                12
            }
            0xE2 => {
                bus.write(0xFF00 | self.c as u16, self.a);
                8
            }
            0xE5 => {
                let val = self.get_hl();
                self.push16(bus, val);
                16
            }
            0xE6 => {
                let val = self.fetch8(bus);
                self.and_a(val);
                8
            }
            0xE8 => {
                let offset = self.fetch8(bus);
                self.sp = self.sp_plus_offset(offset);
                16
            }
            0xE9 => {
                self.pc = self.get_hl();
                4
            }
            0xEA => {
                let addr = self.fetch16(bus);
                bus.write(addr, self.a);
                16
            }
            0xEE => {
                let val = self.fetch8(bus);
                self.xor_a(val);
                8
            }
            0xF0 => {
                let offset = self.fetch8(bus);
                self.a = bus.read(0xFF00 | offset as u16);
                12
            }
            0xF1 => {
                let val = self.pop16(bus);
                self.a = (val >> 8) as u8;
                self.f = val as u8 & 0xF0;
                12
            }
            0xF2 => {
                self.a = bus.read(0xFF00 | self.c as u16);
                8
            }
            0xF3 => {
                self.ime = false;
                self.ime_pending = false;
                4
            }
            0xF5 => {
                let val = ((self.a as u16) << 8) | (self.f & 0xF0) as u16;
                self.push16(bus, val);
                16
            }
            0xF6 => {
                let val = self.fetch8(bus);
                self.or_a(val);
                8
            }
            0xF8 => {
                let offset = self.fetch8(bus);
                let res = self.sp_plus_offset(offset);
                self.set_hl(res);
                12
            }
            0xF9 => {
                self.sp = self.get_hl();
                8
            }
            0xFA => {
                let addr = self.fetch16(bus);
                self.a = bus.read(addr);
                16
            }
            0xFB => {
                self.ime_pending = true;
                4
            }
            0xFE => {
                let val = self.fetch8(bus);
                self.sub_a(val, false, false);
                8
            }
            0xD3 | 0xDB | 0xDD | 0xE3 | 0xE4 | 0xEB | 0xEC | 0xED | 0xF4 | 0xFC | 0xFD => {
                return None;
            }
        };
        Some(cycles)
    }

    fn execute_cb(&mut self, bus: &mut Bus, opcode: u8) -> u32 {
        let r = opcode & 0x07;
        match opcode {
            0x00..=0x07 => {
                let val = self.read_r8(bus, r);
                let res = val.rotate_left(1);
                self.write_r8(bus, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x80 != 0 { FLAG_C } else { 0 };
            }
            0x08..=0x0F => {
                let val = self.read_r8(bus, r);
                let res = val.rotate_right(1);
                self.write_r8(bus, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
            }
            0x10..=0x17 => {
                let val = self.read_r8(bus, r);
                let res = (val << 1) | ((self.f & FLAG_C != 0) as u8);
                self.write_r8(bus, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x80 != 0 { FLAG_C } else { 0 };
            }
            0x18..=0x1F => {
                let val = self.read_r8(bus, r);
                let res = (val >> 1) | (((self.f & FLAG_C != 0) as u8) << 7);
                self.write_r8(bus, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
            }
            0x20..=0x27 => {
                let val = self.read_r8(bus, r);
                let res = val << 1;
                self.write_r8(bus, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x80 != 0 { FLAG_C } else { 0 };
            }
            0x28..=0x2F => {
                let val = self.read_r8(bus, r);
                let res = (val >> 1) | (val & 0x80);
                self.write_r8(bus, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
            }
            0x30..=0x37 => {
                let val = self.read_r8(bus, r);
                let res = val.rotate_left(4);
                self.write_r8(bus, r, res);
                self.f = if res == 0 { FLAG_Z } else { 0 };
            }
            0x38..=0x3F => {
                let val = self.read_r8(bus, r);
                let res = val >> 1;
                self.write_r8(bus, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
            }
            0x40..=0x7F => {
                let bit = (opcode - 0x40) >> 3;
                let val = self.read_r8(bus, r);
                self.f = (self.f & FLAG_C)
                    | FLAG_H
                    | if val & (1 << bit) == 0 { FLAG_Z } else { 0 };
                // BIT only reads; its (HL) form is shorter than the others.
                return if r == 6 { 12 } else { 8 };
            }
            0x80..=0xBF => {
                let bit = (opcode - 0x80) >> 3;
                let val = self.read_r8(bus, r) & !(1 << bit);
                self.write_r8(bus, r, val);
            }
            0xC0..=0xFF => {
                let bit = (opcode - 0xC0) >> 3;
                let val = self.read_r8(bus, r) | (1 << bit);
                self.write_r8(bus, r, val);
            }
        }
        if r == 6 { 16 } else { 8 }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::IE;

    /// CPU executing a small program out of WRAM.
    fn harness(program: &[u8]) -> (Cpu, Bus) {
        let mut bus = Bus::new();
        let mut cpu = Cpu::new();
        for (i, &byte) in program.iter().enumerate() {
            bus.write(0xC000 + i as u16, byte);
        }
        cpu.pc = 0xC000;
        (cpu, bus)
    }

    #[test]
    fn immediate_load_and_add_set_flags_and_cycles() {
        let (mut cpu, mut bus) = harness(&[0x3E, 0x0F, 0xC6, 0x01]); // LD A,0x0F; ADD A,0x01
        assert_eq!(cpu.update(&mut bus).unwrap(), 8);
        assert_eq!(cpu.a, 0x0F);
        assert_eq!(cpu.update(&mut bus).unwrap(), 8);
        assert_eq!(cpu.a, 0x10);
        assert_eq!(cpu.f & FLAG_H, FLAG_H, "half carry out of bit 3");
        assert_eq!(cpu.f & FLAG_Z, 0);
    }

    #[test]
    fn taken_and_untaken_branches_cost_differently() {
        // JR NZ,+2 with Z clear (taken), then from the target JR NZ with Z set.
        let (mut cpu, mut bus) = harness(&[0x20, 0x02, 0x00, 0x00, 0x20, 0x10]);
        cpu.f = 0;
        assert_eq!(cpu.update(&mut bus).unwrap(), 12);
        assert_eq!(cpu.pc, 0xC004);
        cpu.f = FLAG_Z;
        assert_eq!(cpu.update(&mut bus).unwrap(), 8);
        assert_eq!(cpu.pc, 0xC006);
    }

    #[test]
    fn push_pop_roundtrip() {
        let (mut cpu, mut bus) = harness(&[0xC5, 0xD1]); // PUSH BC; POP DE
        cpu.sp = 0xDFFE;
        cpu.b = 0x12;
        cpu.c = 0x34;
        assert_eq!(cpu.update(&mut bus).unwrap(), 16);
        assert_eq!(cpu.update(&mut bus).unwrap(), 12);
        assert_eq!(cpu.d, 0x12);
        assert_eq!(cpu.e, 0x34);
        assert_eq!(cpu.sp, 0xDFFE);
    }

    #[test]
    fn hl_indirect_ops_hit_memory() {
        let (mut cpu, mut bus) = harness(&[0x36, 0x41, 0x34]); // LD (HL),0x41; INC (HL)
        cpu.set_hl(0xC100);
        assert_eq!(cpu.update(&mut bus).unwrap(), 12);
        assert_eq!(cpu.update(&mut bus).unwrap(), 12);
        assert_eq!(bus.read(0xC100), 0x42);
    }

    #[test]
    fn interrupt_dispatch_jumps_to_vector_and_costs_twenty() {
        let (mut cpu, mut bus) = harness(&[0x00]);
        cpu.sp = 0xDFFE;
        cpu.ime = true;
        bus.write(IE, 0x04);
        bus.request_interrupt(0x04);

        let cycles = cpu.update(&mut bus).unwrap();
        assert_eq!(cycles, 20);
        assert_eq!(cpu.pc, 0x0050);
        assert!(!cpu.ime);
        assert_eq!(bus.read_io(IF) & 0x04, 0, "serviced bit cleared");
        assert_eq!(bus.read16(0xDFFC), 0xC000, "return address pushed");
    }

    #[test]
    fn vblank_outranks_timer() {
        let (mut cpu, mut bus) = harness(&[0x00]);
        cpu.sp = 0xDFFE;
        cpu.ime = true;
        bus.write(IE, 0x05);
        bus.request_interrupt(0x05);
        cpu.update(&mut bus).unwrap();
        assert_eq!(cpu.pc, 0x0040);
        assert_eq!(bus.read_io(IF) & 0x01, 0);
        assert_ne!(bus.read_io(IF) & 0x04, 0, "timer stays pending");
    }

    #[test]
    fn ei_takes_effect_after_the_next_instruction() {
        let (mut cpu, mut bus) = harness(&[0xFB, 0x00, 0x00]); // EI; NOP; NOP
        cpu.sp = 0xDFFE;
        bus.write(IE, 0x01);
        bus.request_interrupt(0x01);

        cpu.update(&mut bus).unwrap(); // EI
        assert!(!cpu.ime);
        cpu.update(&mut bus).unwrap(); // NOP; IME becomes set afterwards
        assert!(cpu.ime);
        let cycles = cpu.update(&mut bus).unwrap();
        assert_eq!(cycles, 20);
        assert_eq!(cpu.pc, 0x0040);
    }

    #[test]
    fn halt_idles_until_interrupt_breaks_it() {
        let (mut cpu, mut bus) = harness(&[0x76, 0x00]); // HALT; NOP
        cpu.update(&mut bus).unwrap();
        assert!(cpu.halted);
        assert_eq!(cpu.update(&mut bus).unwrap(), 4, "idle while halted");
        assert!(cpu.halted);

        // Pending-but-disabled interrupt clears halt without dispatching.
        bus.write(IE, 0x04);
        bus.request_interrupt(0x04);
        cpu.update(&mut bus).unwrap();
        assert!(!cpu.halted);
        assert_eq!(cpu.pc, 0xC002, "fell through to the NOP");
    }

    #[test]
    fn halt_with_pending_interrupt_and_ime_clear_is_not_entered() {
        let (mut cpu, mut bus) = harness(&[0x76, 0x00]);
        bus.write(IE, 0x04);
        bus.request_interrupt(0x04);
        // service_interrupts with IME clear consumes nothing but also means
        // the halt state must not latch.
        cpu.update(&mut bus).unwrap();
        assert!(!cpu.halted);
    }

    #[test]
    fn illegal_opcode_is_fatal_with_location() {
        let (mut cpu, mut bus) = harness(&[0xD3]);
        assert_eq!(
            cpu.update(&mut bus),
            Err(EmuError::IllegalOpcode {
                opcode: 0xD3,
                pc: 0xC000
            })
        );
    }

    #[test]
    fn daa_adjusts_bcd_addition() {
        // 0x15 + 0x27 = 0x3C, DAA -> 0x42.
        let (mut cpu, mut bus) = harness(&[0x3E, 0x15, 0xC6, 0x27, 0x27]);
        cpu.update(&mut bus).unwrap();
        cpu.update(&mut bus).unwrap();
        cpu.update(&mut bus).unwrap();
        assert_eq!(cpu.a, 0x42);
    }

    #[test]
    fn cb_bit_and_set_behave() {
        let (mut cpu, mut bus) = harness(&[0xCB, 0x7F, 0xCB, 0xFF, 0xCB, 0x7F]); // BIT 7,A; SET 7,A; BIT 7,A
        cpu.a = 0x00;
        assert_eq!(cpu.update(&mut bus).unwrap(), 8);
        assert_eq!(cpu.f & FLAG_Z, FLAG_Z);
        cpu.update(&mut bus).unwrap();
        assert_eq!(cpu.a, 0x80);
        cpu.update(&mut bus).unwrap();
        assert_eq!(cpu.f & FLAG_Z, 0);
    }

    #[test]
    fn rst_pushes_and_jumps_to_fixed_vector() {
        let (mut cpu, mut bus) = harness(&[0xEF]); // RST 28h
        cpu.sp = 0xDFFE;
        assert_eq!(cpu.update(&mut bus).unwrap(), 16);
        assert_eq!(cpu.pc, 0x0028);
        assert_eq!(bus.read16(0xDFFC), 0xC001);
    }
}
