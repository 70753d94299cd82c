use std::path::Path;

use log::{error, warn};

use crate::apu::Apu;
use crate::audio_ring::{PcmConsumer, pcm_ring};
use crate::breakpoint::{Breakpoint, BreakpointArgs};
use crate::bus::{Bus, IF, IF_JOYPAD};
use crate::cartridge::Cartridge;
use crate::cpu::{Cpu, EmuError};
use crate::joypad::KeyMap;
use crate::ppu::{DOTS_PER_FRAME, Ppu, SCREEN_HEIGHT, SCREEN_WIDTH};
use crate::timer::Timer;

/// Master-clock T-cycles consumed by one video frame.
pub const TICKS_PER_FRAME: u32 = DOTS_PER_FRAME;

const PCM_RING_CAPACITY: usize = 8192;

/// A copy of the completed framebuffer.
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// RGBA8888, row-major.
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Completed,
    /// A breakpoint matched after this many-th entry in the list; the frame
    /// is left mid-flight for the debugger to inspect and resume.
    Breakpoint(usize),
}

/// The assembled machine: owns every component and drives them in the fixed
/// CPU -> Timer -> PPU -> APU order each instruction.
pub struct GameBoy {
    pub cpu: Cpu,
    pub bus: Bus,
    pub ppu: Ppu,
    pub apu: Apu,
    pub timer: Timer,
    pub breakpoints: Vec<Breakpoint>,
    key_map: KeyMap,
    pcm: PcmConsumer,
    /// Executed-instruction counter (the `Clocks` breakpoint field).
    clocks: u64,
    /// Total T-cycles since power-on.
    master_clock: u64,
    /// Cycles consumed toward the current frame; the last instruction's
    /// overshoot carries into the next frame.
    frame_cycles: u32,
}

impl GameBoy {
    pub fn new(key_map: KeyMap) -> Self {
        let (producer, consumer) = pcm_ring(PCM_RING_CAPACITY);
        let mut gb = Self {
            cpu: Cpu::new(),
            bus: Bus::new(),
            ppu: Ppu::new(),
            apu: Apu::new(producer),
            timer: Timer::new(),
            breakpoints: Vec::new(),
            key_map,
            pcm: consumer,
            clocks: 0,
            master_clock: 0,
            frame_cycles: 0,
        };
        gb.reset();
        gb
    }

    /// Reinitialize every component to power-on state without reloading the
    /// ROM image.
    pub fn reset(&mut self) {
        self.bus.reset();
        self.cpu.reset(self.bus.use_cgb);
        self.ppu.use_cgb = self.bus.use_cgb;
        self.ppu.reset(&mut self.bus);
        self.timer.reset(&mut self.bus);
        self.apu.reset();
        self.clocks = 0;
        self.master_clock = 0;
        self.frame_cycles = 0;
    }

    /// Load a file of the given kind ("rom" is the only kind understood).
    /// Returns false on I/O or header validation failure.
    pub fn load_file<P: AsRef<Path>>(&mut self, kind: &str, path: P) -> bool {
        if kind != "rom" {
            return false;
        }
        match Cartridge::from_file(path) {
            Ok(cart) => {
                self.bus.load_cartridge(cart);
                self.reset();
                true
            }
            Err(e) => {
                error!("failed to load ROM: {e}");
                false
            }
        }
    }

    /// Advance exactly one video frame (70224 T-cycles). Not reentrant; a
    /// matched breakpoint suspends the frame mid-flight.
    pub fn run_frame(&mut self) -> Result<FrameStatus, EmuError> {
        self.ppu.ready_to_draw = false;
        while self.frame_cycles < TICKS_PER_FRAME {
            self.step()?;
            if !self.breakpoints.is_empty()
                && let Some(index) = self.breakpoint_hit()
            {
                return Ok(FrameStatus::Breakpoint(index));
            }
        }
        self.frame_cycles -= TICKS_PER_FRAME;
        Ok(FrameStatus::Completed)
    }

    /// Execute a single instruction step (debugger single-step surface).
    /// Returns the elapsed T-cycles.
    pub fn step_instruction(&mut self) -> Result<u32, EmuError> {
        self.step()
    }

    /// One orchestrator iteration. The Timer can wake a halted CPU inside
    /// the same tick, before the PPU and APU observe the cycle count.
    fn step(&mut self) -> Result<u32, EmuError> {
        let old_if = self.bus.read_io(IF);
        let clk = if self.cpu.skip_next {
            self.cpu.skip_next = false;
            0
        } else {
            let clk = self.cpu.update(&mut self.bus)?;
            self.clocks += 1;
            clk
        };
        if self.timer.update(&mut self.bus, clk, old_if) && self.cpu.halted {
            self.cpu.halted = false;
            self.cpu.skip_next = true;
        }
        self.bus.step_dma(clk);
        self.ppu.update(&mut self.bus, clk);
        self.apu.update(&mut self.bus, clk);
        self.frame_cycles += clk;
        self.master_clock += clk as u64;
        Ok(clk)
    }

    fn breakpoint_hit(&mut self) -> Option<usize> {
        let clocks = self.clocks;
        for i in 0..self.breakpoints.len() {
            if self.breakpoints[i].check(&self.cpu, &mut self.bus, clocks) {
                return Some(i);
            }
        }
        None
    }

    pub fn add_breakpoint(&mut self, args: BreakpointArgs) {
        let mut bp = Breakpoint::new(args);
        let name = bp.name().to_string();
        if self.breakpoints.iter_mut().any(|b| b.name() == name) {
            warn!("breakpoint \"{name}\" duplicates an existing one; keeping both");
        }
        self.breakpoints.push(bp);
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    /// Executed-instruction counter used by `Clocks=` breakpoints.
    pub fn clocks(&self) -> u64 {
        self.clocks
    }

    /// Total T-cycles since power-on.
    pub fn master_clock(&self) -> u64 {
        self.master_clock
    }

    /// Copy of the most recently completed frame, 160x144 RGBA8888.
    pub fn render_frame(&self) -> VideoFrame {
        VideoFrame {
            width: SCREEN_WIDTH as u32,
            height: SCREEN_HEIGHT as u32,
            pixels: self.ppu.frame().to_vec(),
        }
    }

    /// Drain the PCM ring.
    pub fn render_audio(&mut self) -> Vec<i16> {
        self.pcm.drain()
    }

    pub fn handle_key_down(&mut self, code: u32) {
        if let Some(line) = self.key_map.lookup(code)
            && self.bus.joypad.press(line)
        {
            self.bus.request_interrupt(IF_JOYPAD);
        }
    }

    pub fn handle_key_up(&mut self, code: u32) {
        if let Some(line) = self.key_map.lookup(code) {
            self.bus.joypad.release(line);
        }
    }

    /// Persist battery-backed cartridge RAM, if any.
    pub fn save_cart_ram(&mut self) {
        if let Some(cart) = &self.bus.cart
            && let Err(e) = cart.save_ram()
        {
            warn!("failed to save cartridge RAM: {e}");
        }
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new(KeyMap::default())
    }
}
