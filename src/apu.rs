use log::warn;

use crate::audio_ring::PcmProducer;
use crate::bus::Bus;

#[cfg(feature = "apu-trace")]
macro_rules! apu_trace {
    ($($arg:tt)*) => {
        println!($($arg)*);
    };
}
#[cfg(not(feature = "apu-trace"))]
macro_rules! apu_trace {
    ($($arg:tt)*) => {};
}

const CPU_CLOCK_HZ: u32 = 4_194_304;
pub const SAMPLE_RATE: u32 = 48_000;
const CYCLES_PER_SAMPLE: u32 = CPU_CLOCK_HZ / SAMPLE_RATE;
const AMPLITUDE: f32 = 8000.0;

/// Duty waveforms for the square channels, one bit per step. Index is the
/// NRx1 duty selector: 12.5% / 25% / 50% / 75%.
const DUTY_PATTERNS: [u8; 4] = [0b0000_0001, 0b1000_0001, 0b1000_0111, 0b0111_1110];

/// Per-channel generator state, shared between the Bus (register writes),
/// the Timer (frame sequencer clocks) and the APU (waveform stepping).
///
/// Channels 0-1 are the square channels (0 carries the sweep unit), 2 is the
/// wave channel (state only, not mixed), 3 is the noise channel.
pub struct ApuChannel {
    pub frequency: u16,
    pub shadow_frequency: u16,
    pub frequency_timer: i32,
    pub duty_pattern: u8,
    pub duty_position: u8,

    /// Current envelope volume, always within [0, 15].
    pub envelope_volume: u8,
    pub envelope_period: u8,
    pub envelope_increase: bool,
    pub envelope_timer: u8,

    pub sweep_period: u8,
    pub sweep_shift: u8,
    pub sweep_increase: bool,
    pub sweep_timer: u8,
    pub sweep_enabled: bool,
    pub has_sweep: bool,
    /// Latched on sweep overflow; the owner clears the NR52 status bit.
    pub disable_flag: bool,
    new_frequency: u16,

    pub length_timer: u16,
    pub length_init: u16,
    /// NRx4 bit 6: length counter decrements while set.
    pub length_enabled: bool,

    /// NR52 status bit mirror: set on trigger with the DAC on, cleared by
    /// length expiry, sweep overflow or DAC disable.
    pub active: bool,
    pub frame_step: u8,
    pub dac_enabled: bool,

    // Channel 4 noise generator.
    pub lfsr: u16,
    pub divisor: u16,
    pub divisor_shift: u8,
    pub width_mode: bool,

    // NR50/NR51 routing.
    pub left_enabled: bool,
    pub right_enabled: bool,
    pub left_volume: u8,
    pub right_volume: u8,
}

impl ApuChannel {
    pub fn new() -> Self {
        Self {
            frequency: 0,
            shadow_frequency: 0,
            frequency_timer: 0,
            duty_pattern: 0,
            duty_position: 0,
            envelope_volume: 0,
            envelope_period: 0,
            envelope_increase: false,
            envelope_timer: 0,
            sweep_period: 0,
            sweep_shift: 0,
            sweep_increase: true,
            sweep_timer: 0,
            sweep_enabled: false,
            has_sweep: false,
            disable_flag: false,
            new_frequency: 0,
            length_timer: 0,
            length_init: 64,
            length_enabled: false,
            active: false,
            frame_step: 0,
            dac_enabled: false,
            lfsr: 0xFFFF,
            divisor: 8,
            divisor_shift: 0,
            width_mode: false,
            left_enabled: false,
            right_enabled: false,
            left_volume: 0,
            right_volume: 0,
        }
    }

    /// Advance the square-wave generator by `cycles` T-cycles.
    pub fn step_wave(&mut self, cycles: u32) {
        self.frequency_timer -= cycles as i32;
        while self.frequency_timer <= 0 {
            self.frequency_timer += (2048 - self.frequency as i32) * 4;
            self.duty_position = (self.duty_position + 1) & 0x07;
        }
    }

    /// Advance the LFSR noise generator by `cycles` T-cycles.
    pub fn step_noise(&mut self, cycles: u32) {
        self.frequency_timer -= cycles as i32;
        while self.frequency_timer <= 0 {
            self.frequency_timer += ((self.divisor as i32) << self.divisor_shift).max(1);
            let feedback = (self.lfsr & 0x01) ^ ((self.lfsr >> 1) & 0x01);
            self.lfsr = ((self.lfsr >> 1) & !(1 << 14)) | (feedback << 14);
            if self.width_mode {
                self.lfsr = (self.lfsr & !(1 << 6)) | (feedback << 6);
            }
        }
    }

    /// One 512 Hz frame sequencer step: length on even steps, sweep on steps
    /// 2 and 6, envelope on step 7.
    pub fn step_frame_sequencer(&mut self) {
        self.frame_step = (self.frame_step + 1) & 0x07;
        if self.frame_step % 2 == 0 {
            self.clock_length();
            if (self.frame_step == 2 || self.frame_step == 6) && self.has_sweep {
                self.clock_sweep();
            }
        } else if self.frame_step == 7 {
            self.clock_envelope();
        }
    }

    pub fn clock_length(&mut self) {
        if self.length_timer > 0 && self.length_enabled {
            self.length_timer -= 1;
        }
    }

    pub fn clock_envelope(&mut self) {
        if self.envelope_period == 0 {
            return;
        }
        if self.envelope_timer > 0 {
            self.envelope_timer -= 1;
            if self.envelope_timer == 0 {
                self.envelope_timer = self.envelope_period;
                if self.envelope_increase && self.envelope_volume < 0x0F {
                    self.envelope_volume += 1;
                } else if !self.envelope_increase && self.envelope_volume > 0 {
                    self.envelope_volume -= 1;
                }
            }
        }
    }

    pub fn clock_sweep(&mut self) {
        if self.sweep_timer > 0 {
            self.sweep_timer -= 1;
        }
        if self.sweep_timer == 0 {
            self.sweep_timer = if self.sweep_period > 0 {
                self.sweep_period
            } else {
                8
            };
            self.sweep_enabled = self.sweep_period != 0 || self.sweep_shift != 0;
            if self.sweep_enabled && self.sweep_period > 0 {
                self.calculate_sweep();
                if self.new_frequency <= 2047 && self.sweep_shift > 0 {
                    self.frequency = self.new_frequency;
                    self.shadow_frequency = self.new_frequency;
                    self.calculate_sweep();
                }
            }
        }
    }

    /// Compute `shadow ± (shadow >> shift)` into the scratch frequency and
    /// latch the disable flag past 2047.
    pub fn calculate_sweep(&mut self) {
        let delta = self.shadow_frequency >> self.sweep_shift;
        self.new_frequency = if self.sweep_increase {
            self.shadow_frequency.wrapping_add(delta)
        } else {
            self.shadow_frequency.wrapping_sub(delta)
        };
        if self.new_frequency > 2047 {
            self.disable_flag = true;
        }
    }

    fn dac_level(&self, bit_high: bool) -> f32 {
        if !self.dac_enabled || !self.active {
            // A disabled DAC parks the output at the mid-point.
            return 0.0;
        }
        let sample = if bit_high { self.envelope_volume } else { 0 };
        f32::from(sample) / 7.5 - 1.0
    }

    pub fn output_square(&self) -> f32 {
        let bit = (DUTY_PATTERNS[(self.duty_pattern & 0x03) as usize] >> self.duty_position) & 1;
        self.dac_level(bit != 0)
    }

    pub fn output_noise(&self) -> f32 {
        self.dac_level(!self.lfsr & 0x01 != 0)
    }

    /// Mono routing gain derived from NR50/NR51.
    fn pan_gain(&self) -> f32 {
        if !self.left_enabled && !self.right_enabled {
            return 0.0;
        }
        let left = if self.left_enabled { self.left_volume } else { 0 };
        let right = if self.right_enabled {
            self.right_volume
        } else {
            0
        };
        f32::from(left + right) / 14.0
    }
}

impl Default for ApuChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Mixer and resampler. All register-driven channel state lives on the Bus;
/// this struct only advances the generators and produces the PCM stream.
pub struct Apu {
    /// Short-circuits all mixing for headless/test execution.
    pub use_sound: bool,
    sample_clock: u32,
    producer: PcmProducer,
    dropped: u64,
}

impl Apu {
    pub fn new(producer: PcmProducer) -> Self {
        Self {
            use_sound: true,
            sample_clock: 0,
            producer,
            dropped: 0,
        }
    }

    pub fn reset(&mut self) {
        self.sample_clock = 0;
        self.dropped = 0;
    }

    /// Advance the generators by `cycles` T-cycles and emit resampled PCM.
    pub fn update(&mut self, bus: &mut Bus, cycles: u32) {
        if !self.use_sound {
            return;
        }

        bus.channels[0].step_wave(cycles);
        bus.channels[1].step_wave(cycles);
        bus.channels[3].step_noise(cycles);

        self.sample_clock += cycles;
        while self.sample_clock >= CYCLES_PER_SAMPLE {
            self.sample_clock -= CYCLES_PER_SAMPLE;
            let mixed = if bus.sound_enabled {
                let ch1 = bus.channels[0].output_square() * bus.channels[0].pan_gain();
                let ch2 = bus.channels[1].output_square() * bus.channels[1].pan_gain();
                let ch4 = bus.channels[3].output_noise() * bus.channels[3].pan_gain();
                (ch1 + ch2 + ch4) / 3.0
            } else {
                0.0
            };
            let sample = (mixed * AMPLITUDE) as i16;
            if self.producer.push(sample) {
                if self.dropped > 0 {
                    apu_trace!("recovered after dropping {} samples", self.dropped);
                    self.dropped = 0;
                }
            } else {
                if self.dropped == 0 {
                    warn!("PCM ring full, dropping samples");
                }
                self.dropped += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_ring::pcm_ring;

    #[test]
    fn disabled_dac_outputs_silence_regardless_of_state() {
        let mut chan = ApuChannel::new();
        chan.envelope_volume = 0x0F;
        chan.duty_pattern = 2;
        chan.active = true;
        chan.dac_enabled = false;
        for _ in 0..16 {
            chan.step_wave(64);
            assert_eq!(chan.output_square(), 0.0);
        }
    }

    #[test]
    fn envelope_volume_stays_clamped() {
        let mut chan = ApuChannel::new();
        chan.dac_enabled = true;
        chan.envelope_period = 1;
        chan.envelope_timer = 1;
        chan.envelope_increase = true;
        chan.envelope_volume = 14;
        for _ in 0..8 {
            chan.clock_envelope();
        }
        assert_eq!(chan.envelope_volume, 15);

        chan.envelope_increase = false;
        for _ in 0..20 {
            chan.clock_envelope();
        }
        assert_eq!(chan.envelope_volume, 0);
    }

    #[test]
    fn sweep_overflow_latches_disable_flag() {
        let mut chan = ApuChannel::new();
        chan.has_sweep = true;
        chan.sweep_period = 1;
        chan.sweep_timer = 1;
        chan.sweep_shift = 1;
        chan.sweep_increase = true;
        chan.shadow_frequency = 2000;
        chan.frequency = 2000;
        chan.clock_sweep();
        assert!(chan.disable_flag, "2000 + 1000 overflows past 2047");
    }

    #[test]
    fn length_clock_requires_enable() {
        let mut chan = ApuChannel::new();
        chan.length_timer = 2;
        chan.clock_length();
        assert_eq!(chan.length_timer, 2);
        chan.length_enabled = true;
        chan.clock_length();
        assert_eq!(chan.length_timer, 1);
    }

    #[test]
    fn lfsr_width_mode_feeds_bit_six() {
        let mut chan = ApuChannel::new();
        chan.width_mode = true;
        chan.divisor = 8;
        chan.frequency_timer = 1;
        chan.step_noise(1);
        // 0xFFFF: bits 0 and 1 equal, feedback 0 lands in bits 14 and 6.
        assert_eq!(chan.lfsr & (1 << 14), 0);
        assert_eq!(chan.lfsr & (1 << 6), 0);
    }

    #[test]
    fn muted_apu_produces_no_samples() {
        let (tx, rx) = pcm_ring(1024);
        let mut apu = Apu::new(tx);
        apu.use_sound = false;
        let mut bus = Bus::new();
        apu.update(&mut bus, 100_000);
        assert!(rx.is_empty());
    }

    #[test]
    fn mixer_emits_one_sample_per_resample_period() {
        let (tx, rx) = pcm_ring(4096);
        let mut apu = Apu::new(tx);
        let mut bus = Bus::new();
        for _ in 0..100 {
            apu.update(&mut bus, CYCLES_PER_SAMPLE);
        }
        assert_eq!(rx.len(), 100);
    }
}
