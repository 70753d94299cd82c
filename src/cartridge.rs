use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{info, warn};
use thiserror::Error;

pub const ROM_BANK_SIZE: usize = 0x4000;
pub const RAM_BANK_SIZE: usize = 0x2000;

pub type RomBank = [u8; ROM_BANK_SIZE];
pub type RamBank = [u8; RAM_BANK_SIZE];

/// Number of 8 KiB external RAM banks per header RAM-size code.
const RAM_SIZES: [usize; 6] = [0, 0, 1, 4, 16, 8];

// Header layout fixed by the boot ROM contract.
const HEADER_TITLE_START: usize = 0x0134;
const HEADER_TITLE_END: usize = 0x0143;
const HEADER_CGB_FLAG: usize = 0x0143;
const HEADER_MAPPER: usize = 0x0147;
const HEADER_ROM_SIZE: usize = 0x0148;
const HEADER_RAM_SIZE: usize = 0x0149;
const HEADER_CHECKSUM: usize = 0x014D;
const HEADER_END: usize = 0x0150;

#[derive(Debug, Error)]
pub enum CartridgeError {
    #[error("failed to read ROM image: {0}")]
    Io(#[from] io::Error),
    #[error("ROM image is {actual} bytes but the header declares {declared}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("ROM image too small to contain a header")]
    MissingHeader,
}

/// Cartridge type byte 0x0147, as a closed enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperKind {
    RomOnly,
    Mbc1,
    Mbc1Ram,
    Mbc1RamBattery,
    Mbc2,
    Mbc2Battery,
    RomRam,
    RomRamBattery,
    Mmm01,
    Mmm01Ram,
    Mmm01RamBattery,
    Mbc3TimerBattery,
    Mbc3TimerRamBattery,
    Mbc3,
    Mbc3Ram,
    Mbc3RamBattery,
    Mbc5,
    Mbc5Ram,
    Mbc5RamBattery,
    Mbc5Rumble,
    Mbc5RumbleRam,
    Mbc5RumbleRamBattery,
    Mbc6RamBattery,
    Mbc7RamBatteryAccelerometer,
    PocketCamera,
    BandaiTama5,
    HuC3,
    HuC1RamBattery,
    Unknown(u8),
}

/// Bank-switching family a mapper belongs to. Unknown mappers degrade to
/// `None` (fixed 32 KiB view, trap writes ignored).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Banking {
    None,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc5,
}

impl MapperKind {
    pub fn classify(byte: u8) -> Self {
        match byte {
            0x00 => MapperKind::RomOnly,
            0x01 => MapperKind::Mbc1,
            0x02 => MapperKind::Mbc1Ram,
            0x03 => MapperKind::Mbc1RamBattery,
            0x05 => MapperKind::Mbc2,
            0x06 => MapperKind::Mbc2Battery,
            0x08 => MapperKind::RomRam,
            0x09 => MapperKind::RomRamBattery,
            0x0B => MapperKind::Mmm01,
            0x0C => MapperKind::Mmm01Ram,
            0x0D => MapperKind::Mmm01RamBattery,
            0x0F => MapperKind::Mbc3TimerBattery,
            0x10 => MapperKind::Mbc3TimerRamBattery,
            0x11 => MapperKind::Mbc3,
            0x12 => MapperKind::Mbc3Ram,
            0x13 => MapperKind::Mbc3RamBattery,
            0x19 => MapperKind::Mbc5,
            0x1A => MapperKind::Mbc5Ram,
            0x1B => MapperKind::Mbc5RamBattery,
            0x1C => MapperKind::Mbc5Rumble,
            0x1D => MapperKind::Mbc5RumbleRam,
            0x1E => MapperKind::Mbc5RumbleRamBattery,
            0x20 => MapperKind::Mbc6RamBattery,
            0x22 => MapperKind::Mbc7RamBatteryAccelerometer,
            0xFC => MapperKind::PocketCamera,
            0xFD => MapperKind::BandaiTama5,
            0xFE => MapperKind::HuC3,
            0xFF => MapperKind::HuC1RamBattery,
            other => MapperKind::Unknown(other),
        }
    }

    pub fn banking(self) -> Banking {
        match self {
            MapperKind::Mbc1 | MapperKind::Mbc1Ram | MapperKind::Mbc1RamBattery => Banking::Mbc1,
            MapperKind::Mbc2 | MapperKind::Mbc2Battery => Banking::Mbc2,
            MapperKind::Mbc3TimerBattery
            | MapperKind::Mbc3TimerRamBattery
            | MapperKind::Mbc3
            | MapperKind::Mbc3Ram
            | MapperKind::Mbc3RamBattery => Banking::Mbc3,
            MapperKind::Mbc5
            | MapperKind::Mbc5Ram
            | MapperKind::Mbc5RamBattery
            | MapperKind::Mbc5Rumble
            | MapperKind::Mbc5RumbleRam
            | MapperKind::Mbc5RumbleRamBattery => Banking::Mbc5,
            _ => Banking::None,
        }
    }

    pub fn has_battery(self) -> bool {
        matches!(
            self,
            MapperKind::Mbc1RamBattery
                | MapperKind::Mbc2Battery
                | MapperKind::RomRamBattery
                | MapperKind::Mmm01RamBattery
                | MapperKind::Mbc3TimerBattery
                | MapperKind::Mbc3TimerRamBattery
                | MapperKind::Mbc3RamBattery
                | MapperKind::Mbc5RamBattery
                | MapperKind::Mbc5RumbleRamBattery
                | MapperKind::Mbc6RamBattery
                | MapperKind::Mbc7RamBatteryAccelerometer
                | MapperKind::HuC1RamBattery
        )
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub title: String,
    pub cgb_flag: u8,
    pub mapper_byte: u8,
    pub rom_size_code: u8,
    pub ram_size_code: u8,
    pub header_checksum: u8,
}

impl Header {
    pub fn parse(data: &[u8]) -> Result<Self, CartridgeError> {
        if data.len() < HEADER_END {
            return Err(CartridgeError::MissingHeader);
        }
        let mut title = &data[HEADER_TITLE_START..HEADER_TITLE_END];
        if let Some(pos) = title.iter().position(|&b| b == 0) {
            title = &title[..pos];
        }
        Ok(Self {
            title: String::from_utf8_lossy(title).trim().to_string(),
            cgb_flag: data[HEADER_CGB_FLAG],
            mapper_byte: data[HEADER_MAPPER],
            rom_size_code: data[HEADER_ROM_SIZE],
            ram_size_code: data[HEADER_RAM_SIZE],
            header_checksum: data[HEADER_CHECKSUM],
        })
    }

    pub fn cgb_supported(&self) -> bool {
        self.cgb_flag & 0x80 != 0
    }

    /// Number of 16 KiB ROM banks the header declares, or `None` for codes
    /// with no defined meaning.
    pub fn declared_rom_banks(&self) -> Option<usize> {
        match self.rom_size_code {
            code @ 0x00..=0x08 => Some(2usize << code),
            // No known cartridges use these codes; the values follow the
            // traditionally documented bank counts.
            0x52 => Some(0x72),
            0x53 => Some(0x80),
            0x54 => Some(0x96),
            _ => None,
        }
    }

    /// Header checksum over 0x0134..=0x014C.
    pub fn checksum_matches(&self, data: &[u8]) -> bool {
        let mut sum: u8 = 0;
        for &b in &data[0x0134..=0x014C] {
            sum = sum.wrapping_sub(b).wrapping_sub(1);
        }
        sum == self.header_checksum
    }
}

pub struct Cartridge {
    pub header: Header,
    pub mapper: MapperKind,
    pub rom_banks: Vec<RomBank>,
    pub ram_banks: Vec<RamBank>,
    save_path: Option<PathBuf>,
}

impl Cartridge {
    /// Parse a ROM image, validate its size against the header, and slice it
    /// into 16 KiB banks.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, CartridgeError> {
        let header = Header::parse(&data)?;
        let mapper = MapperKind::classify(header.mapper_byte);
        if let MapperKind::Unknown(byte) = mapper {
            warn!("unknown cartridge type {byte:#04X}, treating as ROM only");
        }

        let declared = match header.declared_rom_banks() {
            Some(banks) => banks,
            None => {
                warn!(
                    "unknown ROM size code {:#04X}, deriving bank count from file size",
                    header.rom_size_code
                );
                (data.len() / ROM_BANK_SIZE).max(2)
            }
        };
        if data.len() != declared * ROM_BANK_SIZE {
            return Err(CartridgeError::SizeMismatch {
                declared: declared * ROM_BANK_SIZE,
                actual: data.len(),
            });
        }
        if !header.checksum_matches(&data) {
            warn!("header checksum mismatch for \"{}\"", header.title);
        }

        let rom_banks: Vec<RomBank> = data
            .chunks_exact(ROM_BANK_SIZE)
            .map(|chunk| {
                let mut bank = [0u8; ROM_BANK_SIZE];
                bank.copy_from_slice(chunk);
                bank
            })
            .collect();
        let ram_banks = vec![[0u8; RAM_BANK_SIZE]; Self::ram_banks_for(&header, mapper)];

        Ok(Self {
            header,
            mapper,
            rom_banks,
            ram_banks,
            save_path: None,
        })
    }

    /// Load a ROM image from disk. Battery-backed cartridges also restore a
    /// sibling `.sav` file into their RAM banks when one exists.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CartridgeError> {
        let data = fs::read(&path)?;
        let mut cart = Self::from_bytes(data)?;

        if cart.has_battery() {
            let mut save = PathBuf::from(path.as_ref());
            save.set_extension("sav");
            if let Ok(bytes) = fs::read(&save) {
                for (bank, chunk) in cart.ram_banks.iter_mut().zip(bytes.chunks(RAM_BANK_SIZE)) {
                    bank[..chunk.len()].copy_from_slice(chunk);
                }
            }
            cart.save_path = Some(save);
        }

        info!(
            "loaded ROM \"{}\" (mapper {:?}, {} ROM banks, {} RAM banks, CGB: {})",
            cart.header.title,
            cart.mapper,
            cart.rom_bank_count(),
            cart.ram_bank_count(),
            cart.header.cgb_supported(),
        );
        Ok(cart)
    }

    fn ram_banks_for(header: &Header, mapper: MapperKind) -> usize {
        // MBC2 carries its own internal 512x4-bit RAM regardless of the
        // header RAM-size code; one bank covers it.
        if mapper.banking() == Banking::Mbc2 {
            return 1;
        }
        match RAM_SIZES.get(header.ram_size_code as usize) {
            Some(&banks) => banks,
            None => {
                warn!("unknown RAM size code {:#04X}", header.ram_size_code);
                0
            }
        }
    }

    pub fn rom_bank_count(&self) -> usize {
        self.rom_banks.len()
    }

    pub fn ram_bank_count(&self) -> usize {
        self.ram_banks.len()
    }

    pub fn has_battery(&self) -> bool {
        self.mapper.has_battery()
    }

    /// Persist RAM banks next to the ROM for battery-backed cartridges.
    pub fn save_ram(&self) -> io::Result<()> {
        if let (true, Some(path)) = (self.has_battery(), &self.save_path)
            && !self.ram_banks.is_empty()
        {
            let mut data = Vec::with_capacity(self.ram_banks.len() * RAM_BANK_SIZE);
            for bank in &self.ram_banks {
                data.extend_from_slice(bank);
            }
            fs::write(path, data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom_with(mapper: u8, rom_code: u8, ram_code: u8) -> Vec<u8> {
        let banks = 2usize << rom_code;
        let mut rom = vec![0u8; banks * ROM_BANK_SIZE];
        rom[HEADER_MAPPER] = mapper;
        rom[HEADER_ROM_SIZE] = rom_code;
        rom[HEADER_RAM_SIZE] = ram_code;
        rom
    }

    #[test]
    fn classifies_mapper_and_battery() {
        let cart = Cartridge::from_bytes(rom_with(0x03, 0x00, 0x02)).unwrap();
        assert_eq!(cart.mapper, MapperKind::Mbc1RamBattery);
        assert!(cart.has_battery());
        assert_eq!(cart.ram_bank_count(), 1);

        let cart = Cartridge::from_bytes(rom_with(0x11, 0x01, 0x03)).unwrap();
        assert_eq!(cart.mapper, MapperKind::Mbc3);
        assert!(!cart.has_battery());
        assert_eq!(cart.ram_bank_count(), 4);
    }

    #[test]
    fn ram_bank_table_is_applied() {
        for (code, banks) in [(0u8, 0usize), (1, 0), (2, 1), (3, 4), (4, 16), (5, 8)] {
            let cart = Cartridge::from_bytes(rom_with(0x19, 0x00, code)).unwrap();
            assert_eq!(cart.ram_bank_count(), banks, "RAM code {code}");
        }
    }

    #[test]
    fn unknown_mapper_degrades_without_failing() {
        let cart = Cartridge::from_bytes(rom_with(0x42, 0x00, 0x00)).unwrap();
        assert_eq!(cart.mapper, MapperKind::Unknown(0x42));
        assert_eq!(cart.mapper.banking(), Banking::None);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut rom = rom_with(0x00, 0x01, 0x00);
        rom.truncate(3 * ROM_BANK_SIZE);
        match Cartridge::from_bytes(rom) {
            Err(CartridgeError::SizeMismatch { declared, actual }) => {
                assert_eq!(declared, 4 * ROM_BANK_SIZE);
                assert_eq!(actual, 3 * ROM_BANK_SIZE);
            }
            other => panic!("expected size mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn title_is_trimmed_at_nul() {
        let mut rom = rom_with(0x00, 0x00, 0x00);
        rom[HEADER_TITLE_START..HEADER_TITLE_START + 5].copy_from_slice(b"ZELDA");
        let cart = Cartridge::from_bytes(rom).unwrap();
        assert_eq!(cart.header.title, "ZELDA");
    }
}
