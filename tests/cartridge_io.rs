use std::fs;

use tempfile::tempdir;

use pocket_emu_core::cartridge::{Cartridge, MapperKind, RAM_BANK_SIZE, ROM_BANK_SIZE};
use pocket_emu_core::gameboy::GameBoy;

fn rom_image(mapper: u8, ram_code: u8) -> Vec<u8> {
    let mut rom = vec![0u8; 2 * ROM_BANK_SIZE];
    rom[0x0147] = mapper;
    rom[0x0149] = ram_code;
    rom
}

#[test]
fn battery_ram_round_trips_through_sav_file() {
    let dir = tempdir().unwrap();
    let rom_path = dir.path().join("game.gb");
    fs::write(&rom_path, rom_image(0x03, 0x03)).unwrap(); // MBC1+RAM+Battery, 4 banks

    let mut cart = Cartridge::from_file(&rom_path).unwrap();
    cart.ram_banks[0][0] = 0xAA;
    cart.ram_banks[3][RAM_BANK_SIZE - 1] = 0xBB;
    cart.save_ram().unwrap();

    let save_path = rom_path.with_extension("sav");
    let data = fs::read(&save_path).unwrap();
    assert_eq!(data.len(), 4 * RAM_BANK_SIZE);
    assert_eq!(data[0], 0xAA);

    let cart = Cartridge::from_file(&rom_path).unwrap();
    assert_eq!(cart.ram_banks[0][0], 0xAA);
    assert_eq!(cart.ram_banks[3][RAM_BANK_SIZE - 1], 0xBB);
}

#[test]
fn cartridge_without_battery_leaves_no_save() {
    let dir = tempdir().unwrap();
    let rom_path = dir.path().join("nosave.gb");
    fs::write(&rom_path, rom_image(0x01, 0x02)).unwrap(); // plain MBC1

    let cart = Cartridge::from_file(&rom_path).unwrap();
    assert!(!cart.has_battery());
    cart.save_ram().unwrap();
    assert!(!rom_path.with_extension("sav").exists());
}

#[test]
fn load_file_accepts_rom_and_publishes_mapper() {
    let dir = tempdir().unwrap();
    let rom_path = dir.path().join("loadme.gb");
    fs::write(&rom_path, rom_image(0x00, 0x00)).unwrap();

    let mut gb = GameBoy::default();
    assert!(gb.load_file("rom", &rom_path));
    let cart = gb.bus.cart.as_ref().unwrap();
    assert_eq!(cart.mapper, MapperKind::RomOnly);
    assert_eq!(cart.rom_bank_count(), 2);
}

#[test]
fn truncated_rom_fails_load_file() {
    let dir = tempdir().unwrap();
    let rom_path = dir.path().join("short.gb");
    let mut rom = rom_image(0x00, 0x00);
    rom[0x0148] = 0x02; // declares 8 banks, file only has 2
    fs::write(&rom_path, rom).unwrap();

    let mut gb = GameBoy::default();
    assert!(!gb.load_file("rom", &rom_path));
}

#[test]
fn cgb_flag_is_published_to_the_bus() {
    let dir = tempdir().unwrap();
    let rom_path = dir.path().join("color.gbc");
    let mut rom = rom_image(0x00, 0x00);
    rom[0x0143] = 0x80;
    fs::write(&rom_path, rom).unwrap();

    let mut gb = GameBoy::default();
    assert!(gb.load_file("rom", &rom_path));
    assert!(gb.bus.use_cgb);
    assert_eq!(gb.cpu.a, 0x11, "CGB post-boot accumulator");
}
