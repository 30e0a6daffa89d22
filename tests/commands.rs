//! End-to-end command/response exercises over the loopback transport.

use std::panic::{catch_unwind, AssertUnwindSafe};

use stm32_uart_boot::flash::{DeviceHal, EraseConfig, OptionBytes};
use stm32_uart_boot::protocol::Command;
use stm32_uart_boot::sim::{self, HostEnd, SimDelay, SimDevice, SoftCrc};
use stm32_uart_boot::{Bootloader, Error, Options, Status};

type SimBoot = Bootloader<sim::DeviceEnd, SimDelay, SoftCrc, SimDevice, std::io::ErrorKind>;

fn boot_pair(options: Options) -> (HostEnd, SimBoot, SimDevice) {
    let (host, port) = sim::pipe();
    let device = SimDevice::new();
    let boot = Bootloader::new(
        port,
        SimDelay::new(),
        SoftCrc::new(),
        device.clone(),
        options,
    );
    (host, boot, device)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_default()
}

#[test]
fn get_version_replies_with_the_fixed_bytes() {
    let (host, mut boot, _) = boot_pair(Options::default());
    host.send_command(Command::GetVersion as u8, &[]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 4, 100, 1, 0, 0]);
}

#[test]
fn corrupted_trailer_yields_a_single_nack() {
    let (host, mut boot, _) = boot_pair(Options::default());
    let mut frame = sim::encode_frame(Command::GetVersion as u8, &[]);
    let last = frame.len() - 1;
    frame[last] ^= 0x01;
    host.send(&frame);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xcd]);
}

#[test]
fn get_help_lists_the_supported_commands() {
    let (host, mut boot, _) = boot_pair(Options::default());
    host.send_command(Command::GetHelp as u8, &[]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    let mut expected = vec![0xab, 12];
    expected.extend_from_slice(&stm32_uart_boot::protocol::SUPPORTED);
    assert_eq!(host.drain(), expected);
}

#[test]
fn get_chip_id_sends_masked_bytes_without_an_ack() {
    let (host, mut boot, device) = boot_pair(Options::default());
    device.set_chip_id(0x2001_6410);
    host.send_command(Command::GetChipId as u8, &[]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    // 0x6410 masked to 12 bits is 0x0410, sent little-endian, no ACK byte.
    assert_eq!(host.drain(), vec![0x10, 0x04]);
}

#[test]
fn go_to_addr_valid_jumps_and_never_returns() {
    let (host, mut boot, _) = boot_pair(Options::default());
    let address = 0x0800_8000u32;
    host.send_command(Command::GoToAddr as u8, &address.to_le_bytes());

    let result = catch_unwind(AssertUnwindSafe(move || {
        let _ = boot.fetch_command();
    }));
    let message = panic_message(result.unwrap_err());
    assert!(
        message.contains("jump to 0x08008001"),
        "panic message: {}",
        message
    );
    assert_eq!(host.drain(), vec![0xab, 1, 0x01]);
}

#[test]
fn go_to_addr_invalid_reports_and_keeps_serving() {
    let (host, mut boot, _) = boot_pair(Options::default());
    let below_sram = 0x2000_0000u32 - 1;
    host.send_command(Command::GoToAddr as u8, &below_sram.to_le_bytes());
    host.send_command(Command::GetVersion as u8, &[]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 1, 0x00]);

    // The loop is still alive and answers the next frame.
    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 4, 100, 1, 0, 0]);
}

#[test]
fn flash_erase_mass_sentinel() {
    let (host, mut boot, device) = boot_pair(Options::default());
    host.send_command(Command::FlashErase as u8, &[0xff, 7]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 1, 0x03]);
    assert_eq!(device.erases(), vec![EraseConfig::Mass]);
}

#[test]
fn flash_erase_rejects_an_impossible_page_count() {
    let (host, mut boot, device) = boot_pair(Options::default());
    host.send_command(Command::FlashErase as u8, &[0, 33]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 1, 0x00]);
    assert!(device.erases().is_empty());
}

#[test]
fn mem_write_programs_flash_and_relocks() {
    let (host, mut boot, device) = boot_pair(Options::default());
    let address = 0x0800_9000u32;
    let mut args = address.to_le_bytes().to_vec();
    args.push(4);
    args.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    host.send_command(Command::MemWrite as u8, &args);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 1, 0x01]);
    assert_eq!(device.read_flash(address, 4), vec![0xde, 0xad, 0xbe, 0xef]);
    assert!(device.locked());
}

#[test]
fn mem_write_invalid_address_touches_nothing() {
    let (host, mut boot, device) = boot_pair(Options::default());
    let address = 0x0700_0000u32;
    let mut args = address.to_le_bytes().to_vec();
    args.push(1);
    args.push(0x55);
    host.send_command(Command::MemWrite as u8, &args);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 1, 0x00]);
    assert!(device.locked());
}

#[test]
fn mem_write_byte_fault_reports_failed() {
    let (host, mut boot, device) = boot_pair(Options::default());
    let address = 0x0800_9000u32;
    device.fail_program_at(address + 2);
    let mut args = address.to_le_bytes().to_vec();
    args.push(4);
    args.extend_from_slice(&[1, 2, 3, 4]);
    host.send_command(Command::MemWrite as u8, &args);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 1, 0x00]);
    assert!(device.locked());
}

#[test]
fn mem_read_returns_flash_contents() {
    let (host, mut boot, device) = boot_pair(Options::default());
    let address = 0x0800_0400u32;
    device.load_flash(address, &[1, 2, 3]);
    let mut args = address.to_le_bytes().to_vec();
    args.push(3);
    host.send_command(Command::MemRead as u8, &args);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 3, 1, 2, 3]);
}

#[test]
fn mem_read_invalid_address_reports_the_code() {
    let (host, mut boot, _) = boot_pair(Options::default());
    let mut args = 0x0700_0000u32.to_le_bytes().to_vec();
    args.push(3);
    host.send_command(Command::MemRead as u8, &args);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 1, 0x00]);
}

#[test]
fn protection_level_commands_report_the_option_bytes() {
    let (host, mut boot, device) = boot_pair(Options::default());
    device.set_option_bytes(OptionBytes {
        rdp_level: 0xaa,
        write_protection: 0,
    });
    host.send_command(Command::GetRdpStatus as u8, &[]);
    host.send_command(Command::EnRwProtect as u8, &[]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 1, 0xaa]);
    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 1, 0xaa]);
}

#[test]
fn read_sector_status_reports_the_protection_mask() {
    let (host, mut boot, device) = boot_pair(Options::default());
    device.set_option_bytes(OptionBytes {
        rdp_level: 0,
        write_protection: 0xdead_beef,
    });
    host.send_command(Command::ReadSectorStatus as u8, &[]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 4, 0xef, 0xbe, 0xad, 0xde]);
}

#[test]
fn otp_read_returns_one_block_or_the_invalid_code() {
    let (host, mut boot, _) = boot_pair(Options::default());
    host.send_command(Command::OtpRead as u8, &[3]);
    host.send_command(Command::OtpRead as u8, &[16]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 8, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 1, 0x00]);
}

#[test]
fn change_rop_level_only_acknowledges() {
    let (host, mut boot, _) = boot_pair(Options::default());
    host.send_command(Command::ChangeRopLevel as u8, &[1]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xab, 1]);
}

#[test]
fn unknown_commands_are_silently_acknowledged_by_default() {
    let (host, mut boot, _) = boot_pair(Options::default());
    host.send_command(0x42, &[]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert!(host.drain().is_empty());
}

#[test]
fn unknown_commands_can_be_nacked_instead() {
    let options = Options {
        nack_unknown: true,
        ..Options::default()
    };
    let (host, mut boot, _) = boot_pair(options);
    host.send_command(0x42, &[]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Ok);
    assert_eq!(host.drain(), vec![0xcd]);
}

#[test]
fn transport_failure_nacks_without_sending() {
    let (host, mut boot, _) = boot_pair(Options::default());
    host.break_link();

    assert_eq!(boot.fetch_command().unwrap(), Status::Nack);
    assert!(host.drain().is_empty());
}

#[test]
fn truncated_frame_body_times_out_without_sending() {
    let (host, mut boot, _) = boot_pair(Options::default());
    // Length prefix promises five bytes but only the command arrives.
    host.send(&[5, Command::GetVersion as u8]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Nack);
    assert!(host.drain().is_empty());
}

#[test]
fn malformed_frames_are_nacked() {
    let (host, mut boot, _) = boot_pair(Options::default());
    // Declared length 3 cannot carry a command byte and a CRC trailer.
    host.send(&[3, 0x10, 0, 0]);

    assert_eq!(boot.fetch_command().unwrap(), Status::Nack);
    assert_eq!(host.drain(), vec![0xcd]);
}

#[test]
fn boot_application_rejects_an_erased_vector() {
    let (_host, mut boot, _) = boot_pair(Options::default());

    assert_eq!(boot.try_boot_application(), Err(Error::InvalidVector));
}

#[test]
fn boot_application_sets_up_and_jumps() {
    let (_host, boot, device) = boot_pair(Options::default());
    let base = SimDevice::MAP.app_base;
    let mut image = 0x2000_4000u32.to_le_bytes().to_vec();
    image.extend_from_slice(&0x0800_9001u32.to_le_bytes());
    device.load_flash(base, &image);

    let mut boot = boot;
    let result = catch_unwind(AssertUnwindSafe(move || {
        let _ = boot.try_boot_application();
    }));
    let message = panic_message(result.unwrap_err());
    assert!(
        message.contains("jump to 0x08009001"),
        "panic message: {}",
        message
    );
    assert_eq!(device.stack_pointer(), Some(0x2000_4000));
    assert!(device.clocks_reset());
}
