//! In-memory stand-ins for the hardware collaborators: a loopback serial
//! pair, a software CRC accumulator and a simulated flash device. These back
//! the test suite and the host-run simulator binary.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::rc::Rc;

use ::crc::{Crc, CRC_32_MPEG_2};
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::crc::CrcEngine;
use crate::device::{DeviceMap, EntryPoint};
use crate::flash::{DeviceHal, EraseConfig, FlashFault, OptionBytes};
use crate::protocol;

type Queue = Rc<RefCell<VecDeque<u8>>>;

/// Create a connected host/device loopback pair.
pub fn pipe() -> (HostEnd, DeviceEnd) {
    let to_device: Queue = Rc::new(RefCell::new(VecDeque::new()));
    let to_host: Queue = Rc::new(RefCell::new(VecDeque::new()));
    let fail_reads = Rc::new(RefCell::new(false));
    (
        HostEnd {
            tx: to_device.clone(),
            rx: to_host.clone(),
            fail_reads: fail_reads.clone(),
        },
        DeviceEnd {
            rx: to_device,
            tx: to_host,
            fail_reads,
        },
    )
}

/// Build a full frame: length prefix, command, arguments, CRC trailer.
pub fn encode_frame(command: u8, args: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 2 + args.len()];
    frame[0] = (1 + args.len() + protocol::CRC_TRAILER_LEN) as u8;
    frame[1] = command;
    frame[2..].copy_from_slice(args);
    let crc = protocol::frame_crc(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Test-harness side of the loopback link.
pub struct HostEnd {
    tx: Queue,
    rx: Queue,
    fail_reads: Rc<RefCell<bool>>,
}

impl HostEnd {
    /// Queue raw bytes for the device to receive.
    pub fn send(&self, bytes: &[u8]) {
        self.tx.borrow_mut().extend(bytes.iter().copied());
    }

    /// Frame a command with a valid CRC trailer and queue it.
    pub fn send_command(&self, command: u8, args: &[u8]) {
        self.send(&encode_frame(command, args));
    }

    /// Drain everything the device has replied with so far.
    pub fn drain(&self) -> Vec<u8> {
        self.rx.borrow_mut().drain(..).collect()
    }

    /// Make the device end fail its reads with an I/O error.
    pub fn break_link(&self) {
        *self.fail_reads.borrow_mut() = true;
    }
}

/// Bootloader side of the loopback link.
pub struct DeviceEnd {
    rx: Queue,
    tx: Queue,
    fail_reads: Rc<RefCell<bool>>,
}

impl Read<u8> for DeviceEnd {
    type Error = ErrorKind;

    fn read(&mut self) -> nb::Result<u8, ErrorKind> {
        if *self.fail_reads.borrow() {
            return Err(nb::Error::Other(ErrorKind::BrokenPipe));
        }
        match self.rx.borrow_mut().pop_front() {
            Some(byte) => Ok(byte),
            None => Err(nb::Error::WouldBlock),
        }
    }
}

impl Write<u8> for DeviceEnd {
    type Error = ErrorKind;

    fn write(&mut self, byte: u8) -> nb::Result<(), ErrorKind> {
        self.tx.borrow_mut().push_back(byte);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), ErrorKind> {
        Ok(())
    }
}

/// Delay stand-in that trips after too many polls, so a test that would
/// otherwise block forever fails fast instead.
pub struct SimDelay {
    polls: u32,
    limit: u32,
}

impl SimDelay {
    pub fn new() -> Self {
        SimDelay {
            polls: 0,
            limit: 10_000,
        }
    }
}

impl Default for SimDelay {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, _ms: u32) {
        self.polls += 1;
        if self.polls > self.limit {
            panic!("simulated transport idle for too long");
        }
    }
}

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Software model of the hardware CRC accumulator: CRC-32/MPEG-2 over whole
/// words, most significant byte first.
pub struct SoftCrc {
    fed: Vec<u8>,
}

impl SoftCrc {
    pub fn new() -> Self {
        SoftCrc { fed: Vec::new() }
    }
}

impl Default for SoftCrc {
    fn default() -> Self {
        Self::new()
    }
}

impl CrcEngine for SoftCrc {
    fn accumulate(&mut self, word: u32) -> u32 {
        self.fed.extend_from_slice(&word.to_be_bytes());
        CRC32.checksum(&self.fed)
    }

    fn reset(&mut self) {
        self.fed.clear();
    }
}

#[derive(Debug)]
struct SimState {
    image: Vec<u8>,
    locked: bool,
    unlock_fails: bool,
    lock_fails: bool,
    erase_fails: bool,
    program_fail_at: Option<u32>,
    erases: Vec<EraseConfig>,
    option_bytes: OptionBytes,
    chip_id: u32,
    stack_pointer: Option<u32>,
    clocks_reset: bool,
    exit_on_jump: bool,
}

/// Simulated target: a flash image, option bytes, an identification register
/// and a handoff that panics (or exits, for the serial simulator binary) so
/// tests can observe that a jump never returns.
///
/// Clones share state, letting a test keep a handle on the device after the
/// bootloader takes ownership of the other.
#[derive(Clone)]
pub struct SimDevice {
    state: Rc<RefCell<SimState>>,
}

impl SimDevice {
    pub fn new() -> Self {
        let map = Self::MAP;
        let size = (*map.flash.end() - *map.flash.start() + 1) as usize;
        SimDevice {
            state: Rc::new(RefCell::new(SimState {
                image: vec![0xff; size],
                locked: true,
                unlock_fails: false,
                lock_fails: false,
                erase_fails: false,
                program_fail_at: None,
                erases: Vec::new(),
                option_bytes: OptionBytes {
                    rdp_level: 0,
                    write_protection: 0,
                },
                // Medium-density F103 IDCODE low bits.
                chip_id: 0x0410,
                stack_pointer: None,
                clocks_reset: false,
                exit_on_jump: false,
            })),
        }
    }

    fn offset(address: u32) -> Option<usize> {
        let map = Self::MAP;
        if map.flash.contains(&address) {
            Some((address - *map.flash.start()) as usize)
        } else {
            None
        }
    }

    /// Copy bytes out of the flash image.
    pub fn read_flash(&self, address: u32, length: usize) -> Vec<u8> {
        let start = Self::offset(address).expect("address outside the flash window");
        let state = self.state.borrow();
        state.image[start..start + length].to_vec()
    }

    /// Preload the flash image, bypassing the controller.
    pub fn load_flash(&self, address: u32, bytes: &[u8]) {
        let start = Self::offset(address).expect("address outside the flash window");
        let mut state = self.state.borrow_mut();
        state.image[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn locked(&self) -> bool {
        self.state.borrow().locked
    }

    /// Erase requests the controller has accepted, in order.
    pub fn erases(&self) -> Vec<EraseConfig> {
        self.state.borrow().erases.clone()
    }

    pub fn fail_unlock(&self) {
        self.state.borrow_mut().unlock_fails = true;
    }

    pub fn fail_lock(&self) {
        self.state.borrow_mut().lock_fails = true;
    }

    pub fn fail_erase(&self) {
        self.state.borrow_mut().erase_fails = true;
    }

    pub fn fail_program_at(&self, address: u32) {
        self.state.borrow_mut().program_fail_at = Some(address);
    }

    pub fn set_option_bytes(&self, option_bytes: OptionBytes) {
        self.state.borrow_mut().option_bytes = option_bytes;
    }

    pub fn set_chip_id(&self, id: u32) {
        self.state.borrow_mut().chip_id = id;
    }

    /// Stack-pointer value taken by the last application handoff, if any.
    pub fn stack_pointer(&self) -> Option<u32> {
        self.state.borrow().stack_pointer
    }

    pub fn clocks_reset(&self) -> bool {
        self.state.borrow().clocks_reset
    }

    /// Exit the process on handoff instead of panicking; used by the serial
    /// simulator binary.
    pub fn exit_on_jump(&self) {
        self.state.borrow_mut().exit_on_jump = true;
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceHal for SimDevice {
    const MAP: DeviceMap = DeviceMap::STM32F103;

    fn unlock(&mut self) -> Result<(), FlashFault> {
        let mut state = self.state.borrow_mut();
        if state.unlock_fails {
            return Err(FlashFault::Unlock);
        }
        state.locked = false;
        Ok(())
    }

    fn lock(&mut self) -> Result<(), FlashFault> {
        let mut state = self.state.borrow_mut();
        if state.lock_fails {
            return Err(FlashFault::Lock);
        }
        state.locked = true;
        Ok(())
    }

    fn erase(&mut self, config: &EraseConfig) -> Result<(), FlashFault> {
        let mut state = self.state.borrow_mut();
        if state.locked {
            return Err(FlashFault::Erase { page: 0 });
        }
        if state.erase_fails {
            return Err(FlashFault::Erase {
                page: match *config {
                    EraseConfig::Mass => 0,
                    EraseConfig::Pages { first, .. } => first,
                },
            });
        }
        state.erases.push(*config);
        match *config {
            EraseConfig::Mass => {
                for byte in state.image.iter_mut() {
                    *byte = 0xff;
                }
            }
            EraseConfig::Pages { first, count } => {
                let page = Self::MAP.page_size as usize;
                let len = state.image.len();
                let start = (usize::from(first) * page).min(len);
                let end = (start + usize::from(count) * page).min(len);
                for byte in state.image[start..end].iter_mut() {
                    *byte = 0xff;
                }
            }
        }
        Ok(())
    }

    fn program_byte(&mut self, address: u32, value: u8) -> Result<(), FlashFault> {
        let mut state = self.state.borrow_mut();
        if state.locked || state.program_fail_at == Some(address) {
            return Err(FlashFault::Program);
        }
        match Self::offset(address) {
            Some(index) => {
                // NOR semantics: programming can only clear bits.
                state.image[index] &= value;
                Ok(())
            }
            None => Err(FlashFault::Program),
        }
    }

    fn read_byte(&self, address: u32) -> u8 {
        match Self::offset(address) {
            Some(index) => self.state.borrow().image[index],
            // Unmodelled regions read as erased.
            None => 0xff,
        }
    }

    fn option_bytes(&self) -> OptionBytes {
        self.state.borrow().option_bytes
    }

    fn chip_id(&self) -> u32 {
        self.state.borrow().chip_id
    }

    fn set_stack_pointer(&mut self, value: u32) {
        self.state.borrow_mut().stack_pointer = Some(value);
    }

    fn deinit_clocks(&mut self) {
        self.state.borrow_mut().clocks_reset = true;
    }

    fn jump(&mut self, entry: EntryPoint) -> ! {
        if self.state.borrow().exit_on_jump {
            info!("handing off to the application at 0x{:08x}", entry.address());
            std::process::exit(0);
        }
        panic!("jump to 0x{:08x}", entry.address());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_frame_layout() {
        let frame = encode_frame(0x15, &[3, 2]);
        assert_eq!(frame.len(), 8);
        assert_eq!(frame[0], 7);
        assert_eq!(&frame[1..4], &[0x15, 3, 2]);
        let trailer = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        assert_eq!(trailer, protocol::frame_crc(&frame[..4]));
    }

    #[test]
    fn soft_crc_tracks_frame_crc() {
        let covered = [6u8, 0x11, 0x7f];
        let mut engine = SoftCrc::new();
        let mut value = 0;
        for &byte in covered.iter() {
            value = engine.accumulate(u32::from(byte));
        }
        assert_eq!(value, protocol::frame_crc(&covered));
    }

    #[test]
    fn programming_requires_unlock() {
        let mut device = SimDevice::new();
        let base = *SimDevice::MAP.flash.start();
        assert_eq!(device.program_byte(base, 0), Err(FlashFault::Program));
        device.unlock().unwrap();
        device.program_byte(base, 0xa5).unwrap();
        assert_eq!(device.read_byte(base), 0xa5);
    }
}
