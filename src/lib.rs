//! Device-side command core for an STM32-style serial bootloader.
//!
//! One host, one frame in flight: a length-prefixed, CRC-terminated command
//! is fetched over the serial transport, gated, dispatched and answered
//! before the next fetch begins. Hardware collaborators (serial port, CRC
//! accumulator, flash controller and the application handoff) sit behind
//! traits so the core runs unchanged on target or on a host.

use core::convert::{Infallible, TryFrom};
use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "linux")]
pub mod linux;

pub mod crc;
pub mod device;
pub mod flash;
pub mod protocol;
pub mod sim;

use crate::crc::CrcEngine;
use crate::flash::DeviceHal;
use crate::protocol::{AddrStatus, Command, Frame};

/// Byte transport the bootloader serves one host over.
pub trait Transport<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> Transport<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

/// Outcome of one command-fetch cycle.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Status {
    /// A frame was received and dispatched (the handler itself may still
    /// have nacked it).
    Ok,
    /// The transport failed before a full frame arrived.
    Nack,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial transport error: {0:?}")]
    Serial(SerialError),
    #[error("timed out waiting for frame bytes")]
    ReceiveTimeout,
    #[error("application reset vector points outside the device windows")]
    InvalidVector,
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Reply NACK to unrecognised command bytes instead of ignoring them
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub nack_unknown: bool,

    /// Timeout for the frame body once the length prefix arrives, in
    /// milliseconds; 0 waits forever
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub frame_timeout_ms: u32,

    /// Period to poll the transport for incoming bytes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            nack_unknown: false,
            frame_timeout_ms: 1000,
            poll_delay_ms: 1,
        }
    }
}

/// The bootloader command core.
///
/// Generic over the serial port `P`, a delay provider `D` for receive
/// polling, the checksum accumulator `C` and the device HAL `H`.
pub struct Bootloader<P, D, C, H, E> {
    port: P,
    delay: D,
    crc: C,
    hal: H,
    options: Options,
    buffer: [u8; protocol::HOST_BUFFER_LEN],
    _err: PhantomData<E>,
}

impl<P, D, C, H, E> Bootloader<P, D, C, H, E>
where
    P: Transport<E>,
    D: DelayMs<u32>,
    C: CrcEngine,
    H: DeviceHal,
    E: core::fmt::Debug,
{
    /// Create a new bootloader instance over its collaborators.
    pub fn new(port: P, delay: D, crc: C, hal: H, options: Options) -> Self {
        Self {
            port,
            delay,
            crc,
            hal,
            options,
            buffer: [0u8; protocol::HOST_BUFFER_LEN],
            _err: PhantomData,
        }
    }

    /// Borrow the device HAL, e.g. to inspect or preload a simulated one.
    pub fn device(&self) -> &H {
        &self.hal
    }

    pub fn device_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// Serve commands until a response write fails or a jump command leaves
    /// the bootloader for good.
    pub fn run(&mut self) -> Result<Infallible, Error<E>> {
        loop {
            if let Status::Nack = self.fetch_command()? {
                debug!("command fetch failed, waiting for the next frame");
            }
        }
    }

    /// Fetch, gate and dispatch one command frame.
    ///
    /// Receive failures surface as `Status::Nack` with nothing sent; the
    /// host owns any retry policy. `Err` is reserved for response-side
    /// transport failures.
    pub fn fetch_command(&mut self) -> Result<Status, Error<E>> {
        // Handlers must never see bytes from an earlier frame.
        self.buffer = [0u8; protocol::HOST_BUFFER_LEN];

        let length = match self.recv_byte(0) {
            Ok(byte) => byte,
            Err(e) => {
                warn!("failed to receive a length prefix: {:?}", e);
                return Ok(Status::Nack);
            }
        };
        self.buffer[0] = length;

        for index in 0..usize::from(length) {
            match self.recv_byte(self.options.frame_timeout_ms) {
                Ok(byte) => self.buffer[1 + index] = byte,
                Err(e) => {
                    warn!("frame body cut short at byte {}: {:?}", index, e);
                    return Ok(Status::Nack);
                }
            }
        }

        let bytes = self.buffer;
        let frame = match Frame::parse(&bytes) {
            Ok(frame) => frame,
            Err(_) => {
                debug!("frame length {} cannot carry a checksum trailer", length);
                self.send_nack()?;
                return Ok(Status::Nack);
            }
        };

        match Command::try_from(frame.command_byte()) {
            Ok(Command::GetVersion) => self.handle_get_version(&frame)?,
            Ok(Command::GetHelp) => self.handle_get_help(&frame)?,
            Ok(Command::GetChipId) => self.handle_get_chip_id(&frame)?,
            Ok(Command::GetRdpStatus) => self.handle_protection_level(&frame)?,
            Ok(Command::GoToAddr) => self.handle_go_to_addr(&frame)?,
            Ok(Command::FlashErase) => self.handle_flash_erase(&frame)?,
            Ok(Command::MemWrite) => self.handle_mem_write(&frame)?,
            Ok(Command::EnRwProtect) => self.handle_protection_level(&frame)?,
            Ok(Command::MemRead) => self.handle_mem_read(&frame)?,
            Ok(Command::ReadSectorStatus) => self.handle_read_sector_status(&frame)?,
            Ok(Command::OtpRead) => self.handle_otp_read(&frame)?,
            Ok(Command::ChangeRopLevel) => self.handle_change_rop_level(&frame)?,
            Err(protocol::UnknownCommand(code)) => {
                if self.options.nack_unknown {
                    warn!("unknown command 0x{:02x}, nacking", code);
                    self.send_nack()?;
                } else {
                    // Source behaviour: unknown commands are only logged.
                    warn!("unknown command 0x{:02x} reached", code);
                }
            }
        }

        Ok(Status::Ok)
    }

    /// Read the application stack pointer and reset vector from the fixed
    /// flash offset and hand control over. Returns only if the stored
    /// vector does not point into a device window.
    pub fn try_boot_application(&mut self) -> Result<Infallible, Error<E>> {
        let stack_pointer = self.hal.read_word(H::MAP.app_base);
        let reset_vector = self.hal.read_word(H::MAP.app_base + 4);

        let entry = H::MAP
            .entry_from_vector(reset_vector)
            .ok_or(Error::InvalidVector)?;

        info!(
            "booting application: sp 0x{:08x}, entry 0x{:08x}",
            stack_pointer,
            entry.address()
        );
        self.hal.set_stack_pointer(stack_pointer);
        self.hal.deinit_clocks();
        self.hal.jump(entry)
    }

    fn recv_byte(&mut self, timeout_ms: u32) -> Result<u8, Error<E>> {
        let mut waited = 0;
        loop {
            match self.port.read() {
                Ok(byte) => return Ok(byte),
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
            }

            self.delay.delay_ms(self.options.poll_delay_ms);
            waited += self.options.poll_delay_ms;
            if timeout_ms != 0 && waited > timeout_ms {
                return Err(Error::ReceiveTimeout);
            }
        }
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), Error<E>> {
        for &byte in bytes {
            block!(self.port.write(byte))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    fn send_ack(&mut self, reply_length: u8) -> Result<(), Error<E>> {
        self.send_bytes(&[protocol::ACK, reply_length])
    }

    fn send_nack(&mut self) -> Result<(), Error<E>> {
        self.send_bytes(&[protocol::NACK])
    }

    /// CRC gate shared by every handler: nack and bail out on a mismatch.
    fn gate(&mut self, frame: &Frame) -> Result<bool, Error<E>> {
        if crate::crc::verify(&mut self.crc, frame.covered(), frame.host_crc()) {
            debug!("crc verification passed");
            Ok(true)
        } else {
            debug!("crc verification failed");
            self.send_nack()?;
            Ok(false)
        }
    }

    fn handle_get_version(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        debug!("get_version command reached");
        if !self.gate(frame)? {
            return Ok(());
        }
        self.send_ack(protocol::VERSION.len() as u8)?;
        self.send_bytes(&protocol::VERSION)
    }

    fn handle_get_help(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        debug!("get_help command reached");
        if !self.gate(frame)? {
            return Ok(());
        }
        self.send_ack(protocol::SUPPORTED.len() as u8)?;
        self.send_bytes(&protocol::SUPPORTED)
    }

    fn handle_get_chip_id(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        debug!("get_chip_id command reached");
        if !self.gate(frame)? {
            return Ok(());
        }
        // The ID bytes go out with no ACK prefix; the source firmware does
        // the same and hosts special-case this reply.
        let id = (self.hal.chip_id() & 0x0fff) as u16;
        self.send_bytes(&id.to_le_bytes())
    }

    /// Shared by `GetRdpStatus` and `EnRwProtect`: both report the current
    /// read-protection level from the option bytes.
    fn handle_protection_level(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        debug!("protection-level command reached");
        if !self.gate(frame)? {
            return Ok(());
        }
        self.send_ack(1)?;
        let level = self.hal.option_bytes().rdp_level;
        self.send_bytes(&[level])
    }

    fn handle_go_to_addr(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        debug!("go_to_addr command reached");
        if !self.gate(frame)? {
            return Ok(());
        }
        self.send_ack(1)?;

        let address = frame.arg_u32(2);
        match H::MAP.entry_point(address) {
            Some(entry) => {
                debug!("address 0x{:08x} verified, jumping", address);
                self.send_bytes(&[AddrStatus::Valid as u8])?;
                self.hal.jump(entry)
            }
            None => {
                debug!("address 0x{:08x} rejected", address);
                self.send_bytes(&[AddrStatus::Invalid as u8])
            }
        }
    }

    fn handle_flash_erase(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        debug!("flash_erase command reached");
        if !self.gate(frame)? {
            return Ok(());
        }
        self.send_ack(1)?;

        let status = flash::erase(&mut self.hal, frame.arg_u8(2), frame.arg_u8(3));
        info!("erase finished: {:?}", status);
        self.send_bytes(&[status as u8])
    }

    fn handle_mem_write(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        debug!("mem_write command reached");
        if !self.gate(frame)? {
            return Ok(());
        }
        self.send_ack(1)?;

        let address = frame.arg_u32(2);
        let length = frame.arg_u8(6);
        let status = match H::MAP.validate(address) {
            AddrStatus::Valid => {
                let payload = frame.payload(7, usize::from(length));
                flash::program(&mut self.hal, address, payload) as u8
            }
            AddrStatus::Invalid => {
                debug!("write address 0x{:08x} rejected", address);
                AddrStatus::Invalid as u8
            }
        };
        self.send_bytes(&[status])
    }

    fn handle_mem_read(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        debug!("mem_read command reached");
        if !self.gate(frame)? {
            return Ok(());
        }

        let address = frame.arg_u32(2);
        let length = frame.arg_u8(6);
        match H::MAP.validate(address) {
            AddrStatus::Valid => {
                self.send_ack(length)?;
                for offset in 0..u32::from(length) {
                    let byte = self.hal.read_byte(address + offset);
                    block!(self.port.write(byte))?;
                }
                block!(self.port.flush())?;
                Ok(())
            }
            AddrStatus::Invalid => {
                debug!("read address 0x{:08x} rejected", address);
                self.send_ack(1)?;
                self.send_bytes(&[AddrStatus::Invalid as u8])
            }
        }
    }

    fn handle_read_sector_status(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        debug!("read_sector_status command reached");
        if !self.gate(frame)? {
            return Ok(());
        }
        self.send_ack(4)?;
        let mask = self.hal.option_bytes().write_protection;
        self.send_bytes(&mask.to_le_bytes())
    }

    fn handle_otp_read(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        debug!("otp_read command reached");
        if !self.gate(frame)? {
            return Ok(());
        }

        let index = frame.arg_u8(2);
        match H::MAP.otp_block(index) {
            Some(base) => {
                self.send_ack(device::OTP_BLOCK_LEN as u8)?;
                for offset in 0..device::OTP_BLOCK_LEN {
                    let byte = self.hal.read_byte(base + offset);
                    block!(self.port.write(byte))?;
                }
                block!(self.port.flush())?;
                Ok(())
            }
            None => {
                debug!("otp block {} out of range", index);
                self.send_ack(1)?;
                self.send_bytes(&[AddrStatus::Invalid as u8])
            }
        }
    }

    fn handle_change_rop_level(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        debug!("change_rop_level command reached");
        if !self.gate(frame)? {
            return Ok(());
        }
        // Acknowledged only; no level change is applied.
        info!("read-out protection level change requested, not applied");
        self.send_ack(1)
    }
}
