//! Wire protocol: frame layout, command codes and response constants.
//!
//! Every host-to-device frame is a one-byte length prefix followed by that
//! many bytes, the last four of which are a little-endian CRC-32 trailer
//! covering everything before them (length prefix included).

use core::convert::TryFrom;

use ::crc::{Crc, CRC_32_MPEG_2};

/// First byte of every successful reply, followed by the reply length.
pub const ACK: u8 = 0xAB;
/// Sole byte of a rejected frame.
pub const NACK: u8 = 0xCD;

/// Size of the CRC trailer closing every frame.
pub const CRC_TRAILER_LEN: usize = 4;

/// Receive buffer capacity; a length prefix plus any u8-length body fits.
pub const HOST_BUFFER_LEN: usize = 256;

/// Reply to `GetVersion`: protocol id, major, minor, patch.
pub const VERSION: [u8; 4] = [100, 1, 0, 0];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Protocol id and semantic bootloader version
    GetVersion = 0x10,

    /// List of all supported command codes
    GetHelp = 0x11,

    /// Device identifier from the hardware identification register
    GetChipId = 0x12,

    /// Current flash read-protection level
    GetRdpStatus = 0x13,

    /// Validate a 32-bit address and transfer control to it
    GoToAddr = 0x14,

    /// Erase a page range, or the whole bank for the mass-erase sentinel
    FlashErase = 0x15,

    /// Program a payload byte-wise at a validated address
    MemWrite = 0x16,

    /// Report the read/write protection configuration
    EnRwProtect = 0x17,

    /// Read memory back from a validated address
    MemRead = 0x18,

    /// Report the sector write-protection mask from the option bytes
    ReadSectorStatus = 0x19,

    /// Read one block of the one-time-programmable area
    OtpRead = 0x20,

    /// Change the read-out protection level (acknowledged, not applied)
    ChangeRopLevel = 0x21,
}

/// The twelve supported command codes, as reported by `GetHelp`.
pub const SUPPORTED: [u8; 12] = [
    Command::GetVersion as u8,
    Command::GetHelp as u8,
    Command::GetChipId as u8,
    Command::GetRdpStatus as u8,
    Command::GoToAddr as u8,
    Command::FlashErase as u8,
    Command::MemWrite as u8,
    Command::EnRwProtect as u8,
    Command::MemRead as u8,
    Command::ReadSectorStatus as u8,
    Command::OtpRead as u8,
    Command::ChangeRopLevel as u8,
];

/// Command byte outside the supported set. Not an error on the wire; the
/// dispatcher's unknown-command policy decides what happens.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnknownCommand(pub u8);

impl TryFrom<u8> for Command {
    type Error = UnknownCommand;
    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        let cmd = match byte {
            0x10 => Command::GetVersion,
            0x11 => Command::GetHelp,
            0x12 => Command::GetChipId,
            0x13 => Command::GetRdpStatus,
            0x14 => Command::GoToAddr,
            0x15 => Command::FlashErase,
            0x16 => Command::MemWrite,
            0x17 => Command::EnRwProtect,
            0x18 => Command::MemRead,
            0x19 => Command::ReadSectorStatus,
            0x20 => Command::OtpRead,
            0x21 => Command::ChangeRopLevel,
            _ => return Err(UnknownCommand(byte)),
        };
        Ok(cmd)
    }
}

/// Address validity code reported inside an ACKed reply.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddrStatus {
    Invalid = 0x00,
    Valid = 0x01,
}

/// Outcome byte of a `FlashErase` request.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EraseStatus {
    /// Requested page count exceeds the device limit; nothing was touched
    InvalidPageCount = 0x00,
    Unsuccessful = 0x02,
    Successful = 0x03,
}

/// Outcome byte of a `MemWrite` request.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    Failed = 0x00,
    Passed = 0x01,
}

/// Borrowed view of one received frame sitting in the host buffer.
///
/// The buffer is zeroed before every fetch cycle, so argument reads past the
/// received bytes see zeros rather than stale data from an earlier frame.
#[derive(Copy, Clone, Debug)]
pub struct Frame<'a> {
    bytes: &'a [u8],
    packet_len: usize,
}

/// Frame whose declared length cannot carry a command and a CRC trailer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MalformedFrame;

impl<'a> Frame<'a> {
    /// Interpret the receive buffer; the length prefix sits at offset 0.
    pub fn parse(bytes: &'a [u8]) -> Result<Frame<'a>, MalformedFrame> {
        let declared = usize::from(*bytes.get(0).ok_or(MalformedFrame)?);
        let packet_len = declared + 1;
        if declared < 1 + CRC_TRAILER_LEN || packet_len > bytes.len() {
            return Err(MalformedFrame);
        }
        Ok(Frame { bytes, packet_len })
    }

    pub fn command_byte(&self) -> u8 {
        self.bytes[1]
    }

    /// Region the checksum covers: length prefix, command and arguments.
    pub fn covered(&self) -> &[u8] {
        &self.bytes[..self.packet_len - CRC_TRAILER_LEN]
    }

    /// Host-supplied CRC trailer, little-endian.
    pub fn host_crc(&self) -> u32 {
        let tail = &self.bytes[self.packet_len - CRC_TRAILER_LEN..self.packet_len];
        u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]])
    }

    pub fn arg_u8(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }

    pub fn arg_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ])
    }

    /// Payload slice, truncated to the buffer if the declared length runs
    /// past it.
    pub fn payload(&self, offset: usize, length: usize) -> &[u8] {
        let start = offset.min(self.bytes.len());
        let end = (offset + length).min(self.bytes.len());
        &self.bytes[start..end]
    }
}

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// CRC over a frame's covered bytes, as the device accumulator computes it:
/// each byte zero-extended to a 32-bit word and run through CRC-32/MPEG-2.
pub fn frame_crc(covered: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    for &byte in covered {
        digest.update(&[0, 0, 0, byte]);
    }
    digest.finalize()
}
