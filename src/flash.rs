//! Flash mutation engine over the device-controller seam.

use crate::device::{DeviceMap, EntryPoint};
use crate::protocol::{EraseStatus, WriteStatus};

/// Page-start sentinel selecting a whole-bank erase.
pub const MASS_ERASE: u8 = 0xFF;

/// One erase request handed to the controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EraseConfig {
    /// Whole-bank erase
    Mass,
    /// `count` pages starting at page `first`
    Pages { first: u8, count: u8 },
}

/// Faults reported by the flash control interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FlashFault {
    #[error("flash control interface would not unlock")]
    Unlock,
    #[error("flash control interface would not re-lock")]
    Lock,
    #[error("erase failed at page {page}")]
    Erase { page: u8 },
    #[error("byte programming failed")]
    Program,
}

/// Non-volatile option-byte configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OptionBytes {
    /// Read-out protection level.
    pub rdp_level: u8,
    /// Per-sector write-protection mask.
    pub write_protection: u32,
}

/// Hardware seam: flash controller, identification register, option bytes
/// and the one-way application handoff.
pub trait DeviceHal {
    /// Memory geometry of the target part.
    const MAP: DeviceMap;

    /// Unlock the flash control interface for mutation.
    fn unlock(&mut self) -> Result<(), FlashFault>;

    /// Re-lock the flash control interface.
    fn lock(&mut self) -> Result<(), FlashFault>;

    /// Run one erase request. Success means no erroring page.
    fn erase(&mut self, config: &EraseConfig) -> Result<(), FlashFault>;

    /// Program a single byte. The interface must be unlocked.
    fn program_byte(&mut self, address: u32, value: u8) -> Result<(), FlashFault>;

    /// Memory-mapped read: flash, SRAM and the OTP/option regions.
    fn read_byte(&self, address: u32) -> u8;

    /// Little-endian word read built on `read_byte`.
    fn read_word(&self, address: u32) -> u32 {
        u32::from_le_bytes([
            self.read_byte(address),
            self.read_byte(address + 1),
            self.read_byte(address + 2),
            self.read_byte(address + 3),
        ])
    }

    /// Current option-byte configuration.
    fn option_bytes(&self) -> OptionBytes;

    /// Raw identification-register value.
    fn chip_id(&self) -> u32;

    /// Point the main stack pointer at `value` ahead of a handoff.
    fn set_stack_pointer(&mut self, value: u32);

    /// Reset core clock configuration to its power-on state.
    fn deinit_clocks(&mut self);

    /// Transfer control to the application. Never returns.
    fn jump(&mut self, entry: EntryPoint) -> !;
}

/// Erase `page_count` pages from `page_start`, or the whole bank for the
/// mass-erase sentinel. The control interface is unlocked for the operation
/// and re-locked on every path that reaches it.
pub fn erase<H: DeviceHal>(hal: &mut H, page_start: u8, page_count: u8) -> EraseStatus {
    if page_count > H::MAP.page_count {
        // No partial erase is attempted for an impossible request.
        return EraseStatus::InvalidPageCount;
    }

    let config = if page_start == MASS_ERASE {
        EraseConfig::Mass
    } else if page_start < H::MAP.page_count {
        // Clamp to the pages remaining above page_start.
        let remaining = H::MAP.page_count - page_start;
        EraseConfig::Pages {
            first: page_start,
            count: page_count.min(remaining),
        }
    } else {
        return EraseStatus::Unsuccessful;
    };

    if hal.unlock().is_err() {
        warn!("flash unlock refused ahead of erase");
        let _ = hal.lock();
        return EraseStatus::Unsuccessful;
    }

    let result = hal.erase(&config);
    let _ = hal.lock();

    match result {
        Ok(()) => EraseStatus::Successful,
        Err(fault) => {
            warn!("erase fault: {}", fault);
            EraseStatus::Unsuccessful
        }
    }
}

/// Program `payload` byte-wise at increasing addresses from `address`.
///
/// All-or-nothing from the caller's perspective: the first byte fault aborts
/// the loop and the whole write reports `Failed`. The interface is re-locked
/// whichever way the loop ends, and a lock fault also reports `Failed`.
pub fn program<H: DeviceHal>(hal: &mut H, address: u32, payload: &[u8]) -> WriteStatus {
    if hal.unlock().is_err() {
        warn!("flash unlock refused ahead of programming");
        return WriteStatus::Failed;
    }

    let mut status = WriteStatus::Passed;
    for (offset, &byte) in payload.iter().enumerate() {
        if let Err(fault) = hal.program_byte(address + offset as u32, byte) {
            warn!("programming fault at offset {}: {}", offset, fault);
            status = WriteStatus::Failed;
            break;
        }
    }

    if hal.lock().is_err() {
        status = WriteStatus::Failed;
    }
    status
}
