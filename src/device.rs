//! Target memory geometry, address validation and the jump-target capability.

use core::ops::RangeInclusive;

use crate::protocol::AddrStatus;

/// Length of one OTP block as reported by `OtpRead`.
pub const OTP_BLOCK_LEN: u32 = 8;

/// Fixed memory geometry of the target part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceMap {
    /// SRAM window, closed on both ends.
    pub sram: RangeInclusive<u32>,
    /// Flash window, closed on both ends.
    pub flash: RangeInclusive<u32>,
    /// Number of erasable flash pages.
    pub page_count: u8,
    /// Flash page size in bytes.
    pub page_size: u32,
    /// Application image base: stack pointer here, reset vector at +4.
    pub app_base: u32,
    /// Base of the one-time-programmable area.
    pub otp_base: u32,
    /// Number of OTP blocks.
    pub otp_blocks: u8,
}

impl DeviceMap {
    /// Low-density STM32F103: 20K SRAM, 64K flash window, application image
    /// half way up. Only the first 32 pages of 1K are reachable by erase;
    /// the upper half is writable and readable but never erased here.
    pub const STM32F103: DeviceMap = DeviceMap {
        sram: 0x2000_0000..=0x2000_5000,
        flash: 0x0800_0000..=0x0801_0000,
        page_count: 32,
        page_size: 0x400,
        app_base: 0x0800_8000,
        otp_base: 0x1fff_f800,
        otp_blocks: 16,
    };

    /// Coarse range check only: inside the SRAM or flash window. No
    /// alignment or content validation is attempted.
    pub fn validate(&self, address: u32) -> AddrStatus {
        if self.sram.contains(&address) || self.flash.contains(&address) {
            AddrStatus::Valid
        } else {
            AddrStatus::Invalid
        }
    }

    /// Jump target for a host-supplied address. The low bit is set on the
    /// way in; the target's vector convention requires it.
    pub fn entry_point(&self, address: u32) -> Option<EntryPoint> {
        match self.validate(address) {
            AddrStatus::Valid => Some(EntryPoint(address + 1)),
            AddrStatus::Invalid => None,
        }
    }

    /// Jump target from a reset-vector word, which already carries the low
    /// bit; the word with that bit stripped must land in a window.
    pub fn entry_from_vector(&self, vector: u32) -> Option<EntryPoint> {
        match self.validate(vector & !1) {
            AddrStatus::Valid => Some(EntryPoint(vector)),
            AddrStatus::Invalid => None,
        }
    }

    /// Base address of an OTP block, if the index is in range.
    pub fn otp_block(&self, index: u8) -> Option<u32> {
        if index < self.otp_blocks {
            Some(self.otp_base + u32::from(index) * OTP_BLOCK_LEN)
        } else {
            None
        }
    }
}

/// Jump target obtainable only through successful address validation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EntryPoint(u32);

impl EntryPoint {
    /// The address control transfers to, low bit included.
    pub fn address(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: DeviceMap = DeviceMap::STM32F103;

    #[test]
    fn window_bounds_are_inclusive() {
        for window in &[MAP.sram.clone(), MAP.flash.clone()] {
            assert_eq!(MAP.validate(*window.start()), AddrStatus::Valid);
            assert_eq!(MAP.validate(*window.end()), AddrStatus::Valid);
            assert_eq!(MAP.validate(*window.start() - 1), AddrStatus::Invalid);
            assert_eq!(MAP.validate(*window.end() + 1), AddrStatus::Invalid);
        }
    }

    #[test]
    fn entry_point_carries_the_low_bit() {
        let entry = MAP.entry_point(MAP.app_base).unwrap();
        assert_eq!(entry.address(), MAP.app_base + 1);
        assert!(MAP.entry_point(0x1234_5678).is_none());
    }

    #[test]
    fn reset_vectors_validate_with_the_bit_stripped() {
        let entry = MAP.entry_from_vector(MAP.app_base + 0x101).unwrap();
        assert_eq!(entry.address(), MAP.app_base + 0x101);
        assert!(MAP.entry_from_vector(0xffff_ffff).is_none());
    }

    #[test]
    fn otp_blocks_are_bounded() {
        assert_eq!(MAP.otp_block(0), Some(MAP.otp_base));
        assert_eq!(MAP.otp_block(15), Some(MAP.otp_base + 15 * OTP_BLOCK_LEN));
        assert_eq!(MAP.otp_block(16), None);
    }
}
