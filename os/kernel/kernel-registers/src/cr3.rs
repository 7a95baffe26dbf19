use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3: Page-Map Level-4 Base Register.
///
/// With CR4.PCIDE clear the low twelve bits hold the PWT/PCD cache controls
/// for the top-level walk; with it set they hold the process-context id.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–11: PCID (CR4.PCIDE = 1) or PWT/PCD flags (CR4.PCIDE = 0).
    #[bits(12)]
    pub pcid: u16,

    /// Bits 12–51: physical base of the top-level table >> 12.
    #[bits(40)]
    directory_4k: u64,

    /// Bits 52–62: Reserved.
    #[bits(11)]
    __: u16,

    /// Bit 63: on store with PCIDE set: keep the cached translations of
    /// the new PCID instead of invalidating them.
    pub no_flush: bool,
}

impl Cr3 {
    /// Build a `Cr3` value selecting `directory` as the live page directory.
    #[must_use]
    pub fn from_page_directory(directory: PhysicalAddress) -> Self {
        debug_assert!(
            directory.is_page_aligned(),
            "page directory must be 4K-aligned"
        );
        Self::new().with_directory_4k(directory.as_u64() >> 12)
    }

    /// Physical address of the top-level table.
    #[must_use]
    pub const fn page_directory(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.directory_4k() << 12)
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_round_trip() {
        let cr3 = Cr3::from_page_directory(PhysicalAddress::new(0x1234_5000));
        assert_eq!(cr3.page_directory().as_u64(), 0x1234_5000);
        assert_eq!(cr3.pcid(), 0);
        assert!(!cr3.no_flush());
    }
}
