use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// CR4: Control Register 4, reduced to the paging switches.
#[bitfield(u64)]
pub struct Cr4 {
    /// Bits 0–6: VME, PVI, TSD, DE, PSE, PAE, MCE.
    #[bits(7)]
    pub low: u8,

    /// Bit 7: PGE: Page Global Enable.
    ///
    /// Clearing and setting it again drops every TLB entry, global ones
    /// included.
    pub pge: bool,

    /// Bits 8–16.
    #[bits(9)]
    pub mid: u16,

    /// Bit 17: PCIDE: Process-Context Identifiers.
    pub pcide: bool,

    /// Bits 18–63.
    #[bits(46)]
    pub high: u64,
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr4 {
    unsafe fn load_unsafe() -> Self {
        let mut cr4: u64;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, preserves_flags));
        }
        Self::from_bits(cr4)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr4 {
    unsafe fn store_unsafe(self) {
        let cr4 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
        }
    }
}
