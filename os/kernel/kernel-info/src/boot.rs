//! # Boot Memory Map

use kernel_memory_addresses::PhysicalAddress;

/// What the firmware says a physical region is used for.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM the kernel may hand out.
    Usable = 1,
    /// Firmware, MMIO holes and anything else the kernel must not touch.
    Reserved = 2,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 3,
    /// Memory holding the kernel image and boot-time structures.
    Kernel = 4,
}

/// One entry of the boot memory map.
///
/// Keep this `#[repr(C)]`; the loader fills an array of these.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: MemoryRegionKind::Usable,
        }
    }

    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// Exclusive end; saturates at the top of the physical space.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.kind == MemoryRegionKind::Usable
    }
}
