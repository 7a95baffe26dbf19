//! Page-table access through the recursive slot.
//!
//! With top-level slot 256 pointing at the directory itself, every table of
//! the live address space appears at a fixed linear address:
//!
//! ```text
//!   PTE   entries: [256][i0 ][i1 ][i2 ] + 8*i3
//!   PD    entries: [256][256][i0 ][i1 ] + 8*i2
//!   PDPT  entries: [256][256][256][i0 ] + 8*i1
//!   PML4  entries: [256][256][256][256] + 8*i0
//! ```
//!
//! so the entry for level `l` sits at `BASE[l] + 8 * (page_number >> 9*(3-l))`.

use crate::{LEAF, LEVELS, PageTable, TableWalker};
use kernel_info::memory::RECURSIVE_SLOT;
use kernel_memory_addresses::{PAGE_MASK, PhysicalAddress, VirtualAddress};

const R: usize = RECURSIVE_SLOT;

/// Linear base of the entry window for each level.
const BASES: [VirtualAddress; LEVELS] = [
    VirtualAddress::from_indices([R, R, R, R], 0),
    VirtualAddress::from_indices([R, R, R, 0], 0),
    VirtualAddress::from_indices([R, R, 0, 0], 0),
    VirtualAddress::from_indices([R, 0, 0, 0], 0),
];

/// Linear address of the `level` entry translating `va`.
#[must_use]
pub const fn entry_address(level: usize, va: VirtualAddress) -> VirtualAddress {
    let index = va.page_number() >> (9 * (LEAF - level));
    VirtualAddress::new(BASES[level].as_u64() + 8 * index)
}

/// Linear address of the table holding that entry.
#[must_use]
pub const fn table_address(level: usize, va: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(entry_address(level, va).as_u64() & !PAGE_MASK)
}

/// Walks the live address space through its recursive slot.
pub struct RecursiveWalker {
    _private: (),
}

impl RecursiveWalker {
    /// # Safety
    /// Every directory that is ever loaded while this walker is used must
    /// carry the self-reference in slot [`RECURSIVE_SLOT`], and the walker
    /// may only be used for the directory that is currently live.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl TableWalker for RecursiveWalker {
    fn table(
        &self,
        _root: PhysicalAddress,
        level: usize,
        va: VirtualAddress,
    ) -> Option<&PageTable> {
        if level > 0 {
            let parent = self.table(PhysicalAddress::zero(), level - 1, va)?;
            let entry = parent.entry(va.table_index(level - 1)).load();
            if !entry.present() || (level > 1 && entry.page_size()) {
                return None;
            }
        }
        // Safety: the parent is present, so the window page is mapped.
        Some(unsafe { &*table_address(level, va).as_ptr::<PageTable>() })
    }
}
