//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses used in paging and
//! memory management code.
//!
//! ## Overview
//!
//! The virtual memory subsystem juggles three kinds of 64-bit numbers: linear
//! (virtual) addresses, physical frame addresses, and raw page-table words.
//! Mixing the first two up is the classic way to corrupt a page table, so
//! they get distinct, zero-cost types:
//!
//! | Wrapper | Meaning |
//! |----------|---------|
//! | [`VirtualAddress`] | A linear address, translated by the page tables. |
//! | [`PhysicalAddress`] | A physical RAM or MMIO address. |
//!
//! Only 4 KiB pages are used by the memory manager, so the page geometry is
//! expressed as plain constants ([`PAGE_SIZE`], [`PAGE_SHIFT`], [`PAGE_MASK`])
//! rather than as a type parameter.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_8080_0000_1234);
//! assert_eq!(va.page_base().as_u64(), 0xFFFF_8080_0000_1000);
//! assert_eq!(va.page_offset(), 0x234);
//! assert_eq!(va.table_index(0), 257);
//!
//! let pa = PhysicalAddress::new(0x1_0000_2042);
//! assert!(!pa.is_below_4g());
//! assert_eq!(pa.page_base().as_u64(), 0x1_0000_2000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod virtual_address;

pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Size of a 4 KiB page in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Mask of the in-page offset bits.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Number of entries in one page table.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Align `value` down to the next multiple of `align` (a power of two).
///
/// ```
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1234, 0x1000), 0x1000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Align `value` up to the next multiple of `align` (a power of two).
///
/// Wraps to zero when the result does not fit; callers dealing with
/// addresses near the top of the address space must check for that.
///
/// ```
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0x1001, 0x1000), 0x2000);
/// assert_eq!(align_up(0x2000, 0x1000), 0x2000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value.wrapping_add(align - 1) & !(align - 1)
}

/// Number of 4 KiB pages needed to cover `len` bytes.
#[inline(always)]
#[must_use]
pub const fn pages_for(len: u64) -> u64 {
    len.div_ceil(PAGE_SIZE)
}
