use crate::{PAGE_MASK, PAGE_SIZE, align_down};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Virtual (linear) memory address.
///
/// Carries the intent "translated by the page tables". Helpers split the
/// address into the four 9-bit table indices used by 4-level paging.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0x0000_7FFF_FFFF_F000);
/// assert_eq!(va.table_index(0), 255);
/// assert_eq!(va.table_index(3), 511);
/// assert!(va.is_canonical());
/// assert!(!va.is_kernel_half());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Global page number: the address bits 12..48 as one index.
    #[inline]
    #[must_use]
    pub const fn page_number(self) -> u64 {
        (self.0 >> 12) & 0xF_FFFF_FFFF
    }

    /// Table index for paging `level` (0 = top-level, 3 = leaf table).
    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    #[must_use]
    pub const fn table_index(self, level: usize) -> usize {
        debug_assert!(level < 4);
        ((self.0 >> (39 - 9 * level)) & 0x1FF) as usize
    }

    /// Bits 48..63 replicate bit 47.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let upper = self.0 >> 47;
        upper == 0 || upper == 0x1_FFFF
    }

    /// Addresses in the upper half are shared by every address space.
    #[inline]
    #[must_use]
    pub const fn is_kernel_half(self) -> bool {
        self.0 & (1 << 47) != 0
    }

    /// Rebuild a canonical address from four table indices and an offset.
    #[inline]
    #[must_use]
    pub const fn from_indices(indices: [usize; 4], offset: u64) -> Self {
        let raw = ((indices[0] as u64 & 0x1FF) << 39)
            | ((indices[1] as u64 & 0x1FF) << 30)
            | ((indices[2] as u64 & 0x1FF) << 21)
            | ((indices[3] as u64 & 0x1FF) << 12)
            | (offset & PAGE_MASK);
        Self(sign_extend(raw))
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

#[inline]
const fn sign_extend(raw: u64) -> u64 {
    if raw & (1 << 47) != 0 {
        raw | 0xFFFF_0000_0000_0000
    } else {
        raw
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_round_trip() {
        let va = VirtualAddress::new(0xFFFF_8080_1234_5678);
        let idx = [
            va.table_index(0),
            va.table_index(1),
            va.table_index(2),
            va.table_index(3),
        ];
        assert_eq!(idx[0], 257);
        assert_eq!(VirtualAddress::from_indices(idx, va.page_offset()), va);
    }

    #[test]
    fn canonical_checks() {
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_FFFF_8000_0000).is_kernel_half());
    }

    #[test]
    fn page_number_ignores_sign_extension() {
        let va = VirtualAddress::new(0xFFFF_8000_0000_1000);
        assert_eq!(va.page_number(), 0x8_0000_0001);
    }
}
