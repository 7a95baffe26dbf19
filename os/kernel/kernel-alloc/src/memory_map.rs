//! Boot memory-map fix-up.

use alloc::vec::Vec;
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::LOW_MEMORY_LIMIT;
use kernel_memory_addresses::{PAGE_SIZE, align_down, align_up, pages_for};

/// A page-aligned physical range `[base, end)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct PhysicalRange {
    pub base: u64,
    pub end: u64,
}

impl PhysicalRange {
    #[must_use]
    pub const fn new(base: u64, end: u64) -> Self {
        Self { base, end }
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.base
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.base
    }

    #[must_use]
    pub const fn pages(&self) -> u64 {
        pages_for(self.len())
    }
}

/// Usable memory as sorted, disjoint, page-aligned ranges.
///
/// Memory below 1 MiB is dropped, partial pages at either end of a region are
/// trimmed, and overlapping or touching regions are merged.
#[must_use]
pub fn normalize(regions: &[MemoryRegion]) -> Vec<PhysicalRange> {
    let mut ranges: Vec<PhysicalRange> = regions
        .iter()
        .filter(|r| r.is_usable())
        .map(|r| {
            let base = align_up(r.base.max(LOW_MEMORY_LIMIT), PAGE_SIZE);
            let end = align_down(r.end(), PAGE_SIZE);
            PhysicalRange::new(base, end)
        })
        .filter(|r| !r.is_empty())
        .collect();

    ranges.sort_unstable();

    let mut merged: Vec<PhysicalRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.base <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

/// Remove `size` bytes, aligned to `align`, from the top of the highest
/// range that can hold them below `limit`. Returns the base of the carved
/// block.
pub fn carve_top(ranges: &mut Vec<PhysicalRange>, size: u64, align: u64, limit: u64) -> Option<u64> {
    let size = align_up(size, PAGE_SIZE);
    let (slot, start, top) = ranges.iter().enumerate().rev().find_map(|(i, r)| {
        let top = r.end.min(limit);
        let start = align_down(top.checked_sub(size)?, align);
        (start >= r.base && top > r.base).then_some((i, start, start + size))
    })?;

    let range = ranges[slot];
    let below = PhysicalRange::new(range.base, start);
    let above = PhysicalRange::new(top, range.end);
    ranges.remove(slot);
    if !above.is_empty() {
        ranges.insert(slot, above);
    }
    if !below.is_empty() {
        ranges.insert(slot, below);
    }
    Some(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryRegionKind;

    #[test]
    fn normalize_trims_merges_and_drops_low_memory() {
        let map = [
            MemoryRegion::usable(0x0, 0x9_F000),
            MemoryRegion::usable(0x20_0000, 0x10_0800),
            MemoryRegion::usable(0x10_0000, 0x10_0000),
            MemoryRegion {
                base: 0x40_0000,
                length: 0x10_0000,
                kind: MemoryRegionKind::Reserved,
            },
            MemoryRegion::usable(0x1_0000_0010, 0x2000),
        ];
        assert_eq!(
            normalize(&map),
            vec![
                PhysicalRange::new(0x10_0000, 0x30_0000),
                PhysicalRange::new(0x1_0000_1000, 0x1_0000_2000),
            ]
        );
    }

    #[test]
    fn carve_from_highest_range_below_limit() {
        let mut ranges = vec![
            PhysicalRange::new(0x10_0000, 0x80_0000),
            PhysicalRange::new(0x1_0000_0000, 0x2_0000_0000),
        ];
        let pool = carve_top(&mut ranges, 4 << 20, 4 << 20, 0x1_0000_0000).unwrap();
        assert_eq!(pool, 0x40_0000);
        assert_eq!(
            ranges,
            vec![
                PhysicalRange::new(0x10_0000, 0x40_0000),
                PhysicalRange::new(0x1_0000_0000, 0x2_0000_0000),
            ]
        );
    }

    #[test]
    fn carve_splits_a_range_crossing_the_limit() {
        let mut ranges = vec![PhysicalRange::new(0xF000_0000, 0x1_1000_0000)];
        let pool = carve_top(&mut ranges, 0x1000, PAGE_SIZE, 0x1_0000_0000).unwrap();
        assert_eq!(pool, 0xFFFF_F000);
        assert_eq!(
            ranges,
            vec![
                PhysicalRange::new(0xF000_0000, 0xFFFF_F000),
                PhysicalRange::new(0x1_0000_0000, 0x1_1000_0000),
            ]
        );
    }

    #[test]
    fn carve_fails_when_nothing_fits() {
        let mut ranges = vec![PhysicalRange::new(0x10_0000, 0x20_0000)];
        assert!(carve_top(&mut ranges, 4 << 20, PAGE_SIZE, u64::MAX).is_none());
        assert_eq!(ranges.len(), 1);
    }
}
