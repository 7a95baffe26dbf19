//! Dual-indexed interval allocator for address ranges.
//!
//! Free extents are kept in two ordered indexes over the same set:
//!
//! ```text
//!   by_addr: base -> size          (neighbour lookup for coalescing)
//!   by_size: (size, base)          (best fit, lowest address on ties)
//! ```
//!
//! Both are only ever changed through [`Extents::insert`] and
//! [`Extents::remove`], which keep them identical. Adjacent free extents are
//! always merged on release, so no extent's end equals another's start.
//!
//! Before [`LinearAllocator::init`] runs, allocations are served by a bump
//! pointer that never frees; `init` leaves out everything the bump pointer
//! handed out.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::{PAGE_SIZE, align_down, align_up};
use kernel_sync::SpinLock;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LinearAllocError {
    #[error("address space exhausted")]
    Exhausted,
    #[error("range {base:#x}+{size:#x} is not entirely free")]
    NotFree { base: u64, size: u64 },
    #[error("zero-sized request")]
    ZeroSize,
}

/// Broken allocator invariant, reported by [`LinearAllocator::validate`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("by-address and by-size indexes differ")]
    IndexMismatch,
    #[error("free extents at {first:#x} and {second:#x} touch")]
    Adjacent { first: u64, second: u64 },
    #[error("free extents at {first:#x} and {second:#x} overlap")]
    Overlap { first: u64, second: u64 },
}

#[derive(Default)]
struct Extents {
    by_addr: BTreeMap<u64, u64>,
    by_size: BTreeSet<(u64, u64)>,
}

impl Extents {
    fn insert(&mut self, base: u64, size: u64) {
        debug_assert!(size > 0);
        self.by_addr.insert(base, size);
        self.by_size.insert((size, base));
    }

    fn remove(&mut self, base: u64, size: u64) {
        self.by_addr.remove(&base);
        self.by_size.remove(&(size, base));
    }

    /// Free extents intersecting `[base, end)`, ascending.
    fn overlapping(&self, base: u64, end: u64) -> Vec<(u64, u64)> {
        let mut hits: Vec<(u64, u64)> = self
            .by_addr
            .range(..end)
            .rev()
            .take_while(|(b, s)| **b + **s > base)
            .map(|(b, s)| (*b, *s))
            .collect();
        hits.reverse();
        hits
    }
}

/// One independent address pool.
pub struct LinearAllocator {
    name: &'static str,
    early_base: u64,
    early_next: AtomicU64,
    early_end: AtomicU64,
    span: SpinLock<Range<u64>>,
    extents: SpinLock<Option<Extents>>,
}

impl LinearAllocator {
    /// An allocator with neither early range nor free space yet.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self::with_early_range(name, 0, 0)
    }

    /// An allocator that bump-allocates from `[base, end)` until
    /// [`init`](Self::init) is called.
    #[must_use]
    pub const fn with_early_range(name: &'static str, base: u64, end: u64) -> Self {
        Self {
            name,
            early_base: base,
            early_next: AtomicU64::new(base),
            early_end: AtomicU64::new(end),
            span: SpinLock::new(0..0),
            extents: SpinLock::new(None),
        }
    }

    /// Build the free indexes over `[base, base + size)`, minus whatever the
    /// bump pointer already handed out.
    pub fn init(&self, base: u64, size: u64) {
        let end = base + size;
        let early_end = self.early_end.load(Ordering::Acquire);
        let used = self.early_base..self.early_next.load(Ordering::Acquire).min(early_end);

        let mut extents = Extents::default();
        if used.is_empty() || used.end <= base || used.start >= end {
            extents.insert(base, size);
        } else {
            let below = align_down(used.start.clamp(base, end), PAGE_SIZE);
            let above = align_up(used.end.clamp(base, end), PAGE_SIZE);
            if below > base {
                extents.insert(base, below - base);
            }
            if above < end {
                extents.insert(above, end - above);
            }
        }

        *self.span.lock() = base..end;
        *self.extents.lock() = Some(extents);
        log::debug!("{}: pool {base:#x}..{end:#x}", self.name);
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The range handed to [`init`](Self::init).
    #[must_use]
    pub fn span(&self) -> Range<u64> {
        self.span.lock().clone()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.extents.lock().is_some()
    }

    /// Carve `size` bytes (rounded up to pages) out of the smallest free
    /// extent that fits.
    pub fn allocate(&self, size: u64) -> Result<u64, LinearAllocError> {
        if size == 0 {
            return Err(LinearAllocError::ZeroSize);
        }
        let size = align_up(size, PAGE_SIZE);

        let mut guard = self.extents.lock();
        let Some(extents) = guard.as_mut() else {
            return self.bump(size);
        };

        let &(found_size, base) = extents
            .by_size
            .range((size, 0)..)
            .next()
            .ok_or(LinearAllocError::Exhausted)?;

        extents.remove(base, found_size);
        if found_size > size {
            extents.insert(base + size, found_size - size);
        }
        Ok(base)
    }

    /// Only advances the pointer when the request fits.
    fn bump(&self, size: u64) -> Result<u64, LinearAllocError> {
        let end = self.early_end.load(Ordering::Relaxed);
        self.early_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                next.checked_add(size).filter(|top| *top <= end)
            })
            .map_err(|_| LinearAllocError::Exhausted)
    }

    /// Remove exactly `[base, base + size)` from the free space.
    ///
    /// With `require_free` the whole range must lie inside one free extent
    /// and nothing changes otherwise; without it, whatever part of the range
    /// is free gets taken.
    pub fn reserve(&self, base: u64, size: u64, require_free: bool) -> Result<(), LinearAllocError> {
        if size == 0 {
            return Err(LinearAllocError::ZeroSize);
        }
        let end = align_up(base + size, PAGE_SIZE);
        let base = align_down(base, PAGE_SIZE);

        let mut guard = self.extents.lock();
        let Some(extents) = guard.as_mut() else {
            return Err(LinearAllocError::NotFree { base, size });
        };

        let hits = extents.overlapping(base, end);
        if require_free {
            let covered = matches!(hits.as_slice(), [(b, s)] if *b <= base && b + s >= end);
            if !covered {
                return Err(LinearAllocError::NotFree {
                    base,
                    size: end - base,
                });
            }
        }

        for (b, s) in hits {
            extents.remove(b, s);
            if b < base {
                extents.insert(b, base - b);
            }
            if b + s > end {
                extents.insert(end, b + s - end);
            }
        }
        Ok(())
    }

    /// Return `[base, base + size)`, widened to page boundaries, and merge it
    /// with the free neighbours on either side.
    ///
    /// Parts of the range that are already free are absorbed, so releasing
    /// a range with holes in it gives back every page it covers.
    pub fn release(&self, base: u64, size: u64) {
        if size == 0 {
            return;
        }
        let mut start = align_down(base, PAGE_SIZE);
        let mut end = align_up(base + size, PAGE_SIZE);

        let mut guard = self.extents.lock();
        let Some(extents) = guard.as_mut() else {
            log::warn!("{}: release of {start:#x}..{end:#x} before init", self.name);
            return;
        };

        for (b, s) in extents.overlapping(start, end) {
            extents.remove(b, s);
            start = start.min(b);
            end = end.max(b + s);
        }

        let before = extents
            .by_addr
            .range(..start)
            .next_back()
            .map(|(b, s)| (*b, *s))
            .filter(|(b, s)| b + s == start);
        if let Some((b, s)) = before {
            extents.remove(b, s);
            start = b;
        }

        let after = extents.by_addr.get(&end).map(|s| (end, *s));
        if let Some((b, s)) = after {
            extents.remove(b, s);
            end = b + s;
        }

        extents.insert(start, end - start);
    }

    /// Snapshot of the free extents as `(base, size)`, ascending.
    #[must_use]
    pub fn extents(&self) -> Vec<(u64, u64)> {
        self.extents.lock().as_ref().map_or_else(Vec::new, |e| {
            e.by_addr.iter().map(|(b, s)| (*b, *s)).collect()
        })
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.extents
            .lock()
            .as_ref()
            .map_or(0, |e| e.by_addr.values().sum())
    }

    /// Check that both indexes agree and extents are disjoint and
    /// non-adjacent.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let guard = self.extents.lock();
        let Some(extents) = guard.as_ref() else {
            return Ok(());
        };

        if extents.by_addr.len() != extents.by_size.len()
            || extents
                .by_size
                .iter()
                .any(|(s, b)| extents.by_addr.get(b) != Some(s))
        {
            return Err(InvariantViolation::IndexMismatch);
        }

        let mut previous: Option<(u64, u64)> = None;
        for (&base, &size) in &extents.by_addr {
            if let Some((pb, ps)) = previous {
                if pb + ps == base {
                    return Err(InvariantViolation::Adjacent {
                        first: pb,
                        second: base,
                    });
                }
                if pb + ps > base {
                    return Err(InvariantViolation::Overlap {
                        first: pb,
                        second: base,
                    });
                }
            }
            previous = Some((base, size));
        }
        Ok(())
    }

    /// Log every free extent.
    pub fn dump(&self) {
        for (base, size) in self.extents() {
            log::debug!(
                "{}: free {base:#018x}..{:#018x} ({size:#x})",
                self.name,
                base + size
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: u64 = PAGE_SIZE;

    fn pool() -> LinearAllocator {
        let a = LinearAllocator::new("test");
        a.init(0x10_0000, 64 * P);
        a
    }

    #[test]
    fn best_fit_prefers_smallest_then_lowest() {
        let a = pool();
        let x = a.allocate(4 * P).unwrap();
        let _y = a.allocate(P).unwrap();
        let z = a.allocate(2 * P).unwrap();
        let _w = a.allocate(P).unwrap();
        a.release(x, 4 * P);
        a.release(z, 2 * P);

        // 2-page hole at z is the tightest fit for 2 pages.
        assert_eq!(a.allocate(2 * P).unwrap(), z);
        // Next tightest is x's 4-page hole.
        assert_eq!(a.allocate(P).unwrap(), x);
        a.validate().unwrap();
    }

    #[test]
    fn sizes_round_up_to_pages() {
        let a = pool();
        let x = a.allocate(1).unwrap();
        let y = a.allocate(1).unwrap();
        assert_eq!(y - x, P);
    }

    #[test]
    fn release_coalesces_both_sides() {
        let a = pool();
        let x = a.allocate(P).unwrap();
        let y = a.allocate(P).unwrap();
        let z = a.allocate(P).unwrap();
        a.release(x, P);
        a.release(z, P);
        assert_eq!(a.extents().len(), 2);
        a.release(y, P);
        assert_eq!(a.extents(), vec![(0x10_0000, 64 * P)]);
        a.validate().unwrap();
    }

    #[test]
    fn release_widens_partial_pages() {
        let a = pool();
        let x = a.allocate(2 * P).unwrap();
        a.release(x + 10, P);
        assert_eq!(a.extents(), vec![(x, 64 * P)]);
    }

    #[test]
    fn reserve_punches_a_hole() {
        let a = pool();
        a.reserve(0x10_0000 + 4 * P, 2 * P, true).unwrap();
        assert_eq!(
            a.extents(),
            vec![(0x10_0000, 4 * P), (0x10_0000 + 6 * P, 58 * P)]
        );
        assert_eq!(
            a.reserve(0x10_0000 + 5 * P, P, true),
            Err(LinearAllocError::NotFree {
                base: 0x10_0000 + 5 * P,
                size: P
            })
        );
        a.validate().unwrap();
    }

    #[test]
    fn loose_reserve_trims_and_erases() {
        let a = pool();
        let x = a.allocate(2 * P).unwrap();
        let y = a.allocate(2 * P).unwrap();
        let z = a.allocate(2 * P).unwrap();
        a.release(x, 2 * P);
        a.release(z, 2 * P);
        // Spans the tail of x's hole, y (in use) and into z's hole.
        a.reserve(x + P, 4 * P, false).unwrap();
        let _ = y;
        assert_eq!(a.extents(), vec![(x, P), (z + P, 59 * P)]);
        a.validate().unwrap();
    }

    #[test]
    fn exhaustion_is_an_error() {
        let a = pool();
        assert_eq!(a.allocate(65 * P), Err(LinearAllocError::Exhausted));
        assert_eq!(a.allocate(0), Err(LinearAllocError::ZeroSize));
    }

    #[test]
    fn bump_before_init_then_superseded() {
        let a = LinearAllocator::with_early_range("early", 0x20_0000, 0x20_0000 + 16 * P);
        let first = a.allocate(P).unwrap();
        let second = a.allocate(2 * P).unwrap();
        assert_eq!(first, 0x20_0000);
        assert_eq!(second, 0x20_0000 + P);
        a.release(first, P);
        assert!(a.extents().is_empty());

        a.init(0x20_0000, 16 * P);
        assert_eq!(a.extents(), vec![(0x20_0000 + 3 * P, 13 * P)]);
        assert_eq!(a.allocate(P).unwrap(), 0x20_0000 + 3 * P);
    }

    #[test]
    fn double_release_changes_nothing() {
        let a = pool();
        let x = a.allocate(P).unwrap();
        a.release(x, P);
        a.release(x, P);
        assert_eq!(a.extents(), vec![(0x10_0000, 64 * P)]);
        a.validate().unwrap();
    }

    #[test]
    fn release_across_a_hole_returns_every_page() {
        let a = pool();
        let x = a.allocate(3 * P).unwrap();
        let _pin = a.allocate(P).unwrap();
        a.release(x + P, P);
        assert_eq!(a.free_bytes(), 61 * P);

        a.release(x, 3 * P);
        assert_eq!(a.free_bytes(), 63 * P);
        assert_eq!(a.extents(), vec![(x, 3 * P), (x + 4 * P, 60 * P)]);
        a.validate().unwrap();
    }

    #[test]
    fn failed_bump_does_not_advance() {
        let a = LinearAllocator::with_early_range("early", 0x20_0000, 0x20_0000 + 4 * P);
        assert_eq!(a.allocate(P).unwrap(), 0x20_0000);
        assert_eq!(a.allocate(8 * P), Err(LinearAllocError::Exhausted));
        assert_eq!(a.allocate(P).unwrap(), 0x20_0000 + P);

        a.init(0x20_0000, 4 * P);
        assert_eq!(a.extents(), vec![(0x20_0000 + 2 * P, 2 * P)]);
        assert_eq!(a.allocate(P).unwrap(), 0x20_0000 + 2 * P);
    }

    #[test]
    fn fully_used_early_range_leaves_nothing_free() {
        let a = LinearAllocator::with_early_range("early", 0x20_0000, 0x20_0000 + 4 * P);
        assert_eq!(a.allocate(4 * P).unwrap(), 0x20_0000);
        assert_eq!(a.allocate(P), Err(LinearAllocError::Exhausted));

        a.init(0x20_0000, 4 * P);
        assert!(a.extents().is_empty());
        assert_eq!(a.allocate(P), Err(LinearAllocError::Exhausted));
    }

    #[test]
    fn early_range_inside_a_larger_pool() {
        let a = LinearAllocator::with_early_range("early", 0x20_0000 + 2 * P, 0x20_0000 + 6 * P);
        a.allocate(P).unwrap();
        a.init(0x20_0000, 16 * P);
        assert_eq!(
            a.extents(),
            vec![(0x20_0000, 2 * P), (0x20_0000 + 3 * P, 13 * P)]
        );
    }
}
