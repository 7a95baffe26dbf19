//! Lock-free physical frame allocator.
//!
//! Free frames are threaded into singly linked chains that live in a side
//! array: slot `i` holds the index of the frame after frame `i`. Each chain
//! head is one atomic word packing `(generation << 32) | index`; every
//! successful exchange bumps the generation so a pop that read a stale head
//! cannot succeed after the same index was popped and pushed back (ABA).
//!
//! Frames below 4 GiB and frames above it live on separate chains so that
//! 32-bit DMA users can still be served after the rest of memory is gone.

use crate::memory_map::PhysicalRange;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use kernel_vmem::Pte;

const EMPTY: u32 = u32::MAX;
const BATCH: usize = 16;

#[inline]
const fn pack(index: u32, generation: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

#[allow(clippy::cast_possible_truncation)]
#[inline]
const fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

/// One free chain.
struct Chain {
    head: AtomicU64,
}

impl Chain {
    const fn new() -> Self {
        Self {
            head: AtomicU64::new(pack(EMPTY, 0)),
        }
    }

    fn is_empty(&self) -> bool {
        unpack(self.head.load(Ordering::Acquire)).0 == EMPTY
    }
}

/// Physical frame allocator over two lock-free chains.
pub struct FrameAllocator {
    /// Physical address of side-array slot 0.
    base: u64,
    next: &'static [AtomicU32],
    low: Chain,
    high: Chain,
    free: AtomicU64,
    total: u64,
}

impl FrameAllocator {
    /// Number of side-array slots needed to cover `ranges`.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn side_array_len(ranges: &[PhysicalRange]) -> usize {
        match (ranges.first(), ranges.last()) {
            (Some(first), Some(last)) => ((last.end - first.base) >> PAGE_SHIFT) as usize,
            _ => 0,
        }
    }

    /// Build the chains from normalized ranges (sorted, page aligned,
    /// disjoint). `next` must have at least [`Self::side_array_len`] slots.
    #[must_use]
    pub fn new(ranges: &[PhysicalRange], next: &'static [AtomicU32]) -> Self {
        let base = ranges.first().map_or(0, |r| r.base);
        assert!(
            next.len() >= Self::side_array_len(ranges),
            "frame side array too small"
        );

        let this = Self {
            base,
            next,
            low: Chain::new(),
            high: Chain::new(),
            free: AtomicU64::new(0),
            total: ranges.iter().map(PhysicalRange::pages).sum(),
        };

        // Push from the top down so the chains hand out ascending addresses.
        for range in ranges.iter().rev() {
            let mut pa = range.end;
            while pa > range.base {
                pa -= PAGE_SIZE;
                this.push(this.index_of(pa), pa);
            }
        }

        log::info!(
            "frame allocator: {} frames ({} MiB) from {} ranges",
            this.total,
            (this.total * PAGE_SIZE) >> 20,
            ranges.len()
        );
        this
    }

    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    fn index_of(&self, pa: u64) -> u32 {
        ((pa - self.base) >> PAGE_SHIFT) as u32
    }

    #[inline]
    fn address_of(&self, index: u32) -> u64 {
        self.base + (u64::from(index) << PAGE_SHIFT)
    }

    #[inline]
    const fn chain_for(&self, pa: u64) -> &Chain {
        if PhysicalAddress::new(pa).is_below_4g() {
            &self.low
        } else {
            &self.high
        }
    }

    /// Take one frame. High memory is preferred unless `low_only` is set;
    /// when it runs dry the low chain is used.
    pub fn alloc(&self, low_only: bool) -> Option<PhysicalAddress> {
        if !low_only && let Some(pa) = self.pop(&self.high) {
            return Some(pa);
        }
        self.pop(&self.low)
    }

    fn pop(&self, chain: &Chain) -> Option<PhysicalAddress> {
        let mut current = chain.head.load(Ordering::Acquire);
        loop {
            let (index, generation) = unpack(current);
            if index == EMPTY {
                return None;
            }

            let next = self.next[index as usize].load(Ordering::Relaxed);
            let replacement = pack(next, generation.wrapping_add(1));
            match chain.head.compare_exchange_weak(
                current,
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.next[index as usize].store(0, Ordering::Relaxed);
                    self.free.fetch_sub(1, Ordering::Relaxed);
                    return Some(PhysicalAddress::new(self.address_of(index)));
                }
                Err(seen) => {
                    current = seen;
                    spin_loop();
                }
            }
        }
    }

    /// Return a frame. Zero and the demand sentinel are ignored so callers
    /// can pass the address field of any PTE.
    pub fn free(&self, pa: PhysicalAddress) {
        let raw = pa.as_u64();
        if raw == 0 || raw == Pte::ADDR_MASK {
            return;
        }
        if !self.manages(pa) {
            log::warn!("freeing unmanaged frame {pa}");
            debug_assert!(false, "freeing unmanaged frame {pa}");
            return;
        }
        self.push(self.index_of(raw), raw);
    }

    fn push(&self, index: u32, pa: u64) {
        self.push_list(self.chain_for(pa), index, index, 1);
    }

    /// Splice the pre-linked list `first ..= last` onto `chain`.
    ///
    /// The count goes up before the frames become poppable, so a racing
    /// `pop` can never take it below zero.
    fn push_list(&self, chain: &Chain, first: u32, last: u32, count: u64) {
        self.free.fetch_add(count, Ordering::Relaxed);
        let mut current = chain.head.load(Ordering::Acquire);
        loop {
            let (head, generation) = unpack(current);
            self.next[last as usize].store(head, Ordering::Relaxed);
            match chain.head.compare_exchange_weak(
                current,
                pack(first, generation.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => {
                    current = seen;
                    spin_loop();
                }
            }
        }
    }

    #[must_use]
    pub fn manages(&self, pa: PhysicalAddress) -> bool {
        let raw = pa.as_u64();
        raw >= self.base && ((raw - self.base) >> PAGE_SHIFT) < self.next.len() as u64
    }

    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.free.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn low_exhausted(&self) -> bool {
        self.low.is_empty()
    }

    /// Start a batch of frees that are pushed with one exchange per chain.
    #[must_use]
    pub const fn batch(&self) -> FreeBatch<'_> {
        FreeBatch {
            allocator: self,
            low: Pending::new(),
            high: Pending::new(),
        }
    }
}

struct Pending {
    indices: [u32; BATCH],
    len: usize,
}

impl Pending {
    const fn new() -> Self {
        Self {
            indices: [0; BATCH],
            len: 0,
        }
    }
}

/// Buffers frees and pushes them in groups; flushed on drop.
pub struct FreeBatch<'a> {
    allocator: &'a FrameAllocator,
    low: Pending,
    high: Pending,
}

impl FreeBatch<'_> {
    pub fn free(&mut self, pa: PhysicalAddress) {
        let raw = pa.as_u64();
        if raw == 0 || raw == Pte::ADDR_MASK {
            return;
        }
        if !self.allocator.manages(pa) {
            self.allocator.free(pa);
            return;
        }

        let index = self.allocator.index_of(raw);
        let low = pa.is_below_4g();
        let pending = if low { &mut self.low } else { &mut self.high };
        pending.indices[pending.len] = index;
        pending.len += 1;
        if pending.len == BATCH {
            self.flush_one(low);
        }
    }

    fn flush_one(&mut self, low: bool) {
        let (pending, chain) = if low {
            (&mut self.low, &self.allocator.low)
        } else {
            (&mut self.high, &self.allocator.high)
        };
        let items = &pending.indices[..pending.len];
        if let (Some(&first), Some(&last)) = (items.first(), items.last()) {
            for pair in items.windows(2) {
                self.allocator.next[pair[0] as usize].store(pair[1], Ordering::Relaxed);
            }
            self.allocator
                .push_list(chain, first, last, items.len() as u64);
        }
        pending.len = 0;
    }

    pub fn flush(&mut self) {
        self.flush_one(true);
        self.flush_one(false);
    }
}

impl Drop for FreeBatch<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(ranges: &[PhysicalRange]) -> FrameAllocator {
        let slots: Vec<AtomicU32> = (0..FrameAllocator::side_array_len(ranges))
            .map(|_| AtomicU32::new(0))
            .collect();
        FrameAllocator::new(ranges, Box::leak(slots.into_boxed_slice()))
    }

    #[test]
    fn ascending_order_and_exhaustion() {
        let fa = allocator(&[PhysicalRange::new(0x10_0000, 0x10_3000)]);
        assert_eq!(fa.free_count(), 3);
        assert_eq!(fa.alloc(false).unwrap().as_u64(), 0x10_0000);
        assert_eq!(fa.alloc(false).unwrap().as_u64(), 0x10_1000);
        assert_eq!(fa.alloc(true).unwrap().as_u64(), 0x10_2000);
        assert!(fa.alloc(false).is_none());
        assert_eq!(fa.free_count(), 0);
    }

    #[test]
    fn high_first_then_fallback_to_low() {
        let fa = allocator(&[
            PhysicalRange::new(0x10_0000, 0x10_1000),
            PhysicalRange::new(0x1_0000_0000, 0x1_0000_1000),
        ]);
        assert_eq!(fa.alloc(false).unwrap().as_u64(), 0x1_0000_0000);
        assert_eq!(fa.alloc(false).unwrap().as_u64(), 0x10_0000);
        assert!(fa.alloc(false).is_none());
    }

    #[test]
    fn low_only_never_returns_high_memory() {
        let fa = allocator(&[
            PhysicalRange::new(0x10_0000, 0x10_1000),
            PhysicalRange::new(0x1_0000_0000, 0x1_0000_4000),
        ]);
        assert!(fa.alloc(true).unwrap().is_below_4g());
        assert!(fa.alloc(true).is_none());
        assert!(fa.low_exhausted());
        assert_eq!(fa.free_count(), 4);
    }

    #[test]
    fn free_ignores_sentinels_and_recycles() {
        let fa = allocator(&[PhysicalRange::new(0x20_0000, 0x20_2000)]);
        let a = fa.alloc(false).unwrap();
        fa.free(PhysicalAddress::zero());
        fa.free(PhysicalAddress::new(Pte::ADDR_MASK));
        assert_eq!(fa.free_count(), 1);
        fa.free(a);
        assert_eq!(fa.free_count(), 2);
        assert_eq!(fa.alloc(false), Some(a));
    }

    #[test]
    fn batch_frees_split_by_chain() {
        let fa = allocator(&[
            PhysicalRange::new(0x10_0000, 0x10_0000 + 20 * 4096),
            PhysicalRange::new(0x1_0000_0000, 0x1_0000_0000 + 20 * 4096),
        ]);
        let taken: Vec<_> = (0..40).map(|_| fa.alloc(false).unwrap()).collect();
        assert_eq!(fa.free_count(), 0);
        {
            let mut batch = fa.batch();
            for pa in &taken {
                batch.free(*pa);
            }
        }
        assert_eq!(fa.free_count(), 40);
        let mut again: Vec<_> = (0..40).map(|_| fa.alloc(false).unwrap()).collect();
        again.sort();
        let mut expected = taken;
        expected.sort();
        assert_eq!(again, expected);
    }
}
