use crate::Pte;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::ENTRIES_PER_TABLE;

/// One page-table slot, updated atomically.
///
/// Other CPUs (and the MMU itself, for accessed/dirty) write these words
/// concurrently, so every read-modify-write goes through an atomic.
#[repr(transparent)]
pub struct PteCell(AtomicU64);

impl PteCell {
    #[must_use]
    pub const fn new(pte: Pte) -> Self {
        Self(AtomicU64::new(pte.into_bits()))
    }

    #[inline]
    pub fn load(&self) -> Pte {
        Pte::from_bits(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, pte: Pte) {
        self.0.store(pte.into_bits(), Ordering::Release);
    }

    #[inline]
    pub fn swap(&self, pte: Pte) -> Pte {
        Pte::from_bits(self.0.swap(pte.into_bits(), Ordering::AcqRel))
    }

    /// Replace `current` with `new`; on failure returns the value found.
    #[inline]
    pub fn compare_exchange(&self, current: Pte, new: Pte) -> Result<Pte, Pte> {
        self.0
            .compare_exchange(
                current.into_bits(),
                new.into_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(Pte::from_bits)
            .map_err(Pte::from_bits)
    }

    #[inline]
    pub fn fetch_or(&self, bits: Pte) -> Pte {
        Pte::from_bits(self.0.fetch_or(bits.into_bits(), Ordering::AcqRel))
    }

    /// Retry `f` on the current value until the exchange sticks.
    ///
    /// `f` returning `None` abandons the update; the current value is
    /// returned as the error.
    pub fn update(&self, mut f: impl FnMut(Pte) -> Option<Pte>) -> Result<Pte, Pte> {
        let mut current = self.load();
        loop {
            let Some(next) = f(current) else {
                return Err(current);
            };
            match self.compare_exchange(current, next) {
                Ok(old) => return Ok(old),
                Err(seen) => {
                    current = seen;
                    core::hint::spin_loop();
                }
            }
        }
    }
}

/// A 4 KiB table of 512 entries, any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PteCell; ENTRIES_PER_TABLE],
}

impl PageTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [const { PteCell::new(Pte::new()) }; ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub fn entry(&self, index: usize) -> &PteCell {
        &self.entries[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Pte)> + '_ {
        self.entries.iter().map(PteCell::load).enumerate()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
};

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn cas_reports_the_winner() {
        let cell = PteCell::new(Pte::new().with_frame(Pte::DEMAND_FRAME));
        let demand = cell.load();
        let first = demand
            .with_present(true)
            .with_address(PhysicalAddress::new(0x1000));
        let second = demand
            .with_present(true)
            .with_address(PhysicalAddress::new(0x2000));

        assert_eq!(cell.compare_exchange(demand, first), Ok(demand));
        assert_eq!(cell.compare_exchange(demand, second), Err(first));
        assert_eq!(cell.load().address().as_u64(), 0x1000);
    }

    #[test]
    fn update_can_abandon() {
        let cell = PteCell::new(Pte::new());
        assert!(cell.update(|p| p.present().then_some(p)).is_err());
        let old = cell.update(|p| Some(p.with_writable(true))).unwrap();
        assert_eq!(old, Pte::new());
        assert!(cell.load().writable());
    }

    #[test]
    fn table_is_one_page() {
        let t = PageTable::new();
        assert_eq!(t.iter().filter(|(_, e)| e.present()).count(), 0);
        t.entry(511).fetch_or(Pte::new().with_present(true));
        assert!(t.entry(511).load().present());
    }
}
