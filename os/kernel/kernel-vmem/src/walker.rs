use crate::{PageTable, Pte, PteCell};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Number of paging levels.
pub const LEVELS: usize = 4;

/// Level names as used in diagnostics, top-level first.
pub const LEVEL_NAMES: [&str; LEVELS] = ["PML4", "PDPT", "PD", "PTE"];

/// Leaf level index.
pub const LEAF: usize = LEVELS - 1;

/// Mask returned by [`PtePath::present_mask`] when every level is present.
pub const ALL_PRESENT: u8 = 0b1111;

/// Mask for "page table exists, leaf not present".
pub const TABLES_PRESENT: u8 = 0b0111;

/// Locates the page-table tables that translate an address.
///
/// Implementations differ only in how they reach a table: through the
/// recursive slot of the live directory or through a physical mapper.
pub trait TableWalker {
    /// The table holding the `level` entry for `va`, if every level above
    /// is present and not a large page.
    ///
    /// `root` names the directory to walk; the recursive walker can only
    /// walk the live one and ignores it.
    fn table(&self, root: PhysicalAddress, level: usize, va: VirtualAddress)
    -> Option<&PageTable>;

    /// The four entry slots for `va`.
    fn locate(&self, root: PhysicalAddress, va: VirtualAddress) -> PtePath<'_> {
        let mut slots = [None; LEVELS];
        for (level, slot) in slots.iter_mut().enumerate() {
            match self.table(root, level, va) {
                Some(table) => *slot = Some(table.entry(va.table_index(level))),
                None => break,
            }
        }
        PtePath { va, slots }
    }
}

/// The entry slots for one address, top-level first.
///
/// A slot is `None` when a level above it is absent, which is exactly the
/// case in which the hardware would never read it.
pub struct PtePath<'a> {
    va: VirtualAddress,
    slots: [Option<&'a PteCell>; LEVELS],
}

impl<'a> PtePath<'a> {
    #[must_use]
    pub const fn address(&self) -> VirtualAddress {
        self.va
    }

    #[must_use]
    pub const fn slot(&self, level: usize) -> Option<&'a PteCell> {
        self.slots[level]
    }

    #[must_use]
    pub const fn leaf(&self) -> Option<&'a PteCell> {
        self.slots[LEAF]
    }

    /// Current values, `None` for unreachable levels.
    #[must_use]
    pub fn snapshot(&self) -> [Option<Pte>; LEVELS] {
        self.slots.map(|s| s.map(PteCell::load))
    }

    /// Bit `i` set iff level `i` is present; level `i + 1` is only
    /// considered when level `i` is present and is not a large page.
    #[must_use]
    pub fn present_mask(&self) -> u8 {
        present_mask(&self.snapshot())
    }
}

/// See [`PtePath::present_mask`].
#[must_use]
pub fn present_mask(entries: &[Option<Pte>; LEVELS]) -> u8 {
    let mut mask = 0;
    for (level, entry) in entries.iter().enumerate() {
        match entry {
            Some(pte) if pte.present() => {
                mask |= 1 << level;
                if level > 0 && level < LEAF && pte.page_size() {
                    break;
                }
            }
            _ => break,
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present() -> Option<Pte> {
        Some(Pte::new().with_present(true))
    }

    #[test]
    fn mask_short_circuits() {
        assert_eq!(present_mask(&[None; 4]), 0);
        assert_eq!(
            present_mask(&[present(), present(), present(), present()]),
            ALL_PRESENT
        );
        assert_eq!(
            present_mask(&[present(), present(), present(), Some(Pte::new())]),
            TABLES_PRESENT
        );
        // A stale present bit below an absent level is ignored.
        assert_eq!(
            present_mask(&[present(), Some(Pte::new()), present(), present()]),
            0b0001
        );
    }

    #[test]
    fn large_page_stops_the_walk() {
        let large = Some(Pte::new().with_present(true).with_page_size(true));
        assert_eq!(
            present_mask(&[present(), large, present(), present()]),
            0b0011
        );
    }
}
