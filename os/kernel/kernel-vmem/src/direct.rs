use crate::{PageTable, PhysMapper, TableWalker};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Walks any directory by following physical addresses through a
/// [`PhysMapper`].
pub struct DirectWalker<M> {
    mapper: M,
}

impl<M: PhysMapper> DirectWalker<M> {
    pub const fn new(mapper: M) -> Self {
        Self { mapper }
    }

    pub const fn mapper(&self) -> &M {
        &self.mapper
    }
}

impl<M: PhysMapper> TableWalker for DirectWalker<M> {
    fn table(
        &self,
        root: PhysicalAddress,
        level: usize,
        va: VirtualAddress,
    ) -> Option<&PageTable> {
        // Safety: the root and every present intermediate entry name tables.
        let mut table = unsafe { self.mapper.table(root) };
        for l in 0..level {
            let entry = table.entry(va.table_index(l)).load();
            if !entry.present() || (l > 0 && entry.page_size()) {
                return None;
            }
            table = unsafe { self.mapper.table(entry.address()) };
        }
        Some(table)
    }
}
