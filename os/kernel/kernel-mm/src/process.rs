//! Per-process address spaces.

use crate::manager::table_entry;
use crate::platform::Platform;
use crate::{MemoryManager, MmError};
use kernel_alloc::{FreeBatch, LinearAllocator};
use kernel_info::memory::{KERNEL_HALF_FIRST_SLOT, RECURSIVE_SLOT, USER_POOL_BASE, USER_POOL_END};
use kernel_memory_addresses::{ENTRIES_PER_TABLE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{LEAF, PhysMapper, Pte, TableWalker};

/// Page directory and user address pool of one process.
pub struct ProcessAddressSpace {
    directory: PhysicalAddress,
    pool: LinearAllocator,
}

impl ProcessAddressSpace {
    pub const fn directory(&self) -> PhysicalAddress {
        self.directory
    }

    /// Where user mappings of this process get their addresses.
    pub const fn pool(&self) -> &LinearAllocator {
        &self.pool
    }
}

impl core::fmt::Debug for ProcessAddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessAddressSpace")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl<P: Platform, M: PhysMapper, W: TableWalker> MemoryManager<P, M, W> {
    /// Build a fresh address space and make it the live one.
    ///
    /// The user half starts empty. The kernel half shares the master's
    /// top-level entries, except the self-map slot, which points at the new
    /// directory.
    pub fn create_process_address_space(&self) -> Result<ProcessAddressSpace, MmError> {
        let directory = self.alloc_frame(false, true).ok_or(MmError::OutOfMemory)?;

        // SAFETY: `directory` is a fresh frame nobody else references yet.
        let table = unsafe { self.mapper.table(directory) };
        for index in KERNEL_HALF_FIRST_SLOT..ENTRIES_PER_TABLE {
            table.entry(index).store(self.master_slot(index).load());
        }
        table
            .entry(RECURSIVE_SLOT)
            .store(table_entry(directory, false));

        // SAFETY: the kernel half was copied from the master directory.
        unsafe { self.platform.set_page_directory(directory) };

        let pool = LinearAllocator::new("user");
        pool.init(USER_POOL_BASE, USER_POOL_END - USER_POOL_BASE);

        log::debug!("vmm: new address space {directory}");
        Ok(ProcessAddressSpace { directory, pool })
    }

    /// Tear down `space`, which must be the live address space, and switch
    /// back to the master directory.
    ///
    /// Every frame owned by the user half is freed, leaves first, then the
    /// tables that held them.
    pub fn destroy_process_address_space(&self, space: ProcessAddressSpace) -> Result<(), MmError> {
        let root = self.platform.page_directory();
        if root != space.directory {
            return Err(MmError::NotActive);
        }

        let mut batch = self.frames.batch();
        let freed = self.release_subtree(root, 0, [0; 4], &mut batch);
        drop(batch);

        // SAFETY: the master directory maps the whole kernel.
        unsafe { self.platform.set_page_directory(self.master) };
        self.platform.flush_local_tlb();
        self.frames.free(space.directory);

        log::debug!(
            "vmm: destroyed address space {}, {} frames returned",
            space.directory,
            freed + 1
        );
        Ok(())
    }

    /// Clear the user-half subtree below the table at `level` reached
    /// through `prefix`, freeing owned leaf frames and then the tables
    /// themselves. Returns the number of frames freed.
    fn release_subtree(
        &self,
        root: PhysicalAddress,
        level: usize,
        prefix: [usize; 4],
        batch: &mut FreeBatch<'_>,
    ) -> u64 {
        let Some(table) = self
            .walker
            .table(root, level, VirtualAddress::from_indices(prefix, 0))
        else {
            return 0;
        };
        let slots = if level == 0 {
            0..KERNEL_HALF_FIRST_SLOT
        } else {
            0..ENTRIES_PER_TABLE
        };

        let mut freed = 0;
        for index in slots {
            let entry = table.entry(index);
            let pte = entry.load();
            if pte.into_bits() == 0 {
                continue;
            }
            if level == LEAF {
                if pte.owns_frame() {
                    batch.free(pte.address());
                    freed += 1;
                }
                entry.store(Pte::new());
                continue;
            }
            if !pte.present() {
                continue;
            }
            if level > 0 && pte.page_size() {
                entry.store(Pte::new());
                continue;
            }

            let mut child = prefix;
            child[level] = index;
            freed += self.release_subtree(root, level + 1, child, batch);
            entry.store(Pte::new());
            batch.free(pte.address());
            freed += 1;
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_the_pool() {
        let space = ProcessAddressSpace {
            directory: PhysicalAddress::new(0x7000),
            pool: LinearAllocator::new("user"),
        };
        assert_eq!(
            format!("{space:?}"),
            "ProcessAddressSpace { directory: PA(0x0000000000007000), .. }"
        );
    }
}
