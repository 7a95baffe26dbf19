use crate::device::DeviceRegistry;
use crate::platform::Platform;
use crate::shootdown::Shootdown;
use crate::MmError;
use core::sync::atomic::AtomicU32;
use kernel_alloc::memory_map::{carve_top, normalize};
use kernel_alloc::{FrameAllocator, LinearAllocator};
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{
    CONTIGUOUS_POOL_SIZE, KERNEL_POOL_BASE, KERNEL_POOL_END, NEAR_POOL_BASE, NEAR_POOL_END,
    RECURSIVE_SLOT, USER_POOL_END,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{LEAF, PhysMapper, Pte, PteCell, PtePath, TableWalker};

const FOUR_GIB: u64 = 1 << 32;

/// Boot-time inputs of [`MemoryManager::new`].
#[derive(Debug, Copy, Clone)]
pub struct MemoryManagerConfig<'a> {
    /// Firmware memory map. Must not list the master directory frame as
    /// usable.
    pub memory_map: &'a [MemoryRegion],
    /// The boot page directory; becomes the master copy of the kernel half.
    pub master_directory: PhysicalAddress,
    /// Set aside [`CONTIGUOUS_POOL_SIZE`] bytes below 4 GiB for
    /// [`MemoryManager::alloc_contiguous`].
    pub reserve_contiguous_pool: bool,
}

/// The address-space pool a linear address belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Pool {
    Kernel,
    Near,
    User,
}

impl Pool {
    pub(crate) fn of(va: VirtualAddress) -> Option<Self> {
        match va.as_u64() {
            a if a < USER_POOL_END => Some(Self::User),
            a if (KERNEL_POOL_BASE..KERNEL_POOL_END).contains(&a) => Some(Self::Kernel),
            a if (NEAR_POOL_BASE..NEAR_POOL_END).contains(&a) => Some(Self::Near),
            _ => None,
        }
    }
}

/// Virtual memory manager for all CPUs.
///
/// `P` supplies the CPU-local MMU controls and the other subsystems,
/// `M` reaches physical memory, and `W` finds page-table entries of the live
/// address space.
pub struct MemoryManager<P, M, W> {
    pub(crate) platform: P,
    pub(crate) mapper: M,
    pub(crate) walker: W,
    pub(crate) frames: FrameAllocator,
    pub(crate) kernel_pool: LinearAllocator,
    pub(crate) near_pool: LinearAllocator,
    pub(crate) contiguous: LinearAllocator,
    pub(crate) master: PhysicalAddress,
    pub(crate) shootdown: Shootdown,
    pub(crate) devices: DeviceRegistry,
}

impl<P: Platform, M: PhysMapper, W: TableWalker> MemoryManager<P, M, W> {
    /// Take over physical memory and the boot directory.
    ///
    /// The kernel and near pools start out as bump allocators; call
    /// [`Self::init_address_pools`] once the heap can hold their indexes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(
        platform: P,
        mapper: M,
        walker: W,
        config: &MemoryManagerConfig<'_>,
    ) -> Result<Self, MmError> {
        let mut ranges = normalize(config.memory_map);

        let contiguous = LinearAllocator::new("contiguous");
        if config.reserve_contiguous_pool {
            let base = carve_top(&mut ranges, CONTIGUOUS_POOL_SIZE, CONTIGUOUS_POOL_SIZE, FOUR_GIB)
                .ok_or(MmError::OutOfMemory)?;
            contiguous.init(base, CONTIGUOUS_POOL_SIZE);
        }

        let slots = FrameAllocator::side_array_len(&ranges);
        let bytes = (slots * size_of::<AtomicU32>()) as u64;
        let side = carve_top(&mut ranges, bytes, PAGE_SIZE, u64::MAX).ok_or(MmError::OutOfMemory)?;
        // SAFETY: the side array was just carved out of usable memory and is
        // never handed to the frame allocator.
        let next: &'static [AtomicU32] = unsafe {
            let ptr = mapper.phys_to_ptr(PhysicalAddress::new(side));
            ptr.write_bytes(0, bytes as usize);
            core::slice::from_raw_parts(ptr.cast::<AtomicU32>(), slots)
        };
        let frames = FrameAllocator::new(&ranges, next);

        let master = config.master_directory;
        // SAFETY: the boot directory stays mapped for the kernel's lifetime.
        unsafe { mapper.table(master) }
            .entry(RECURSIVE_SLOT)
            .store(table_entry(master, false));

        log::info!(
            "vmm: {} of {} frames free, {} KiB side array at {side:#x}",
            frames.free_count(),
            frames.total_frames(),
            bytes >> 10
        );

        Ok(Self {
            platform,
            mapper,
            walker,
            frames,
            kernel_pool: LinearAllocator::with_early_range("kernel", KERNEL_POOL_BASE, KERNEL_POOL_END),
            near_pool: LinearAllocator::with_early_range("near", NEAR_POOL_BASE, NEAR_POOL_END),
            contiguous,
            master,
            shootdown: Shootdown::new(),
            devices: DeviceRegistry::new(),
        })
    }

    /// Switch the kernel and near pools from bump allocation to reusable
    /// free lists. Needs a working heap.
    pub fn init_address_pools(&self) {
        self.kernel_pool
            .init(KERNEL_POOL_BASE, KERNEL_POOL_END - KERNEL_POOL_BASE);
        self.near_pool.init(NEAR_POOL_BASE, NEAR_POOL_END - NEAR_POOL_BASE);
    }

    pub const fn platform(&self) -> &P {
        &self.platform
    }

    pub const fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub const fn kernel_pool(&self) -> &LinearAllocator {
        &self.kernel_pool
    }

    pub const fn near_pool(&self) -> &LinearAllocator {
        &self.near_pool
    }

    pub const fn master_directory(&self) -> PhysicalAddress {
        self.master
    }

    pub(crate) fn locate(&self, va: VirtualAddress) -> PtePath<'_> {
        self.walker.locate(self.platform.page_directory(), va)
    }

    pub(crate) fn leaf(&self, va: VirtualAddress) -> Option<&PteCell> {
        self.locate(va).leaf()
    }

    /// A frame from the allocator, zero-filled unless `zero` is false.
    pub(crate) fn alloc_frame(&self, low_only: bool, zero: bool) -> Option<PhysicalAddress> {
        let frame = self.frames.alloc(low_only)?;
        if zero {
            // SAFETY: the frame was just allocated and is not mapped anywhere.
            unsafe { self.mapper.zero_frame(frame) };
        }
        Some(frame)
    }

    /// Slot `index` of the master directory.
    pub(crate) fn master_slot(&self, index: usize) -> &PteCell {
        // SAFETY: the master directory lives as long as the manager.
        unsafe { self.mapper.table(self.master) }.entry(index)
    }

    /// Leaf slot for `va` in the live address space, creating the tables
    /// above it as needed.
    ///
    /// Top-level entries of the kernel half are created in the master
    /// directory first and then copied into the live one.
    pub(crate) fn ensure_leaf(&self, va: VirtualAddress) -> Result<&PteCell, MmError> {
        let root = self.platform.page_directory();
        for level in 0..LEAF {
            let slot = self
                .walker
                .locate(root, va)
                .slot(level)
                .ok_or(MmError::BadAddress(va))?;
            let entry = slot.load();
            if entry.present() {
                if level > 0 && entry.page_size() {
                    return Err(MmError::AddressInUse);
                }
                continue;
            }

            if level == 0 && va.is_kernel_half() {
                let shared = self.ensure_master_entry(va.table_index(0))?;
                if root != self.master {
                    let _ = slot.compare_exchange(entry, shared);
                }
                continue;
            }

            let frame = self.alloc_frame(false, true).ok_or(MmError::OutOfMemory)?;
            if slot
                .compare_exchange(entry, table_entry(frame, !va.is_kernel_half()))
                .is_err()
            {
                self.frames.free(frame);
            }
        }

        self.walker
            .locate(root, va)
            .leaf()
            .ok_or(MmError::BadAddress(va))
    }

    fn ensure_master_entry(&self, index: usize) -> Result<Pte, MmError> {
        let slot = self.master_slot(index);
        let entry = slot.load();
        if entry.present() {
            return Ok(entry);
        }

        let frame = self.alloc_frame(false, true).ok_or(MmError::OutOfMemory)?;
        let table = table_entry(frame, false);
        match slot.compare_exchange(entry, table) {
            Ok(_) => {
                log::debug!("vmm: kernel slot {index} -> {frame}");
                Ok(table)
            }
            Err(winner) => {
                self.frames.free(frame);
                Ok(winner)
            }
        }
    }

    /// Run `f` on the pool `pool`.
    pub(crate) fn with_pool<R>(
        &self,
        pool: Pool,
        f: impl FnOnce(&LinearAllocator) -> R,
    ) -> Result<R, MmError> {
        match pool {
            Pool::Kernel => Ok(f(&self.kernel_pool)),
            Pool::Near => Ok(f(&self.near_pool)),
            Pool::User => self
                .platform
                .with_current_process(|process| f(process.pool()))
                .ok_or(MmError::NoProcess),
        }
    }
}

/// Entry pointing at a page table.
pub(crate) const fn table_entry(frame: PhysicalAddress, user: bool) -> Pte {
    Pte::new()
        .with_present(true)
        .with_writable(true)
        .with_user(user)
        .with_accessed(true)
        .with_dirty(true)
        .with_address(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pools_by_address() {
        assert_eq!(Pool::of(VirtualAddress::new(0x40_0000)), Some(Pool::User));
        assert_eq!(Pool::of(VirtualAddress::new(KERNEL_POOL_BASE)), Some(Pool::Kernel));
        assert_eq!(Pool::of(VirtualAddress::new(NEAR_POOL_BASE + 0x1000)), Some(Pool::Near));
        assert_eq!(Pool::of(VirtualAddress::new(0xFFFF_8000_0000_0000)), None);
    }

    #[test]
    fn table_entries_are_writable() {
        let e = table_entry(PhysicalAddress::new(0x5000), true);
        assert!(e.present() && e.writable() && e.user());
        assert_eq!(e.address(), PhysicalAddress::new(0x5000));
    }
}
