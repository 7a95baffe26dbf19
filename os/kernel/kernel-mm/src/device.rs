//! Lazily populated device mappings.
//!
//! A device mapping reserves address space whose pages stay not-present
//! until touched. The first fault in a 64 KiB block commits frames for the
//! whole block, asks the device to fill them, and only then makes the pages
//! present. Concurrent faults on the same mapping wait for that to finish.

use crate::error::FatalReason;
use crate::fault::FaultResolution;
use crate::platform::Platform;
use crate::{DeviceIoError, MapFlags, MemoryManager, MmError, Prot};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_info::memory::{DEVICE_BLOCK_SIZE, MM_MAX_DEVICE_MAPPINGS};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down};
use kernel_sync::{Condvar, SpinLock};
use kernel_vmem::{PhysMapper, Pte, TableWalker};

/// One block of a device mapping, handed to the device.
#[derive(Debug)]
pub struct DeviceBlock<'a> {
    /// First linear address of the block.
    pub address: VirtualAddress,
    /// Byte offset of the block within the mapping.
    pub offset: u64,
    /// Backing frames, one per page, in address order.
    pub frames: &'a [PhysicalAddress],
}

impl DeviceBlock<'_> {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.frames.len() as u64 * PAGE_SIZE
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Storage behind a device mapping.
pub trait DeviceBacking: Send + Sync {
    /// Fill the frames of `block`. They are not yet visible to anyone.
    fn populate(&self, block: &DeviceBlock<'_>) -> Result<(), DeviceIoError>;

    /// Write `block` back to the device.
    fn write_back(&self, block: &DeviceBlock<'_>) -> Result<(), DeviceIoError> {
        let _ = block;
        Ok(())
    }
}

/// A registered device mapping.
pub struct DeviceMapping {
    base: VirtualAddress,
    len: u64,
    block_size: u64,
    backing: Arc<dyn DeviceBacking>,
    /// Offset of the block being populated, if any.
    populating: SpinLock<Option<u64>>,
    done: Condvar,
}

impl DeviceMapping {
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    pub const fn len(&self) -> u64 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Block size the mapping was registered with.
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    fn contains(&self, va: VirtualAddress) -> bool {
        va >= self.base && va - self.base < self.len
    }

    /// The 64 KiB population block around `va`, clipped to the mapping.
    fn block_around(&self, va: VirtualAddress) -> (VirtualAddress, VirtualAddress) {
        let aligned = VirtualAddress::new(align_down(va.as_u64(), DEVICE_BLOCK_SIZE));
        let start = aligned.max(self.base);
        let end = (aligned + DEVICE_BLOCK_SIZE).min(self.base + self.len);
        (start, end)
    }
}

/// Registered mappings, sorted by base address.
pub(crate) struct DeviceRegistry {
    slots: SpinLock<Slots>,
}

struct Slots {
    entries: [Option<Arc<DeviceMapping>>; MM_MAX_DEVICE_MAPPINGS],
    len: usize,
}

impl Slots {
    fn live(&self) -> &[Option<Arc<DeviceMapping>>] {
        &self.entries[..self.len]
    }

    /// Index of the mapping starting at or below `va`, or where one
    /// starting at `va` would go.
    fn search(&self, va: VirtualAddress) -> Result<usize, usize> {
        self.live()
            .binary_search_by_key(&va, |e| e.as_ref().map_or(VirtualAddress::zero(), |m| m.base))
    }

    fn find(&self, va: VirtualAddress) -> Option<Arc<DeviceMapping>> {
        let index = match self.search(va) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        self.entries[index]
            .as_ref()
            .filter(|m| m.contains(va))
            .cloned()
    }

    /// Whether any mapping intersects `[start, end)`.
    fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.live()
            .iter()
            .flatten()
            .any(|m| m.base < end && start < m.base + m.len)
    }

    fn insert(&mut self, mapping: Arc<DeviceMapping>) -> Result<(), Arc<DeviceMapping>> {
        if self.len == MM_MAX_DEVICE_MAPPINGS {
            return Err(mapping);
        }
        if self.overlaps(mapping.base, mapping.base + mapping.len) {
            return Err(mapping);
        }
        let Err(at) = self.search(mapping.base) else {
            return Err(mapping);
        };
        self.entries[at..=self.len].rotate_right(1);
        self.entries[at] = Some(mapping);
        self.len += 1;
        Ok(())
    }

    fn remove(&mut self, base: VirtualAddress) -> Option<Arc<DeviceMapping>> {
        let at = self.search(base).ok()?;
        let mapping = self.entries[at].take();
        self.entries[at..self.len].rotate_left(1);
        self.len -= 1;
        mapping
    }
}

impl DeviceRegistry {
    pub(crate) const fn new() -> Self {
        Self {
            slots: SpinLock::new(Slots {
                entries: [const { None }; MM_MAX_DEVICE_MAPPINGS],
                len: 0,
            }),
        }
    }

    pub(crate) fn find(&self, va: VirtualAddress) -> Option<Arc<DeviceMapping>> {
        self.slots.lock().find(va)
    }

    pub(crate) fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.slots.lock().overlaps(start, end)
    }

    fn is_full(&self) -> bool {
        self.slots.lock().len == MM_MAX_DEVICE_MAPPINGS
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len
    }
}

impl<P: Platform, M: PhysMapper, W: TableWalker> MemoryManager<P, M, W> {
    /// Reserve `block_size * block_count` bytes of kernel address space
    /// that `backing` fills on first touch.
    pub fn register_device(
        &self,
        backing: Arc<dyn DeviceBacking>,
        block_size: u64,
        block_count: u64,
        prot: Prot,
    ) -> Result<VirtualAddress, MmError> {
        let len = block_size
            .checked_mul(block_count)
            .ok_or(MmError::AddressSpaceExhausted)?;
        if self.devices.is_full() {
            return Err(MmError::RegistryFull);
        }

        let base = self.mmap(0, len, prot, MapFlags::DEVICE, -1, 0)?;
        let mapping = Arc::new(DeviceMapping {
            base,
            len,
            block_size,
            backing,
            populating: SpinLock::new(None),
            done: Condvar::new(),
        });

        if self.devices.slots.lock().insert(mapping).is_err() {
            self.unmap(base, len)?;
            return Err(MmError::RegistryFull);
        }
        log::debug!("vmm: device mapping {base}+{len:#x} ({block_count} x {block_size:#x})");
        Ok(base)
    }

    /// Remove the device mapping starting at `base` and unmap it.
    pub fn unregister_device(&self, base: VirtualAddress) -> Result<(), MmError> {
        let mapping = self
            .devices
            .slots
            .lock()
            .remove(base)
            .ok_or(MmError::UnknownDevice(base))?;
        self.unmap(base, mapping.len)
    }

    /// Number of registered device mappings.
    pub fn device_mappings(&self) -> usize {
        self.devices.len()
    }

    /// Write every populated block of device mappings in `[addr, addr + len)`
    /// back to its device.
    pub fn msync(&self, addr: VirtualAddress, len: u64) -> Result<(), MmError> {
        if len == 0 {
            return Err(MmError::ZeroLength);
        }
        let end = addr.checked_add(len).ok_or(MmError::BadAddress(addr))?;
        let mut va = VirtualAddress::new(align_down(addr.as_u64(), DEVICE_BLOCK_SIZE));
        while va < end {
            if let Some(mapping) = self.devices.find(va.max(addr)) {
                let (start, block_end) = mapping.block_around(va.max(addr));
                if let Some(frames) = self.present_frames(start, block_end) {
                    let block = DeviceBlock {
                        address: start,
                        offset: start - mapping.base,
                        frames: &frames,
                    };
                    mapping.backing.write_back(&block)?;
                }
            }
            va += DEVICE_BLOCK_SIZE;
        }
        Ok(())
    }

    /// Frames of `[start, end)` if every page is present.
    fn present_frames(&self, start: VirtualAddress, end: VirtualAddress) -> Option<Vec<PhysicalAddress>> {
        let mut frames = Vec::new();
        let mut va = start;
        while va < end {
            let pte = self.leaf(va)?.load();
            if !pte.present() {
                return None;
            }
            frames.push(pte.address());
            va += PAGE_SIZE;
        }
        Some(frames)
    }

    /// Resolve a fault on a not-present device page.
    pub(crate) fn device_fault(&self, va: VirtualAddress) -> Result<FaultResolution, FatalReason> {
        let mapping = self.devices.find(va).ok_or(FatalReason::UnknownDevice)?;
        let (start, end) = mapping.block_around(va);
        let offset = start - mapping.base;

        let mut state = mapping.populating.lock();
        loop {
            if self.leaf(va).is_some_and(|cell| cell.load().present()) {
                return Ok(FaultResolution::DeviceAlreadyPresent);
            }
            if state.is_none() {
                break;
            }
            state = mapping.done.wait(state);
        }
        *state = Some(offset);
        drop(state);

        let result = self.populate_block(&mapping, start, end, offset);

        *mapping.populating.lock() = None;
        mapping.done.notify_all();

        result.map(|()| FaultResolution::DevicePopulated)
    }

    fn populate_block(
        &self,
        mapping: &DeviceMapping,
        start: VirtualAddress,
        end: VirtualAddress,
        offset: u64,
    ) -> Result<(), FatalReason> {
        let mut frames = Vec::new();
        let mut va = start;
        while va < end {
            frames.push(self.commit_device_page(va)?);
            va += PAGE_SIZE;
        }

        let block = DeviceBlock {
            address: start,
            offset,
            frames: &frames,
        };
        mapping
            .backing
            .populate(&block)
            .map_err(FatalReason::DeviceIo)?;

        // Last page first: the faulting thread's retry must not see the
        // start of the block before the rest is in place.
        let visible = Pte::new().with_present(true).with_accessed(true);
        let mut va = end;
        while va > start {
            va = VirtualAddress::new(va.as_u64() - PAGE_SIZE);
            if let Some(cell) = self.leaf(va) {
                cell.fetch_or(visible);
            }
        }
        log::trace!("vmm: device block {start}..{end} populated");
        Ok(())
    }

    /// Give the device page at `va` a frame without making it present.
    pub(crate) fn commit_device_page(&self, va: VirtualAddress) -> Result<PhysicalAddress, FatalReason> {
        let cell = self.leaf(va).ok_or(FatalReason::NotMapped)?;
        let pte = cell.load();
        if pte.is_committed() {
            return Ok(pte.address());
        }
        if !pte.is_demand() {
            return Err(FatalReason::UnrecognizedEntry);
        }

        let frame = self.alloc_frame(false, true).ok_or(FatalReason::OutOfMemory)?;
        match cell.compare_exchange(pte, pte.with_address(frame)) {
            Ok(_) => Ok(frame),
            Err(winner) => {
                self.frames.free(frame);
                Ok(winner.address())
            }
        }
    }
}
