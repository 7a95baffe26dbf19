//! The mapping calls: `mmap`, `munmap`, `mremap`, `mprotect`, `madvise`,
//! `mlock` and the physical-address queries.

use crate::error::FatalReason;
use crate::manager::Pool;
use crate::platform::Platform;
use crate::{Advice, MapFlags, MemoryManager, MmError, MremapFlags, Prot};
use alloc::vec::Vec;
use kernel_alloc::{LinearAllocError, PhysicalRange};
use kernel_info::memory::PAT_INDEX_WRITE_COMBINING;
use kernel_memory_addresses::{PAGE_MASK, PAGE_SIZE, PhysicalAddress, VirtualAddress, align_up};
use kernel_vmem::{PhysMapper, Pte, PteCell, TableWalker};

/// Leaf entry carrying the protection and caching of a new mapping, with
/// no address yet.
fn leaf_template(prot: Prot, flags: MapFlags) -> Pte {
    let user = flags.contains(MapFlags::USER);
    let pte = Pte::new()
        .with_writable(prot.contains(Prot::WRITE))
        .with_no_execute(!prot.contains(Prot::EXEC))
        .with_user(user)
        .with_global(!user)
        .with_physical(flags.contains(MapFlags::PHYSICAL))
        .with_device(flags.contains(MapFlags::DEVICE));

    if flags.contains(MapFlags::WEAKORDER) {
        pte.with_pat_index(PAT_INDEX_WRITE_COMBINING)
    } else {
        pte.with_cache_disable(flags.contains(MapFlags::NOCACHE))
            .with_write_through(flags.contains(MapFlags::WRITETHRU))
    }
}

/// New protection for an existing entry, or `None` if nothing is mapped.
///
/// A device page counts as populated once it has been accessed; one that
/// is not yet populated becomes a guard page so the next touch cannot
/// populate it behind the protection.
fn reprotect(pte: Pte, prot: Prot) -> Option<Pte> {
    if pte.into_bits() == 0 {
        return None;
    }
    let pte = pte
        .with_writable(prot.contains(Prot::WRITE))
        .with_no_execute(!prot.contains(Prot::EXEC));
    let populated = pte.is_committed() && (!pte.is_device() || pte.accessed());

    Some(if prot.is_empty() {
        if populated {
            pte.with_present(false)
        } else if pte.is_demand() || pte.is_device() {
            pte.into_guard()
        } else {
            pte
        }
    } else if pte.is_guard() {
        pte.into_demand()
    } else if populated {
        pte.with_present(true)
    } else {
        pte
    })
}

/// Page-aligned `[start, start + len)` covering `addr..addr + len`.
fn page_span(addr: u64, len: u64) -> Result<(u64, u64), MmError> {
    if len == 0 {
        return Err(MmError::ZeroLength);
    }
    let start = addr & !PAGE_MASK;
    let len = (addr & PAGE_MASK)
        .checked_add(len)
        .filter(|l| start.checked_add(align_up(*l, PAGE_SIZE)).is_some())
        .ok_or(MmError::BadAddress(VirtualAddress::new(addr)))?;
    Ok((start, align_up(len, PAGE_SIZE)))
}

/// Entry for pages a mapping grows by, following its last page `pte`.
fn grown_template(pte: Pte) -> Pte {
    let template = Pte::new()
        .with_writable(pte.writable())
        .with_user(pte.user())
        .with_global(pte.global())
        .with_no_execute(pte.no_execute())
        .with_write_through(pte.write_through())
        .with_cache_disable(pte.cache_disable())
        .with_page_size(pte.page_size());
    if pte.present() || pte.is_demand() {
        template.into_demand()
    } else {
        template.into_guard()
    }
}

/// Like [`page_span`], but the range may not cross between the user and
/// kernel halves.
fn lock_span(addr: VirtualAddress, len: u64) -> Result<(u64, u64), MmError> {
    let (start, len) = page_span(addr.as_u64(), len)?;
    let upper = |a: u64| a >= 1 << 47;
    if upper(start) != upper(start + len - 1) {
        return Err(MmError::BadAddress(addr));
    }
    Ok((start, len))
}

fn pages(start: u64, len: u64) -> impl Iterator<Item = VirtualAddress> {
    (0..len / PAGE_SIZE).map(move |i| VirtualAddress::new(start + i * PAGE_SIZE))
}

/// What clearing a range of entries left to do.
#[derive(Default)]
struct Cleared {
    frames: Vec<PhysicalAddress>,
    /// Some removed translation may be cached on another CPU.
    needs_shootdown: bool,
}

impl<P: Platform, M: PhysMapper, W: TableWalker> MemoryManager<P, M, W> {
    /// Map `len` bytes.
    ///
    /// `addr` is a placement hint (mandatory with [`MapFlags::FIXED`]), or
    /// the physical address to map with [`MapFlags::PHYSICAL`]. Without
    /// [`MapFlags::POPULATE`] no frame is committed until first touch.
    /// The result keeps the sub-page offset of `addr`.
    ///
    /// File-backed mappings (`fd >= 0`) are not supported.
    pub fn mmap(
        &self,
        addr: u64,
        len: u64,
        prot: Prot,
        flags: MapFlags,
        fd: i32,
        offset: u64,
    ) -> Result<VirtualAddress, MmError> {
        if Prot::from_bits(prot.bits()).is_none() {
            return Err(MmError::InvalidProtection);
        }
        let Some(mut flags) = MapFlags::from_bits(flags.bits()) else {
            return Err(MmError::InvalidFlags);
        };
        if flags.contains(MapFlags::USER) && flags.intersects(MapFlags::USER_PROHIBITED) {
            return Err(MmError::InvalidFlags);
        }
        if flags.contains(MapFlags::DEVICE) && flags.intersects(MapFlags::PHYSICAL | MapFlags::POPULATE) {
            return Err(MmError::InvalidFlags);
        }
        if fd >= 0 || offset != 0 {
            return Err(MmError::Unsupported);
        }
        let (base, len) = page_span(addr, len)?;

        if flags.contains(MapFlags::BIT32)
            || (flags.contains(MapFlags::STACK) && !flags.contains(MapFlags::USER))
        {
            flags |= MapFlags::POPULATE;
        }

        let pool = if flags.contains(MapFlags::USER) {
            Pool::User
        } else if flags.contains(MapFlags::NEAR) {
            Pool::Near
        } else {
            Pool::Kernel
        };

        let linear = self.reserve_linear(pool, base, len, flags)?;
        if let Err(e) = self.fill(linear, len, base, prot, flags) {
            let cleared = self.clear_range(linear, len);
            if cleared.needs_shootdown {
                self.broadcast_invalidate();
            }
            self.free_frames(&cleared.frames);
            self.with_pool(pool, |p| p.release(linear, len))?;
            return Err(e);
        }

        log::trace!("vmm: mmap {linear:#x}+{len:#x} {prot:?} {flags:?}");
        Ok(VirtualAddress::new(linear + (addr & PAGE_MASK)))
    }

    fn reserve_linear(&self, pool: Pool, base: u64, len: u64, flags: MapFlags) -> Result<u64, MmError> {
        if base != 0 && !flags.contains(MapFlags::PHYSICAL) {
            if Pool::of(VirtualAddress::new(base)) == Some(pool) {
                match self.with_pool(pool, |p| p.reserve(base, len, true))? {
                    Ok(()) => return Ok(base),
                    Err(_) if flags.contains(MapFlags::FIXED) => return Err(MmError::AddressInUse),
                    Err(_) => {}
                }
            } else if flags.contains(MapFlags::FIXED) {
                return Err(MmError::BadAddress(VirtualAddress::new(base)));
            }
        }

        self.with_pool(pool, |p| p.allocate(len))?
            .map_err(|e| match e {
                LinearAllocError::ZeroSize => MmError::ZeroLength,
                _ => MmError::AddressSpaceExhausted,
            })
    }

    fn fill(&self, linear: u64, len: u64, phys_base: u64, prot: Prot, flags: MapFlags) -> Result<(), MmError> {
        let template = leaf_template(prot, flags);
        let accessible = !prot.is_empty();

        for va in pages(linear, len) {
            let cell = self.ensure_leaf(va)?;
            let pte = if flags.contains(MapFlags::PHYSICAL) {
                template
                    .with_present(accessible)
                    .with_address(PhysicalAddress::new(phys_base + (va.as_u64() - linear)))
            } else if flags.contains(MapFlags::POPULATE) {
                let frame = self
                    .alloc_frame(
                        flags.contains(MapFlags::BIT32),
                        !flags.contains(MapFlags::UNINITIALIZED),
                    )
                    .ok_or(MmError::OutOfMemory)?;
                template.with_present(accessible).with_address(frame)
            } else if accessible {
                template.into_demand()
            } else {
                template.into_guard()
            };

            let old = cell.swap(pte);
            if old.owns_frame() {
                log::warn!("vmm: {va} still held {}", old.address());
                self.frames.free(old.address());
            }
        }
        Ok(())
    }

    fn clear_range(&self, start: u64, len: u64) -> Cleared {
        let mut cleared = Cleared::default();
        for va in pages(start, len) {
            let Some(cell) = self.leaf(va) else {
                continue;
            };
            let old = cell.swap(Pte::new());
            if old.owns_frame() {
                cleared.frames.push(old.address());
            }
            if old.present() && old.accessed() {
                self.platform.invalidate_page(va);
                cleared.needs_shootdown = true;
            }
        }
        cleared
    }

    fn free_frames(&self, frames: &[PhysicalAddress]) {
        let mut batch = self.frames.batch();
        for frame in frames {
            batch.free(*frame);
        }
    }

    /// Remove every mapping in `[addr, addr + len)` and give the address
    /// range back to its pool.
    ///
    /// Frames are only freed once no CPU can still reach them. Device
    /// regions are only removed through
    /// [`unregister_device`](Self::unregister_device).
    pub fn munmap(&self, addr: VirtualAddress, len: u64) -> Result<(), MmError> {
        let (start, span) = page_span(addr.as_u64(), len)?;
        let start = VirtualAddress::new(start);
        if self.devices.overlaps(start, start + span) {
            return Err(MmError::AddressInUse);
        }
        self.unmap(addr, len)
    }

    pub(crate) fn unmap(&self, addr: VirtualAddress, len: u64) -> Result<(), MmError> {
        let (start, len) = page_span(addr.as_u64(), len)?;
        let pool = Pool::of(VirtualAddress::new(start)).ok_or(MmError::BadAddress(addr))?;

        let cleared = self.clear_range(start, len);
        if cleared.needs_shootdown {
            self.broadcast_invalidate();
        }
        self.free_frames(&cleared.frames);
        self.with_pool(pool, |p| p.release(start, len))
    }

    /// Resize the mapping at `old` from `old_size` to `new_size` bytes.
    ///
    /// Shrinking unmaps the tail. Growing extends the mapping in place when
    /// the address space behind it is free and otherwise moves it, which
    /// requires [`MremapFlags::MAYMOVE`]. Added pages take the protection of
    /// the last old page and are committed on first touch.
    pub fn mremap(
        &self,
        old: VirtualAddress,
        old_size: u64,
        new_size: u64,
        flags: MremapFlags,
    ) -> Result<VirtualAddress, MmError> {
        let Some(flags) = MremapFlags::from_bits(flags.bits()) else {
            return Err(MmError::InvalidFlags);
        };
        if flags.contains(MremapFlags::FIXED) {
            return Err(MmError::Unsupported);
        }
        if old.page_offset() != 0 {
            return Err(MmError::BadAddress(old));
        }
        let (start, old_len) = page_span(old.as_u64(), old_size)?;
        let (_, new_len) = page_span(start, new_size)?;
        let pool = Pool::of(old).ok_or(MmError::BadAddress(old))?;
        if self.devices.overlaps(old, old + old_len) {
            return Err(MmError::AddressInUse);
        }

        if new_len <= old_len {
            if new_len < old_len {
                self.unmap(VirtualAddress::new(start + new_len), old_len - new_len)?;
            }
            return Ok(old);
        }

        let last = VirtualAddress::new(start + old_len - PAGE_SIZE);
        let tail = self
            .leaf(last)
            .map(PteCell::load)
            .filter(|pte| pte.into_bits() != 0)
            .map(grown_template)
            .ok_or(MmError::NotMapped(last))?;

        let end = start + old_len;
        let grow = new_len - old_len;
        if self.with_pool(pool, |p| p.reserve(end, grow, true))?.is_ok() {
            self.fill_tail(pool, end, grow, tail)?;
            log::trace!("vmm: mremap {start:#x} grew in place to {new_len:#x}");
            return Ok(old);
        }
        if !flags.contains(MremapFlags::MAYMOVE) {
            return Err(MmError::AddressInUse);
        }
        self.move_mapping(pool, start, old_len, new_len, tail)
    }

    /// Point `[start, start + len)` at `template`, undoing the reservation
    /// on failure.
    fn fill_tail(&self, pool: Pool, start: u64, len: u64, template: Pte) -> Result<(), MmError> {
        let mut displaced = Vec::new();
        let mut result = Ok(());
        for va in pages(start, len) {
            match self.ensure_leaf(va) {
                Ok(cell) => {
                    let old = cell.swap(template);
                    if old.owns_frame() {
                        displaced.push(old.address());
                    }
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if result.is_err() {
            let cleared = self.clear_range(start, len);
            displaced.extend(cleared.frames);
            self.with_pool(pool, |p| p.release(start, len))?;
        }
        self.free_frames(&displaced);
        result
    }

    fn move_mapping(
        &self,
        pool: Pool,
        start: u64,
        old_len: u64,
        new_len: u64,
        tail: Pte,
    ) -> Result<VirtualAddress, MmError> {
        let mut sources = Vec::new();
        for va in pages(start, old_len) {
            match self.leaf(va) {
                Some(cell) if cell.load().into_bits() != 0 => sources.push(cell),
                _ => return Err(MmError::NotMapped(va)),
            }
        }

        let target = self
            .with_pool(pool, |p| p.allocate(new_len))?
            .map_err(|_| MmError::AddressSpaceExhausted)?;
        let mut targets = Vec::new();
        for va in pages(target, new_len) {
            match self.ensure_leaf(va) {
                Ok(cell) => targets.push(cell),
                Err(e) => {
                    self.with_pool(pool, |p| p.release(target, new_len))?;
                    return Err(e);
                }
            }
        }

        let mut displaced = Vec::new();
        let mut needs_shootdown = false;
        for ((va, from), to) in pages(start, old_len).zip(&sources).zip(&targets) {
            let pte = from.swap(Pte::new());
            if pte.present() && pte.accessed() {
                self.platform.invalidate_page(va);
                needs_shootdown = true;
            }
            let old = to.swap(pte);
            if old.owns_frame() {
                displaced.push(old.address());
            }
        }
        for to in &targets[sources.len()..] {
            let old = to.swap(tail);
            if old.owns_frame() {
                displaced.push(old.address());
            }
        }

        if needs_shootdown {
            self.broadcast_invalidate();
        }
        self.free_frames(&displaced);
        self.with_pool(pool, |p| p.release(start, old_len))?;
        log::trace!("vmm: mremap {start:#x}+{old_len:#x} moved to {target:#x}+{new_len:#x}");
        Ok(VirtualAddress::new(target))
    }

    /// Commit every page of `[addr, addr + len)` and keep its frame in
    /// place until [`munlock`](Self::munlock).
    ///
    /// The range must lie in one half of the address space and be mapped
    /// throughout.
    pub fn mlock(&self, addr: VirtualAddress, len: u64) -> Result<(), MmError> {
        let (start, len) = lock_span(addr, len)?;
        for va in pages(start, len) {
            let cell = self.leaf(va).ok_or(MmError::NotMapped(va))?;
            let pte = cell.load();
            if pte.into_bits() == 0 {
                return Err(MmError::NotMapped(va));
            }
            if pte.is_demand() && !pte.is_device() {
                let _ = self
                    .commit_demand_page(cell, pte, false)
                    .ok_or(MmError::OutOfMemory)?;
            }
            let _ = cell.update(|pte| (pte.into_bits() != 0).then(|| pte.with_locked(true)));
        }
        Ok(())
    }

    /// Let `madvise` discard the frames of `[addr, addr + len)` again.
    pub fn munlock(&self, addr: VirtualAddress, len: u64) -> Result<(), MmError> {
        let (start, len) = lock_span(addr, len)?;
        for va in pages(start, len) {
            if let Some(cell) = self.leaf(va) {
                let _ = cell.update(|pte| pte.locked().then(|| pte.with_locked(false)));
            }
        }
        Ok(())
    }

    /// Change the protection of every page in `[addr, addr + len)`.
    ///
    /// [`Prot::NONE`] turns demand pages into guard pages and hides
    /// committed ones; anything else turns guard pages back into demand
    /// pages.
    pub fn mprotect(&self, addr: VirtualAddress, len: u64, prot: Prot) -> Result<(), MmError> {
        if Prot::from_bits(prot.bits()).is_none() {
            return Err(MmError::InvalidProtection);
        }
        let (start, len) = page_span(addr.as_u64(), len)?;

        let mut changed = false;
        let mut dropped = Vec::new();
        let mut result = Ok(());
        for va in pages(start, len) {
            let Some(cell) = self.leaf(va) else {
                result = Err(MmError::NotMapped(va));
                break;
            };
            match cell.update(|pte| reprotect(pte, prot)) {
                Ok(old) => {
                    if old.owns_frame() && !reprotect(old, prot).is_some_and(Pte::owns_frame) {
                        dropped.push(old.address());
                    }
                    if old.present() {
                        self.platform.invalidate_page(va);
                        changed = true;
                    }
                }
                Err(_) => {
                    result = Err(MmError::NotMapped(va));
                    break;
                }
            }
        }

        if changed {
            self.broadcast_invalidate();
        }
        self.free_frames(&dropped);
        result
    }

    /// Apply `advice` to `[addr, addr + len)`.
    pub fn madvise(&self, addr: VirtualAddress, len: u64, advice: Advice) -> Result<(), MmError> {
        let (start, len) = page_span(addr.as_u64(), len)?;
        match advice {
            Advice::Ignored(_) => Ok(()),
            Advice::WillNeed => {
                for va in pages(start, len) {
                    let Some(cell) = self.leaf(va) else {
                        continue;
                    };
                    let pte = cell.load();
                    if pte.is_demand() && !pte.is_device() {
                        let _ = self
                            .commit_demand_page(cell, pte, false)
                            .ok_or(MmError::OutOfMemory)?;
                    }
                }
                Ok(())
            }
            Advice::DontNeed => {
                let mut cleared = Cleared::default();
                for va in pages(start, len) {
                    let Some(cell) = self.leaf(va) else {
                        continue;
                    };
                    let Ok(old) = cell.update(discard) else {
                        continue;
                    };
                    cleared.frames.push(old.address());
                    if old.present() && old.accessed() {
                        self.platform.invalidate_page(va);
                        cleared.needs_shootdown = true;
                    }
                }
                if cleared.needs_shootdown {
                    self.broadcast_invalidate();
                }
                self.free_frames(&cleared.frames);
                Ok(())
            }
            Advice::WeakOrder | Advice::StrongOrder => {
                let index = if advice == Advice::WeakOrder {
                    PAT_INDEX_WRITE_COMBINING
                } else {
                    0
                };
                let mut changed = false;
                for va in pages(start, len) {
                    let Some(cell) = self.leaf(va) else {
                        continue;
                    };
                    let updated =
                        cell.update(|pte| (pte.into_bits() != 0).then(|| pte.with_pat_index(index)));
                    if updated.is_ok_and(|old| old.present()) {
                        self.platform.invalidate_page(va);
                        changed = true;
                    }
                }
                if changed {
                    self.broadcast_invalidate();
                }
                Ok(())
            }
        }
    }

    /// Commit `pte` (a demand entry read from `cell`) to a fresh zeroed
    /// frame.
    ///
    /// `None` when out of memory; `Some(Err(current))` when the entry
    /// changed first, in which case the frame went back to the allocator.
    pub(crate) fn commit_demand_page(&self, cell: &PteCell, pte: Pte, dirty: bool) -> Option<Result<Pte, Pte>> {
        let frame = self.alloc_frame(false, true)?;
        let committed = pte
            .with_address(frame)
            .with_present(true)
            .with_accessed(true)
            .with_dirty(dirty);
        Some(
            cell.compare_exchange(pte, committed)
                .map(|_| committed)
                .inspect_err(|_| self.frames.free(frame)),
        )
    }

    /// Physical address behind `addr`, committing the page if it is still
    /// on demand. Device pages get a frame but stay not-present.
    pub fn mphysaddr(&self, addr: VirtualAddress) -> Result<PhysicalAddress, MmError> {
        let cell = self.leaf(addr).ok_or(MmError::NotMapped(addr))?;
        let mut pte = cell.load();

        if pte.is_demand() && pte.is_device() {
            let frame = self.commit_device_page(addr).map_err(|reason| match reason {
                FatalReason::OutOfMemory => MmError::OutOfMemory,
                _ => MmError::NotMapped(addr),
            })?;
            return Ok(frame + addr.page_offset());
        }
        if pte.is_demand() {
            pte = self
                .commit_demand_page(cell, pte, false)
                .ok_or(MmError::OutOfMemory)?
                .unwrap_or_else(|current| current);
        }

        if !pte.is_committed() {
            return Err(MmError::NotMapped(addr));
        }
        Ok(pte.address() + addr.page_offset())
    }

    /// Whether the page holding `addr` is present.
    pub fn mpresent(&self, addr: VirtualAddress) -> bool {
        self.leaf(addr).is_some_and(|cell| cell.load().present())
    }

    /// Whether every page overlapping `[addr, addr + len)` is present.
    pub fn mpresent_range(&self, addr: VirtualAddress, len: u64) -> bool {
        page_span(addr.as_u64(), len)
            .is_ok_and(|(start, len)| pages(start, len).all(|va| self.mpresent(va)))
    }

    /// Physical ranges backing `[addr, addr + len)`, in address order, with
    /// physically adjacent pages merged. Commits demand pages on the way.
    pub fn mphysranges(&self, addr: VirtualAddress, len: u64) -> Result<Vec<PhysicalRange>, MmError> {
        if len == 0 {
            return Err(MmError::ZeroLength);
        }
        let end = addr.checked_add(len).ok_or(MmError::BadAddress(addr))?;

        let mut ranges: Vec<PhysicalRange> = Vec::new();
        let mut va = addr;
        while va < end {
            let next = va
                .page_base()
                .checked_add(PAGE_SIZE)
                .map_or(end, |n| n.min(end));
            let pa = self.mphysaddr(va)?.as_u64();
            let chunk = next - va;
            match ranges.last_mut() {
                Some(last) if last.end == pa => last.end += chunk,
                _ => ranges.push(PhysicalRange::new(pa, pa + chunk)),
            }
            va = next;
        }
        Ok(ranges)
    }

    /// Physically contiguous memory below 4 GiB from the pool reserved at
    /// boot.
    pub fn alloc_contiguous(&self, size: u64) -> Result<PhysicalAddress, MmError> {
        self.contiguous
            .allocate(size)
            .map(PhysicalAddress::new)
            .map_err(|e| match e {
                LinearAllocError::ZeroSize => MmError::ZeroLength,
                _ => MmError::OutOfMemory,
            })
    }

    pub fn free_contiguous(&self, addr: PhysicalAddress, size: u64) {
        self.contiguous.release(addr.as_u64(), size);
    }
}

/// Entry after `MADV_DONTNEED`: owned frames go back to demand, or to guard
/// if the page is currently inaccessible. Locked pages keep their frame.
fn discard(pte: Pte) -> Option<Pte> {
    if !pte.owns_frame() || pte.is_device() || pte.locked() {
        return None;
    }
    Some(if pte.present() {
        pte.into_demand()
    } else {
        pte.into_guard()
    })
}
