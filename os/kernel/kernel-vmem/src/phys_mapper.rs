use crate::PageTable;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Gives the kernel a pointer through which a physical frame can be touched.
pub trait PhysMapper {
    /// Linear pointer through which the byte at `pa` is reachable.
    ///
    /// # Safety
    /// `pa` must lie in memory this mapper covers. The returned pointer
    /// aliases whatever else refers to that frame.
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// View a frame as a page table.
    ///
    /// # Safety
    /// `pa` must be a page-aligned frame that is (or is about to become) a
    /// page table. The lifetime is unbounded; the frame must outlive its use.
    #[inline]
    unsafe fn table<'a>(&self, pa: PhysicalAddress) -> &'a PageTable {
        debug_assert!(pa.is_page_aligned());
        unsafe { &*self.phys_to_ptr(pa).cast::<PageTable>() }
    }

    /// Fill a frame with zeros.
    ///
    /// # Safety
    /// The caller owns the frame exclusively.
    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    unsafe fn zero_frame(&self, pa: PhysicalAddress) {
        unsafe { core::ptr::write_bytes(self.phys_to_ptr(pa.page_base()), 0, PAGE_SIZE as usize) }
    }

    /// Copy one frame over another.
    ///
    /// # Safety
    /// The caller owns `dst` exclusively and `src` is not being written.
    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    unsafe fn copy_frame(&self, dst: PhysicalAddress, src: PhysicalAddress) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.phys_to_ptr(src.page_base()),
                self.phys_to_ptr(dst.page_base()),
                PAGE_SIZE as usize,
            );
        }
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        unsafe { (**self).phys_to_ptr(pa) }
    }
}

/// Physical memory visible at a fixed linear offset.
#[derive(Debug, Copy, Clone)]
pub struct OffsetPhysMapper {
    offset: u64,
}

impl OffsetPhysMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }
}

impl PhysMapper for OffsetPhysMapper {
    #[inline]
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        pa.as_u64().wrapping_add(self.offset) as *mut u8
    }
}
