//! [`Platform`] on real `x86_64` hardware.

use crate::platform::{Collaborators, InterruptHandler, IpiTarget, Platform};
use crate::ProcessAddressSpace;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::cr3::Cr3;
use kernel_registers::cr4::Cr4;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use kernel_sync::irq;

/// How a full local flush, global entries included, is done on this CPU.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TlbFlush {
    /// `invpcid` type 2: all contexts, global entries included.
    Pcid,
    /// Toggle CR4.PGE off and on.
    ToggleGlobal,
    /// Reload CR3. Leaves global entries alone.
    Reload,
}

impl TlbFlush {
    /// Pick the strategy from the current CR4.
    ///
    /// # Safety
    /// Reads CR4; ring 0 only.
    #[must_use]
    pub unsafe fn detect() -> Self {
        let cr4 = unsafe { Cr4::load_unsafe() };
        if cr4.pcide() {
            Self::Pcid
        } else if cr4.pge() {
            Self::ToggleGlobal
        } else {
            Self::Reload
        }
    }

    /// # Safety
    /// Ring 0 only.
    pub unsafe fn flush_local(self) {
        match self {
            Self::Pcid => {
                let descriptor = [0_u64; 2];
                unsafe {
                    core::arch::asm!(
                        "invpcid {kind}, [{desc}]",
                        kind = in(reg) 2_u64,
                        desc = in(reg) descriptor.as_ptr(),
                        options(nostack, preserves_flags),
                    );
                }
            }
            Self::ToggleGlobal => unsafe {
                let cr4 = Cr4::load_unsafe();
                cr4.with_pge(false).store_unsafe();
                cr4.with_pge(true).store_unsafe();
            },
            Self::Reload => unsafe { Cr3::load_unsafe().store_unsafe() },
        }
    }
}

/// Drop the local translation of the page holding `va`.
///
/// # Safety
/// Ring 0 only.
#[inline]
pub unsafe fn invlpg(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// The hardware MMU plus whatever provides the other subsystems.
pub struct X86Platform<C> {
    collaborators: C,
    flush: TlbFlush,
}

impl<C: Collaborators> X86Platform<C> {
    /// # Safety
    /// Must run in ring 0; every later call on the result does too.
    pub unsafe fn new(collaborators: C) -> Self {
        let flush = unsafe { TlbFlush::detect() };
        log::info!("vmm: local TLB flush via {flush:?}");
        Self {
            collaborators,
            flush,
        }
    }

    pub const fn collaborators(&self) -> &C {
        &self.collaborators
    }
}

impl<C: Collaborators> Collaborators for X86Platform<C> {
    fn cpu_count(&self) -> usize {
        self.collaborators.cpu_count()
    }

    fn current_cpu(&self) -> usize {
        self.collaborators.current_cpu()
    }

    fn send_ipi(&self, target: IpiTarget, vector: u8) {
        self.collaborators.send_ipi(target, vector);
    }

    fn register_interrupt_handler(&self, vector: u8, handler: InterruptHandler) {
        self.collaborators.register_interrupt_handler(vector, handler);
    }

    fn with_current_process<R>(&self, f: impl FnOnce(&ProcessAddressSpace) -> R) -> Option<R> {
        self.collaborators.with_current_process(f)
    }
}

impl<C: Collaborators> Platform for X86Platform<C> {
    fn page_directory(&self) -> PhysicalAddress {
        unsafe { Cr3::load_unsafe() }.page_directory()
    }

    unsafe fn set_page_directory(&self, directory: PhysicalAddress) {
        unsafe { Cr3::from_page_directory(directory).store_unsafe() }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        unsafe { invlpg(va) }
    }

    fn flush_local_tlb(&self) {
        unsafe { self.flush.flush_local() }
    }

    fn disable_interrupts(&self) -> bool {
        irq::disable()
    }

    fn restore_interrupts(&self, was_enabled: bool) {
        irq::restore(was_enabled);
    }
}
