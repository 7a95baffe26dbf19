//! What the memory manager needs from the rest of the kernel.

use crate::ProcessAddressSpace;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Interrupt handler entry as registered with the interrupt controller.
pub type InterruptHandler = fn();

/// Destination of an inter-processor interrupt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IpiTarget {
    Cpu(usize),
    AllButSelf,
}

/// Services owned by other subsystems: CPU topology, the interrupt
/// controller and the scheduler.
pub trait Collaborators: Sync {
    fn cpu_count(&self) -> usize;

    fn current_cpu(&self) -> usize;

    fn send_ipi(&self, target: IpiTarget, vector: u8);

    fn register_interrupt_handler(&self, vector: u8, handler: InterruptHandler);

    /// Run `f` against the address space of the current thread's process.
    /// `None` when the current thread has no user address space.
    fn with_current_process<R>(&self, f: impl FnOnce(&ProcessAddressSpace) -> R) -> Option<R>;
}

/// Collaborators plus the CPU-local MMU controls.
pub trait Platform: Collaborators {
    /// The live page directory (CR3).
    fn page_directory(&self) -> PhysicalAddress;

    /// Load a new page directory.
    ///
    /// # Safety
    /// `directory` must be a complete directory that maps the running kernel.
    unsafe fn set_page_directory(&self, directory: PhysicalAddress);

    /// Drop the local translation for one page.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Drop every local translation, global ones included.
    fn flush_local_tlb(&self);

    /// Mask local interrupts; returns whether they were enabled.
    fn disable_interrupts(&self) -> bool;

    fn restore_interrupts(&self, was_enabled: bool);
}
