//! A small simulated machine: two banks of RAM, a recording platform and
//! an MMU model that raises page faults the way the CPU would.

#![allow(dead_code)]

use kernel_info::boot::MemoryRegion;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_mm::{
    Collaborators, FatalFault, InterruptHandler, IpiTarget, MemoryManager, MemoryManagerConfig,
    PageFaultError, Platform, ProcessAddressSpace,
};
use kernel_vmem::{ALL_PRESENT, DirectWalker, PhysMapper, TableWalker, present_mask};
use std::cell::{Cell, UnsafeCell};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub const LOW_BASE: u64 = 0x10_0000;
pub const LOW_SIZE: u64 = 16 << 20;
pub const HIGH_BASE: u64 = 1 << 32;
pub const HIGH_SIZE: u64 = 1 << 20;

/// The boot directory sits in the first low frame, outside the memory map.
pub const MASTER: PhysicalAddress = PhysicalAddress::new(LOW_BASE);

#[repr(C, align(4096))]
struct Frame(UnsafeCell<[u8; PAGE_SIZE as usize]>);

pub struct SimRam {
    banks: Vec<(u64, Box<[Frame]>)>,
}

// SAFETY: all access goes through raw pointers, like real RAM.
unsafe impl Sync for SimRam {}

impl SimRam {
    fn bank(size: u64) -> Box<[Frame]> {
        (0..size / PAGE_SIZE)
            .map(|_| Frame(UnsafeCell::new([0; PAGE_SIZE as usize])))
            .collect()
    }

    pub fn new() -> Self {
        Self {
            banks: vec![
                (LOW_BASE, Self::bank(LOW_SIZE)),
                (HIGH_BASE, Self::bank(HIGH_SIZE)),
            ],
        }
    }
}

impl PhysMapper for SimRam {
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let pa = pa.as_u64();
        for (base, frames) in &self.banks {
            let len = frames.len() as u64 * PAGE_SIZE;
            if (*base..base + len).contains(&pa) {
                let offset = (pa - base) as usize;
                return unsafe { frames.as_ptr().cast::<u8>().cast_mut().add(offset) };
            }
        }
        panic!("{pa:#x} is outside simulated RAM");
    }
}

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
}

/// Make the calling thread run as `cpu`.
pub fn set_cpu(cpu: usize) {
    CPU.with(|c| c.set(cpu));
}

pub struct SimPlatform {
    cpus: AtomicUsize,
    directory: AtomicU64,
    pub ipis: Mutex<Vec<(IpiTarget, u8)>>,
    pub invalidated: Mutex<Vec<VirtualAddress>>,
    /// CPUs that did a full local flush, in order.
    pub flushes: Mutex<Vec<usize>>,
    pub handlers: Mutex<Vec<(u8, InterruptHandler)>>,
    pub process: Mutex<Option<ProcessAddressSpace>>,
}

impl SimPlatform {
    fn new(cpus: usize) -> Self {
        Self {
            cpus: AtomicUsize::new(cpus),
            directory: AtomicU64::new(MASTER.as_u64()),
            ipis: Mutex::default(),
            invalidated: Mutex::default(),
            flushes: Mutex::default(),
            handlers: Mutex::default(),
            process: Mutex::default(),
        }
    }

    pub fn set_cpu_count(&self, cpus: usize) {
        self.cpus.store(cpus, Ordering::SeqCst);
    }

    pub fn take_ipis(&self) -> Vec<(IpiTarget, u8)> {
        std::mem::take(&mut *self.ipis.lock().unwrap())
    }
}

impl Collaborators for SimPlatform {
    fn cpu_count(&self) -> usize {
        self.cpus.load(Ordering::SeqCst)
    }

    fn current_cpu(&self) -> usize {
        CPU.with(Cell::get)
    }

    fn send_ipi(&self, target: IpiTarget, vector: u8) {
        self.ipis.lock().unwrap().push((target, vector));
    }

    fn register_interrupt_handler(&self, vector: u8, handler: InterruptHandler) {
        self.handlers.lock().unwrap().push((vector, handler));
    }

    fn with_current_process<R>(&self, f: impl FnOnce(&ProcessAddressSpace) -> R) -> Option<R> {
        self.process.lock().unwrap().as_ref().map(f)
    }
}

impl Platform for SimPlatform {
    fn page_directory(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.directory.load(Ordering::SeqCst))
    }

    unsafe fn set_page_directory(&self, directory: PhysicalAddress) {
        self.directory.store(directory.as_u64(), Ordering::SeqCst);
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidated.lock().unwrap().push(va);
    }

    fn flush_local_tlb(&self) {
        let cpu = self.current_cpu();
        self.flushes.lock().unwrap().push(cpu);
    }

    fn disable_interrupts(&self) -> bool {
        true
    }

    fn restore_interrupts(&self, _was_enabled: bool) {}
}

pub type Mm = MemoryManager<SimPlatform, &'static SimRam, DirectWalker<&'static SimRam>>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    Fetch,
}

pub struct Machine {
    pub ram: &'static SimRam,
    pub mm: Mm,
}

impl Machine {
    pub fn new() -> Self {
        Self::with_cpus(1)
    }

    pub fn with_cpus(cpus: usize) -> Self {
        let ram: &'static SimRam = Box::leak(Box::new(SimRam::new()));
        let map = [
            MemoryRegion::usable(LOW_BASE + PAGE_SIZE, LOW_SIZE - PAGE_SIZE),
            MemoryRegion::usable(HIGH_BASE, HIGH_SIZE),
        ];
        let config = MemoryManagerConfig {
            memory_map: &map,
            master_directory: MASTER,
            reserve_contiguous_pool: true,
        };
        let mm = MemoryManager::new(SimPlatform::new(cpus), ram, DirectWalker::new(ram), &config)
            .expect("boot");
        mm.init_address_pools();
        Self { ram, mm }
    }

    pub fn platform(&self) -> &SimPlatform {
        self.mm.platform()
    }

    pub fn free_frames(&self) -> u64 {
        self.mm.frames().free_count()
    }

    /// What the MMU would do for one access: the physical address, or the
    /// error code of the page fault it raises.
    pub fn translate(&self, va: VirtualAddress, access: Access) -> Result<PhysicalAddress, PageFaultError> {
        let walker = DirectWalker::new(self.ram);
        let entries = walker
            .locate(self.platform().page_directory(), va)
            .snapshot();
        let error = PageFaultError::new()
            .with_write(access == Access::Write)
            .with_instruction_fetch(access == Access::Fetch);

        if present_mask(&entries) != ALL_PRESENT {
            return Err(error);
        }
        let leaf = entries[3].expect("present leaf");
        let denied = (access == Access::Write && !leaf.writable())
            || (access == Access::Fetch && leaf.no_execute());
        if denied {
            return Err(error.with_present(true));
        }
        Ok(leaf.address() + va.page_offset())
    }

    /// Perform an access, running the fault handler until it succeeds.
    pub fn access(&self, va: VirtualAddress, access: Access) -> Result<*mut u8, FatalFault> {
        for _ in 0..8 {
            match self.translate(va, access) {
                Ok(pa) => return Ok(unsafe { self.ram.phys_to_ptr(pa) }),
                Err(error) => {
                    self.mm.handle_page_fault(va, error)?;
                }
            }
        }
        panic!("fault at {va} never resolved");
    }

    pub fn write(&self, va: VirtualAddress, byte: u8) -> Result<(), FatalFault> {
        let ptr = self.access(va, Access::Write)?;
        unsafe { ptr.write_volatile(byte) };
        Ok(())
    }

    pub fn read(&self, va: VirtualAddress) -> Result<u8, FatalFault> {
        let ptr = self.access(va, Access::Read)?;
        Ok(unsafe { ptr.read_volatile() })
    }

    /// The raw leaf entry for `va` in the live directory.
    pub fn pte(&self, va: VirtualAddress) -> Option<kernel_vmem::Pte> {
        DirectWalker::new(self.ram)
            .locate(self.platform().page_directory(), va)
            .snapshot()[3]
    }
}
