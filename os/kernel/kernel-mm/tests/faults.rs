mod common;

use common::{Machine, set_cpu};
use kernel_info::memory::KERNEL_POOL_BASE;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_mm::{FatalReason, FaultResolution, MapFlags, PageFaultError, Platform, Prot};
use kernel_vmem::ALL_PRESENT;
use std::sync::Barrier;
use std::thread;

const RW: Prot = Prot::READ.union(Prot::WRITE);

fn not_present_write() -> PageFaultError {
    PageFaultError::new().with_write(true)
}

#[test]
fn racing_touches_consume_exactly_one_frame() {
    let m = Machine::with_cpus(8);
    let a = m.mm.mmap(0, PAGE_SIZE, RW, MapFlags::empty(), -1, 0).unwrap();
    let before = m.free_frames();
    let start = Barrier::new(8);

    let outcomes: Vec<FaultResolution> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|cpu| {
                let m = &m;
                let start = &start;
                s.spawn(move || {
                    set_cpu(cpu);
                    start.wait();
                    m.mm.handle_page_fault(a + 8 * cpu as u64, not_present_write())
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(before - m.free_frames(), 1);
    let winners = outcomes
        .iter()
        .filter(|o| **o == FaultResolution::DemandCommitted)
        .count();
    assert_eq!(winners, 1);
    assert!(m.mm.mpresent(a));
}

#[test]
fn reserved_bit_faults_are_fatal() {
    let m = Machine::new();
    let a = m.mm.mmap(0, PAGE_SIZE, RW, MapFlags::empty(), -1, 0).unwrap();
    let fault = m
        .mm
        .handle_page_fault(a, PageFaultError::new().with_reserved_bit(true))
        .unwrap_err();
    assert_eq!(fault.reason, FatalReason::ReservedBit);
    assert!(!m.mm.mpresent(a));
}

#[test]
fn unmapped_addresses_are_fatal_with_a_dump() {
    let m = Machine::new();
    let va = VirtualAddress::new(KERNEL_POOL_BASE + 0x7000);
    let fault = m.mm.handle_page_fault(va, PageFaultError::new()).unwrap_err();
    assert_eq!(fault.reason, FatalReason::NotMapped);
    assert_eq!(fault.dump.address, va);
    assert_eq!(fault.dump.present_mask, 0);

    let text = fault.to_string();
    assert!(text.contains("PML4"), "{text}");
    assert!(text.contains("NotMapped"), "{text}");
}

#[test]
fn non_canonical_addresses_are_fatal() {
    let m = Machine::new();
    let fault = m
        .mm
        .handle_page_fault(VirtualAddress::new(0x0000_8000_0000_0000), PageFaultError::new())
        .unwrap_err();
    assert_eq!(fault.reason, FatalReason::NonCanonical);
}

#[test]
fn stale_cpus_flush_once_then_invalidate_single_pages() {
    let m = Machine::with_cpus(2);
    let a = m.mm.mmap(0, PAGE_SIZE, RW, MapFlags::POPULATE, -1, 0).unwrap();

    // Another mapping change on cpu 0 bumps the generation.
    let b = m.mm.mmap(0, PAGE_SIZE, RW, MapFlags::POPULATE, -1, 0).unwrap();
    m.mm.mprotect(b, PAGE_SIZE, Prot::READ).unwrap();
    assert!(m.mm.tlb_generation() > 0);

    set_cpu(1);
    let first = m.mm.handle_page_fault(a, not_present_write()).unwrap();
    assert_eq!(first, FaultResolution::StaleTlbFlushed);
    assert_eq!(m.platform().flushes.lock().unwrap().as_slice(), [1]);

    let second = m.mm.handle_page_fault(a, not_present_write()).unwrap();
    assert_eq!(second, FaultResolution::Spurious);
    assert_eq!(m.platform().invalidated.lock().unwrap().last(), Some(&a));
    set_cpu(0);
}

#[test]
fn kernel_slots_sync_lazily_into_process_directories() {
    let m = Machine::new();
    let first = m.mm.create_process_address_space().unwrap();
    let second = m.mm.create_process_address_space().unwrap();
    assert_eq!(m.platform().page_directory(), second.directory());

    // Map kernel memory in a slot neither process has seen yet.
    unsafe { m.platform().set_page_directory(first.directory()) };
    let a = m.mm.mmap(0, PAGE_SIZE, RW, MapFlags::POPULATE, -1, 0).unwrap();
    m.write(a, 0x11).unwrap();

    unsafe { m.platform().set_page_directory(second.directory()) };
    assert!(m.pte(a).is_none());
    let resolved = m.mm.handle_page_fault(a, PageFaultError::new()).unwrap();
    assert_eq!(resolved, FaultResolution::DirectorySynced);
    assert_eq!(m.read(a).unwrap(), 0x11);

    unsafe { m.platform().set_page_directory(m.mm.master_directory()) };
    assert_eq!(m.read(a).unwrap(), 0x11);
}

#[test]
fn fault_dump_lists_every_level() {
    let m = Machine::new();
    let a = m.mm.mmap(0, PAGE_SIZE, Prot::NONE, MapFlags::empty(), -1, 0).unwrap();
    let fault = m.mm.handle_page_fault(a, PageFaultError::new()).unwrap_err();
    assert_eq!(fault.reason, FatalReason::GuardPage);
    assert_eq!(fault.dump.present_mask, ALL_PRESENT >> 1);
    assert!(fault.dump.entries.iter().all(Option::is_some));
    assert!(fault.dump.entries[3].unwrap().is_guard());
}
