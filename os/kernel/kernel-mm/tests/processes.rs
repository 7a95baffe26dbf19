mod common;

use common::Machine;
use kernel_info::memory::{RECURSIVE_SLOT, USER_POOL_BASE};
use kernel_memory_addresses::PAGE_SIZE;
use kernel_mm::{MapFlags, MmError, Platform, Prot};
use kernel_vmem::PhysMapper;

const RW: Prot = Prot::READ.union(Prot::WRITE);

#[test]
fn new_space_shares_the_kernel_half() {
    let m = Machine::new();
    let kernel = m.mm.mmap(0, PAGE_SIZE, RW, MapFlags::POPULATE, -1, 0).unwrap();
    m.write(kernel, 0x42).unwrap();

    let space = m.mm.create_process_address_space().unwrap();
    assert_eq!(m.platform().page_directory(), space.directory());
    assert_eq!(m.read(kernel).unwrap(), 0x42);

    let table = unsafe { m.ram.table(space.directory()) };
    let self_map = table.entry(RECURSIVE_SLOT).load();
    assert!(self_map.present());
    assert_eq!(self_map.address(), space.directory());
    assert!(table.iter().take(RECURSIVE_SLOT).all(|(_, e)| e.into_bits() == 0));
}

#[test]
fn user_mappings_live_in_the_process_pool() {
    let m = Machine::new();
    let space = m.mm.create_process_address_space().unwrap();
    *m.platform().process.lock().unwrap() = Some(space);

    let a = m
        .mm
        .mmap(0, 2 * PAGE_SIZE, RW, MapFlags::USER, -1, 0)
        .unwrap();
    assert_eq!(a.as_u64(), USER_POOL_BASE);
    m.write(a, 5).unwrap();
    let pte = m.pte(a).unwrap();
    assert!(pte.user() && !pte.global());

    m.mm.munmap(a, 2 * PAGE_SIZE).unwrap();
    let again = m.mm.mmap(0, PAGE_SIZE, RW, MapFlags::USER, -1, 0).unwrap();
    assert_eq!(again, a);
}

#[test]
fn destroy_returns_every_frame() {
    let m = Machine::new();
    // Kernel tables shared by all processes are created up front.
    let kernel = m.mm.mmap(0, PAGE_SIZE, RW, MapFlags::POPULATE, -1, 0).unwrap();
    let before = m.free_frames();

    let space = m.mm.create_process_address_space().unwrap();
    *m.platform().process.lock().unwrap() = Some(space);
    let a = m
        .mm
        .mmap(0, 8 * PAGE_SIZE, RW, MapFlags::USER | MapFlags::POPULATE, -1, 0)
        .unwrap();
    let far = m
        .mm
        .mmap(0x7000_0000_0000, PAGE_SIZE, RW, MapFlags::USER | MapFlags::FIXED, -1, 0)
        .unwrap();
    m.write(far, 1).unwrap();
    m.write(a, 1).unwrap();
    assert!(m.free_frames() < before);

    let space = m.platform().process.lock().unwrap().take().unwrap();
    m.mm.destroy_process_address_space(space).unwrap();
    assert_eq!(m.free_frames(), before);
    assert_eq!(m.platform().page_directory(), m.mm.master_directory());
    assert_eq!(m.read(kernel).unwrap(), 0);
}

#[test]
fn destroying_an_inactive_space_is_refused() {
    let m = Machine::new();
    let first = m.mm.create_process_address_space().unwrap();
    let _second = m.mm.create_process_address_space().unwrap();
    assert_eq!(
        m.mm.destroy_process_address_space(first),
        Err(MmError::NotActive)
    );
}
