//! # Memory Layout

/// Top-level page-table slot that maps the page tables themselves.
pub const RECURSIVE_SLOT: usize = 256;

/// First linear address covered by the recursive window.
pub const RECURSIVE_BASE: u64 = 0xFFFF_8000_0000_0000;

/// First top-level slot of the kernel half shared by every address space.
pub const KERNEL_HALF_FIRST_SLOT: usize = 256;

/// General kernel linear-address pool.
pub const KERNEL_POOL_BASE: u64 = 0xFFFF_8080_0000_0000;
pub const KERNEL_POOL_END: u64 = 0xFFFF_FF80_0000_0000;

/// Near pool, placed in the 2 GiB right below the kernel image.
pub const NEAR_POOL_BASE: u64 = 0xFFFF_FFFF_0000_0000;
pub const NEAR_POOL_END: u64 = KERNEL_BASE;

/// Per-process user pool.
pub const USER_POOL_BASE: u64 = 0x0000_0000_0040_0000;
pub const USER_POOL_END: u64 = 0x0000_7F80_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// Physical memory below this address is never handed to the allocator.
pub const LOW_MEMORY_LIMIT: u64 = 0x10_0000;

/// Size of the DMA-contiguous physical pool.
pub const CONTIGUOUS_POOL_SIZE: u64 = 4 << 20;

/// Device-backed regions are populated in blocks of this size.
pub const DEVICE_BLOCK_SIZE: u64 = 64 << 10;

/// Upper bound on concurrently registered device mappings.
pub const MM_MAX_DEVICE_MAPPINGS: usize = 64;

/// Upper bound on CPUs; one bit each in the shootdown mask.
pub const MAX_CPUS: usize = 64;

/// Interrupt vector used for TLB shootdown IPIs.
pub const TLB_SHOOTDOWN_VECTOR: u8 = 0xF8;

/// PAT index programmed as write-combining (PAT=1, PCD=0, PWT=1).
pub const PAT_INDEX_WRITE_COMBINING: u8 = 5;

const _: () = {
    assert!(KERNEL_POOL_BASE > RECURSIVE_BASE);
    assert!(KERNEL_POOL_END <= NEAR_POOL_BASE);
    assert!(NEAR_POOL_END == KERNEL_BASE);
    assert!(USER_POOL_END < 0x0000_8000_0000_0000);
    assert!(DEVICE_BLOCK_SIZE.is_multiple_of(4096));
    assert!(MAX_CPUS <= 64);
};
