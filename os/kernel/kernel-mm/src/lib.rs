//! # Virtual memory manager
//!
//! ```text
//!   mmap / munmap / mremap / mprotect / ...   handle_page_fault
//!            │                                       │
//!            ▼                                       ▼
//!   ┌──────────────────────────────────────────────────────────┐
//!   │ MemoryManager<Platform, PhysMapper, TableWalker>         │
//!   │   kernel pool · near pool · contiguous pool (linear)     │
//!   │   frame allocator (lock-free, < 4 GiB / >= 4 GiB)        │
//!   │   device registry · TLB shootdown state                  │
//!   └──────────────────────────────────────────────────────────┘
//!            │ PTE compare-and-swap          │ IPIs, CR3, invlpg
//!            ▼                               ▼
//!      live page tables                  Platform
//! ```
//!
//! Pages are committed lazily: a fresh mapping holds the demand sentinel
//! and the first access faults in a zeroed frame. Every entry update is a
//! single atomic operation on the entry, so two CPUs faulting on the same
//! page race on one compare-and-swap and the loser returns its frame.
//!
//! Changes that may leave stale translations on other CPUs go through
//! [`MemoryManager::broadcast_invalidate`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod device;
mod error;
mod fault;
mod flags;
mod manager;
mod mapping;
pub mod platform;
mod process;
mod shootdown;
#[cfg(all(target_arch = "x86_64", feature = "x86"))]
pub mod x86;

pub use device::{DeviceBacking, DeviceBlock, DeviceMapping};
pub use error::{DeviceIoError, FatalFault, FatalReason, FaultDump, MmError};
pub use fault::FaultResolution;
pub use flags::{Advice, MapFlags, MremapFlags, Prot};
pub use kernel_vmem::PageFaultError;
pub use manager::{MemoryManager, MemoryManagerConfig};
pub use platform::{Collaborators, InterruptHandler, IpiTarget, Platform};
pub use process::ProcessAddressSpace;
