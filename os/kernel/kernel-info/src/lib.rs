//! # Kernel Memory Layout and Boot Interface
//!
//! This crate defines the memory layout constants and the boot-time memory
//! map contract used by the virtual memory subsystem. It is the single source
//! of truth for where each linear-address pool lives and how the firmware's
//! view of physical memory is handed to the memory manager.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (48-bit, 4-level paging):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Unmapped (null guard, 4 MiB)  │
//! USER_POOL_BASE        ├─────────────────────────────────┤ 0x0000_0000_0040_0000
//!                       │   Per-process user pool         │
//! USER_POOL_END         ├─────────────────────────────────┤ 0x0000_7F80_0000_0000
//!                       │   Reserved (512 GiB)            │
//!                       ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │   Non-canonical hole            │
//! RECURSIVE_BASE        ├─────────────────────────────────┤ 0xFFFF_8000_0000_0000
//!                       │   Recursive page-table window   │ (root slot 256)
//! KERNEL_POOL_BASE      ├─────────────────────────────────┤ 0xFFFF_8080_0000_0000
//!                       │   Kernel linear pool            │
//! KERNEL_POOL_END       ├─────────────────────────────────┤ 0xFFFF_FF80_0000_0000
//!                       │   Unused                        │
//! NEAR_POOL_BASE        ├─────────────────────────────────┤ 0xFFFF_FFFF_0000_0000
//!                       │   Near pool (2 GiB)             │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xFFFF_FFFF_8000_0000
//!                       │   Kernel image                  │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The near pool sits directly below the kernel image so that anything
//! allocated from it is reachable with RIP-relative 32-bit displacements.
//!
//! ## Boot Memory Map ([`boot`])
//!
//! The firmware reports physical memory as a list of typed regions. Only
//! [`MemoryRegionKind::Usable`](boot::MemoryRegionKind::Usable) regions are
//! fed to the frame allocator; everything else is left untouched.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
