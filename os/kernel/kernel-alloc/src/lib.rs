//! # Physical frame and address-range allocation
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  LinearAllocator  (one per pool, mutex)      │
//! │   kernel pool · near pool · per-process pool │
//! │   contiguous physical pool (4 MiB, < 4 GiB)  │
//! └──────────────────────────────────────────────┘
//! ┌──────────────────────────────────────────────┐
//! │  FrameAllocator   (lock-free)                │
//! │   chain < 4 GiB · chain >= 4 GiB             │
//! └──────────────────────────────────────────────┘
//!                ▲
//!   memory_map::normalize(boot map)
//! ```
//!
//! The frame allocator owns every usable physical page that is not carved
//! out at boot. The linear allocator is address-agnostic: the same type
//! hands out kernel linear ranges and blocks of the contiguous physical
//! pool.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod frame_alloc;
pub mod linear;
pub mod memory_map;

pub use frame_alloc::{FrameAllocator, FreeBatch};
pub use linear::{InvariantViolation, LinearAllocError, LinearAllocator};
pub use memory_map::PhysicalRange;
