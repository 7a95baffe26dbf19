//! # Kernel synchronization primitives
//!
//! The memory manager needs exactly two blocking primitives: a short
//! critical-section lock for the linear-address allocators and the device
//! registry, and a condition variable for CPUs waiting on another CPU to
//! finish populating a device block. Everything else in the subsystem is
//! lock-free.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod condvar;
#[cfg(target_arch = "x86_64")]
pub mod irq;
mod spin_lock;

pub use condvar::Condvar;
pub use spin_lock::{SpinLock, SpinLockGuard};
