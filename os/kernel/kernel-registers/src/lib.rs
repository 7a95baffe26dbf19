//! # Typed `X86_64` Control Registers
//!
//! Only the registers the memory manager touches are modelled: CR3 holds the
//! live page directory, CR4 carries the paging feature switches used for
//! local TLB flushes.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "cr4")]
pub mod cr4;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The register access is privileged and requires kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the register-specific requirements; writing
    /// CR3 or CR4 changes the translation of every subsequent access.
    unsafe fn store_unsafe(self);
}
