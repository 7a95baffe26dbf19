//! # Page-table entries and walkers
//!
//! ```text
//!   63   62..59   58..55  54 53 52  51 ............ 12  11 10 9  8  7  6 5  4   3   2 1 0
//! +----+--------+-------+--+--+--+--------------------+--+--+--+--+--+--+--+---+---+--+-+-+
//! | NX |  PKEY  |   -   |DM|FM|WT|   frame number     |DV|LK|PH| G|PS| D| A|PCD|PWT| U|W|P|
//! +----+--------+-------+--+--+--+--------------------+--+--+--+--+--+--+--+---+---+--+-+-+
//! ```
//!
//! [`Pte`] is the typed view of one entry; [`PteCell`] is the slot inside a
//! live [`PageTable`] that other CPUs and the MMU update concurrently.
//!
//! A [`TableWalker`] turns a linear address into the four slots that
//! translate it ([`PtePath`]). Two walkers exist:
//!
//! * [`RecursiveWalker`] uses the self-referencing top-level slot
//!   ([`kernel_info::memory::RECURSIVE_SLOT`]) and needs nothing but address
//!   arithmetic to find any entry of the live address space.
//! * [`DirectWalker`] follows physical addresses through a [`PhysMapper`].
//!   It can walk any directory, live or not, and is what hosted tests use.
//!
//! Callers never see which one is in use.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod direct;
mod fault;
mod page_table;
mod phys_mapper;
mod pte;
pub mod recursive;
mod walker;

pub use direct::DirectWalker;
pub use fault::PageFaultError;
pub use page_table::{PageTable, PteCell};
pub use phys_mapper::{OffsetPhysMapper, PhysMapper};
pub use pte::Pte;
pub use recursive::RecursiveWalker;
pub use walker::{
    ALL_PRESENT, LEAF, LEVEL_NAMES, LEVELS, PtePath, TABLES_PRESENT, TableWalker, present_mask,
};
