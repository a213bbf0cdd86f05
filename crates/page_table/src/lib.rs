//! Sv39 page tables with copy-on-write sharing.
//!
//! Provides the lookup and insert primitives ([`PageTable::walk`],
//! [`PageTable::map_pages`]), copy-on-write fork and fault resolution, and the
//! recursive whole-tree operations: dump, mirror, and destroy. Every frame is
//! obtained from and returned to a [`page_alloc::FrameManager`].

#![cfg_attr(not(test), no_std)]

pub use self::{
    addr::VirtAddr,
    dump::Dump,
    entry::{PtEntry, PtEntryFlags},
    error::VmError,
    tree::PageTable,
};

mod addr;
mod cow;
mod dump;
mod entry;
mod error;
mod tree;
