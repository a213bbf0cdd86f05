//! Physical page frames for the kernel.
//!
//! [`PageFrameAllocator`] hands out whole 4096-byte frames from one or more
//! locked free lists, [`PageRefTable`] counts the mappings of each frame, and
//! [`PageManager`] combines the two into the single allocation path used by
//! the rest of the kernel.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub use self::{
    addr::{PageRound, PhysAddr, PhysPageNum},
    config::{AllocatorConfig, RefCounting, Sharding},
    error::PageAllocError,
    free_list::FreeList,
    page_frame_allocator::PageFrameAllocator,
    page_manager::{MemoryInfo, PageManager},
    ref_table::{PageRefTable, RefCounts, Release},
    traits::FrameManager,
};

mod addr;
mod config;
mod error;
mod free_list;
mod meta;
mod page_frame_allocator;
mod page_manager;
mod ref_table;
#[cfg(any(test, feature = "std"))]
pub mod testing;
mod traits;
