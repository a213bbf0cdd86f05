//! Allocation policies chosen when the page manager is created.

use kernel_params::NCPU;

/// How the free frames are split into independently locked lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sharding {
    /// One list shared by every CPU.
    Global,
    /// One list per CPU.
    ///
    /// A CPU allocates from and frees to its own list. When its list is
    /// empty, it steals from the other CPUs' lists.
    #[default]
    PerCpu,
}

impl Sharding {
    /// Returns the number of free lists this policy uses.
    #[must_use]
    pub const fn shard_count(self) -> usize {
        match self {
            Self::Global => 1,
            Self::PerCpu => NCPU,
        }
    }
}

/// Whether frames may be referenced by more than one page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefCounting {
    /// Frames carry a reference count and are returned to the free lists
    /// only when the last reference is released. Required for copy-on-write.
    #[default]
    Shared,
    /// Every frame has exactly one owner; no reference table is kept.
    Exclusive,
}

/// Configuration of a [`PageManager`](crate::PageManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorConfig {
    pub sharding: Sharding,
    pub ref_counting: RefCounting,
}

impl AllocatorConfig {
    #[must_use]
    pub const fn new(sharding: Sharding, ref_counting: RefCounting) -> Self {
        Self {
            sharding,
            ref_counting,
        }
    }
}
