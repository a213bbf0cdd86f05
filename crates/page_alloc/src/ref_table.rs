//! Reference counts of allocated frames.
//!
//! A frame mapped by several page tables (copy-on-write after fork) must not
//! go back to the allocator until the last mapping releases it. The table
//! keeps one counter per frame, all guarded by a single lock so that every
//! increment and decrement of a frame is totally ordered.

use core::{fmt, ops::Range};

use kernel_params::PAGE_SIZE;
use sync_api::Mutex;

use crate::{PageAllocError, PageRound as _, PhysAddr};

/// The counters protected by the lock of a [`PageRefTable`].
pub struct RefCounts {
    counts: &'static mut [u32],
}

impl fmt::Debug for RefCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCounts")
            .field("len", &self.counts.len())
            .finish_non_exhaustive()
    }
}

/// What happened to a frame released through [`PageRefTable::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other references remain; the frame must stay allocated.
    Shared(u32),
    /// The last reference is gone; the frame must be freed.
    Last,
    /// The frame was never counted; it must be freed.
    Untracked,
}

impl Release {
    /// Returns `true` if the frame must be returned to the allocator.
    #[must_use]
    pub const fn should_free(self) -> bool {
        !matches!(self, Self::Shared(_))
    }
}

/// Per-frame reference counts over a range of physical memory.
///
/// The table does not touch the interrupt state; callers hold an interrupt
/// guard around every method, as [`crate::PageManager`] does.
pub struct PageRefTable<RefMutex> {
    heap: Range<PhysAddr>,
    counts: RefMutex,
}

impl<RefMutex> fmt::Debug for PageRefTable<RefMutex> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRefTable")
            .field("heap", &self.heap)
            .finish_non_exhaustive()
    }
}

impl<RefMutex> PageRefTable<RefMutex>
where
    RefMutex: Mutex<Data = RefCounts>,
{
    /// Creates a table counting the frames of `heap`, all starting at zero.
    ///
    /// # Panics
    ///
    /// Panics if `heap` is not page-aligned or `counts` has fewer cells than
    /// `heap` has pages.
    pub(crate) fn new(counts: &'static mut [u32], heap: Range<PhysAddr>) -> Self {
        assert!(heap.start.is_page_aligned() && heap.end.is_page_aligned());
        let pages = (heap.end.addr() - heap.start.addr()) / PAGE_SIZE;
        assert!(
            counts.len() >= pages,
            "{} reference counters for {pages} pages",
            counts.len()
        );

        let (counts, _) = counts.split_at_mut(pages);
        counts.fill(0);

        Self {
            heap,
            counts: RefMutex::new(RefCounts { counts }),
        }
    }

    fn index(&self, pa: PhysAddr) -> Result<usize, PageAllocError> {
        if !pa.is_page_aligned() || !self.heap.contains(&pa) {
            return Err(PageAllocError::InvalidAddress(pa));
        }
        Ok((pa.addr() - self.heap.start.addr()) / PAGE_SIZE)
    }

    /// Returns the reference count of frame `pa`.
    pub fn count(&self, pa: PhysAddr) -> Result<u32, PageAllocError> {
        let index = self.index(pa)?;
        Ok(self.counts.with_lock(|refs| refs.counts[index]))
    }

    /// Adds a reference to the allocated frame `pa`.
    ///
    /// Returns the new reference count.
    ///
    /// # Panics
    ///
    /// Panics if the frame is free or its counter would overflow.
    pub fn increase(&self, pa: PhysAddr) -> Result<u32, PageAllocError> {
        let index = self.index(pa)?;
        let prev = self.counts.with_lock(|refs| {
            let count = &mut refs.counts[index];
            let prev = *count;
            if prev != 0 && prev != u32::MAX {
                *count += 1;
            }
            prev
        });
        assert_ne!(prev, 0, "increase: page {pa:#x} is not allocated");
        assert_ne!(prev, u32::MAX, "increase: too many references to {pa:#x}");
        Ok(prev + 1)
    }

    /// Records the first reference to a frame that has just been allocated.
    ///
    /// # Panics
    ///
    /// Panics if `pa` is not a counted frame or its count is not zero.
    pub fn set_exclusive(&self, pa: PhysAddr) {
        let Ok(index) = self.index(pa) else {
            panic!("set_exclusive: invalid page {pa:#x}");
        };
        let prev = self.counts.with_lock(|refs| {
            let count = &mut refs.counts[index];
            let prev = *count;
            if prev == 0 {
                *count = 1;
            }
            prev
        });
        assert_eq!(prev, 0, "set_exclusive: page {pa:#x} is already referenced");
    }

    /// Drops one reference to frame `pa`.
    ///
    /// A frame with a zero count was never counted (it has been handed to the
    /// allocator directly); its release is reported as [`Release::Untracked`]
    /// and leaves the count untouched.
    ///
    /// # Panics
    ///
    /// Panics if `pa` is not a counted frame.
    pub fn release(&self, pa: PhysAddr) -> Release {
        let Ok(index) = self.index(pa) else {
            panic!("release: invalid page {pa:#x}");
        };
        self.counts.with_lock(|refs| {
            let count = &mut refs.counts[index];
            match *count {
                0 => Release::Untracked,
                1 => {
                    *count = 0;
                    Release::Last
                }
                n => {
                    *count = n - 1;
                    Release::Shared(n - 1)
                }
            }
        })
    }

    /// Returns the number of frames with a non-zero count.
    #[must_use]
    pub fn referenced_pages(&self) -> usize {
        self.counts
            .with_lock(|refs| refs.counts.iter().filter(|count| **count > 0).count())
    }
}
