//! Index-linked lists of free frames.
//!
//! Every managed frame owns one link cell in a shared array. A frame on a
//! free list stores the index of the next free frame (or [`LINK_END`]) in its
//! cell; an allocated frame stores [`LINK_ALLOCATED`]. A cell is only written
//! by the holder of the lock of the list the frame is on, or by the single
//! owner of an allocated frame.

use core::sync::atomic::{AtomicU32, Ordering};

/// Marks the last frame of a list, and an empty list.
pub(crate) const LINK_END: u32 = u32::MAX;

/// Marks a frame that is not on any free list.
pub(crate) const LINK_ALLOCATED: u32 = u32::MAX - 1;

/// Upper bound on the number of frames one allocator can manage.
pub(crate) const MAX_FRAMES: usize = LINK_ALLOCATED as usize;

/// A list of free frames, identified by their index in the link array.
#[derive(Debug)]
pub struct FreeList {
    head: u32,
    len: usize,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeList {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: LINK_END,
            len: 0,
        }
    }

    /// Returns the number of frames on this list.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head == LINK_END
    }

    /// Pushes frame `index` onto the list.
    ///
    /// The frame must not be on any list.
    pub(crate) fn push(&mut self, links: &[AtomicU32], index: usize) {
        debug_assert!(index < MAX_FRAMES);
        debug_assert_ne!(links[index].load(Ordering::Relaxed), LINK_ALLOCATED);
        #[expect(clippy::cast_possible_truncation)]
        let index32 = index as u32;
        links[index].store(self.head, Ordering::Relaxed);
        self.head = index32;
        self.len += 1;
    }

    /// Removes the first frame from the list and marks it allocated.
    pub(crate) fn pop(&mut self, links: &[AtomicU32]) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let index = self.head as usize;
        self.head = links[index].swap(LINK_ALLOCATED, Ordering::Relaxed);
        self.len -= 1;
        Some(index)
    }
}
