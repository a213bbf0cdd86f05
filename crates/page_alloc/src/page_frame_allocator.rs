//! Physical memory allocator, for user processes,
//! kernel stacks, page-table pages,
//! and pipe buffers.
//!
//! Allocates whole 4096-byte pages.

use core::{
    fmt,
    marker::PhantomData,
    ops::Range,
    sync::atomic::{AtomicU32, Ordering},
};

use arrayvec::ArrayVec;
use kernel_params::{ALLOC_JUNK, FREE_JUNK, NCPU, PAGE_SIZE};
use sync_api::{Cpu, Mutex};

use crate::{
    PageRound as _, PhysAddr,
    config::Sharding,
    free_list::{FreeList, LINK_ALLOCATED, LINK_END, MAX_FRAMES},
    meta,
};

/// A page allocator that hands out frames from one or more locked free lists.
///
/// The free lists (shards) are selected by the [`Sharding`] policy. With
/// [`Sharding::PerCpu`], each CPU allocates from and frees to its own shard and
/// steals from the others only when its own shard is empty.
///
/// `ShardMutex` is the lock protecting one shard, `C` tells which CPU the
/// caller is running on.
pub struct PageFrameAllocator<ShardMutex, C> {
    /// The range of physical memory handed out as frames.
    heap: Range<PhysAddr>,
    /// One link cell per frame in `heap`.
    links: &'static [AtomicU32],
    /// The total number of frames in `heap`.
    total_pages: usize,
    sharding: Sharding,
    shards: ArrayVec<ShardMutex, NCPU>,
    _cpu: PhantomData<fn() -> C>,
}

impl<ShardMutex, C> fmt::Debug for PageFrameAllocator<ShardMutex, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrameAllocator")
            .field("heap", &self.heap)
            .field("total_pages", &self.total_pages)
            .field("sharding", &self.sharding)
            .finish_non_exhaustive()
    }
}

impl<ShardMutex, C> PageFrameAllocator<ShardMutex, C>
where
    ShardMutex: Mutex<Data = FreeList>,
    C: Cpu,
{
    /// Creates a new `PageFrameAllocator` that manages the given range of
    /// physical memory.
    ///
    /// The link array is placed at the start of the range; every page after it
    /// becomes a free frame. With [`Sharding::PerCpu`] the frame with page
    /// number `ppn` starts on the shard of CPU `ppn % NCPU`.
    ///
    /// # Safety
    ///
    /// The given range of physical memory must be valid, accessible through
    /// its physical addresses, and not used by anything else for as long as
    /// the allocator exists.
    ///
    /// # Panics
    ///
    /// Panics if the range does not hold at least one frame after the link
    /// array.
    #[must_use]
    pub unsafe fn new(range: Range<PhysAddr>, sharding: Sharding) -> Self {
        let heap_end = range.end.page_rounddown();
        let first_page = range.start.page_roundup();
        assert!(
            first_page < heap_end,
            "no page in {:#x}..{:#x}",
            range.start,
            range.end
        );

        let max_pages = (heap_end.addr() - first_page.addr()) / PAGE_SIZE;
        let (links, rest) =
            unsafe { meta::carve(range.start..heap_end, max_pages, || AtomicU32::new(LINK_END)) };
        let links = &*links;

        let heap_start = rest.start.page_roundup();
        assert!(
            heap_start < heap_end,
            "no page left after frame metadata: heap_start={heap_start:#x}, heap_end={heap_end:#x}"
        );
        let total_pages = (heap_end.addr() - heap_start.addr()) / PAGE_SIZE;
        assert!(total_pages <= links.len());
        assert!(total_pages < MAX_FRAMES);

        let shard_count = sharding.shard_count();
        let mut lists = (0..shard_count)
            .map(|_| FreeList::new())
            .collect::<ArrayVec<_, NCPU>>();
        let first_ppn = heap_start.phys_page_num().value();
        for index in (0..total_pages).rev() {
            let shard = (first_ppn + index) % shard_count;
            lists[shard].push(links, index);
        }

        Self {
            heap: heap_start..heap_end,
            links,
            total_pages,
            sharding,
            shards: lists.into_iter().map(ShardMutex::new).collect(),
            _cpu: PhantomData,
        }
    }

    /// Returns the range of physical memory handed out as frames.
    #[must_use]
    pub fn heap_range(&self) -> Range<PhysAddr> {
        self.heap.clone()
    }

    /// Returns the sharding policy of this allocator.
    #[must_use]
    pub fn sharding(&self) -> Sharding {
        self.sharding
    }

    /// Returns the total number of pages managed by the allocator.
    ///
    /// This includes both allocated and free pages.
    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Returns the number of free pages currently available for allocation.
    ///
    /// Shards are visited one after another, so the result is exact only when
    /// no allocation or free is running concurrently.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        let _intr = C::push_disabled();
        self.shards
            .iter()
            .map(|shard| shard.with_lock(|list| FreeList::len(list)))
            .sum()
    }

    /// Returns the number of frames currently marked allocated.
    ///
    /// Counted from the link array, independently of the free lists.
    #[must_use]
    pub fn allocated_pages(&self) -> usize {
        self.links[..self.total_pages]
            .iter()
            .filter(|link| link.load(Ordering::Acquire) == LINK_ALLOCATED)
            .count()
    }

    /// Returns the number of shards (free lists).
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Returns the number of free pages on shard `shard`.
    ///
    /// # Panics
    ///
    /// Panics if `shard` is not less than [`Self::shard_count()`].
    #[must_use]
    pub fn shard_free_pages(&self, shard: usize) -> usize {
        let _intr = C::push_disabled();
        self.shards[shard].with_lock(|list| FreeList::len(list))
    }

    /// Checks if the given address is a frame managed by the allocator.
    ///
    /// The address must be page-aligned to be considered valid.
    #[must_use]
    pub fn is_heap_addr(&self, pa: PhysAddr) -> bool {
        pa.is_page_aligned() && self.heap.contains(&pa)
    }

    /// Returns `true` if `pa` is a frame that is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, pa: PhysAddr) -> bool {
        self.frame_index(pa)
            .is_some_and(|index| self.links[index].load(Ordering::Acquire) == LINK_ALLOCATED)
    }

    /// Returns the index of frame `pa`, or `None` if `pa` is not a frame
    /// managed by the allocator.
    pub(crate) fn frame_index(&self, pa: PhysAddr) -> Option<usize> {
        self.is_heap_addr(pa)
            .then(|| (pa.addr() - self.heap.start.addr()) / PAGE_SIZE)
    }

    fn frame_addr(&self, index: usize) -> PhysAddr {
        debug_assert!(index < self.total_pages);
        PhysAddr::new(self.heap.start.addr() + index * PAGE_SIZE)
    }

    /// Returns the shard of the calling CPU.
    ///
    /// Interrupts must be disabled.
    fn local_shard(&self) -> usize {
        match self.sharding {
            Sharding::Global => 0,
            Sharding::PerCpu => C::current_id() % self.shards.len(),
        }
    }

    /// Takes a frame from any shard other than `local`.
    ///
    /// Shards are probed in index order, one lock at a time.
    fn steal(&self, local: usize) -> Option<usize> {
        self.shards
            .iter()
            .enumerate()
            .filter(|(shard, _)| *shard != local)
            .find_map(|(shard, list)| {
                let index = list.with_lock(|list| list.pop(self.links))?;
                log::trace!("shard {local}: stole frame {index} from shard {shard}");
                Some(index)
            })
    }

    /// Allocates one 4096-byte page of physical memory.
    ///
    /// Returns `None` if every shard is empty. Never waits for a page to be
    /// freed.
    ///
    /// The allocated page is filled with [`ALLOC_JUNK`] to help detect
    /// uninitialized usage.
    pub fn alloc(&self) -> Option<PhysAddr> {
        let index = {
            let _intr = C::push_disabled();
            let local = self.local_shard();
            // the local lock is released before any remote shard is probed.
            let index = self.shards[local].with_lock(|list| list.pop(self.links));
            index.or_else(|| self.steal(local))?
        };

        let pa = self.frame_addr(index);
        unsafe {
            pa.as_mut_ptr::<u8>().write_bytes(ALLOC_JUNK, PAGE_SIZE);
        }
        Some(pa)
    }

    /// Allocates one 4096-byte page of physical memory and zeroes it.
    ///
    /// Returns `None` if every shard is empty.
    pub fn alloc_zeroed(&self) -> Option<PhysAddr> {
        let pa = self.alloc()?;
        unsafe {
            pa.as_mut_ptr::<u8>().write_bytes(0, PAGE_SIZE);
        }
        Some(pa)
    }

    /// Frees the page of physical memory pointed at by `pa`.
    ///
    /// The page is filled with [`FREE_JUNK`] to catch dangling references,
    /// then pushed onto the calling CPU's shard.
    ///
    /// # Safety
    ///
    /// The page must not be accessed after it has been freed.
    ///
    /// # Panics
    ///
    /// This function will panic if:
    ///
    /// - The given page is not page-aligned.
    /// - The given page is not within the managed heap range.
    /// - The given page is already free.
    pub unsafe fn free(&self, pa: PhysAddr) {
        let _intr = C::push_disabled();
        let Some(index) = self.frame_index(pa) else {
            panic!(
                "free: invalid page {pa:#x} (heap {:#x}..{:#x})",
                self.heap.start, self.heap.end
            );
        };

        let claimed = self.links[index].compare_exchange(
            LINK_ALLOCATED,
            LINK_END,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(claimed.is_ok(), "free: double free of page {pa:#x}");

        // Fill with junk to catch dangling refs.
        unsafe {
            pa.as_mut_ptr::<u8>().write_bytes(FREE_JUNK, PAGE_SIZE);
        }

        let local = self.local_shard();
        self.shards[local].with_lock(|list| list.push(self.links, index));
    }
}
