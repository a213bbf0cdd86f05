//! This module combines the frame allocator with the per-frame reference
//! counts, and is the only path through which frames are allocated and
//! freed.

use core::{fmt, ops::Range};

use kernel_params::PAGE_SIZE;
use sync_api::{Cpu, Mutex};

use crate::{
    AllocatorConfig, FrameManager, FreeList, PageAllocError, PageFrameAllocator, PageRefTable,
    PageRound as _, PhysAddr, RefCounting, RefCounts, meta,
};

/// Memory usage snapshot returned by [`PageManager::info`].
///
/// Outside of concurrent updates, `free_pages + referenced_pages` equals
/// `total_pages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free_pages: usize,
    pub referenced_pages: usize,
    pub total_pages: usize,
    pub page_size: usize,
}

/// Allocates, shares, and frees frames of physical memory.
///
/// With [`RefCounting::Shared`] every allocated frame carries a reference
/// count, and [`PageManager::free_page`] returns a frame to the allocator only
/// when its last reference goes away. With [`RefCounting::Exclusive`] no
/// counts are kept and every free goes straight to the allocator.
///
/// Every operation runs with interrupts disabled on the current CPU, so the
/// shard and reference locks may be spin locks shared with interrupt
/// handlers.
pub struct PageManager<ShardMutex, RefMutex, C> {
    allocator: PageFrameAllocator<ShardMutex, C>,
    refs: Option<PageRefTable<RefMutex>>,
    config: AllocatorConfig,
}

impl<ShardMutex, RefMutex, C> fmt::Debug for PageManager<ShardMutex, RefMutex, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageManager")
            .field("allocator", &self.allocator)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<ShardMutex, RefMutex, C> PageManager<ShardMutex, RefMutex, C>
where
    ShardMutex: Mutex<Data = FreeList>,
    RefMutex: Mutex<Data = RefCounts>,
    C: Cpu,
{
    /// Creates a `PageManager` over the given range of physical memory.
    ///
    /// The reference table (if any) and the allocator's link array are
    /// placed at the start of the range, in that order.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the provided range of physical memory is
    /// valid, accessible through its physical addresses, and not used by
    /// other parts of the system.
    ///
    /// # Panics
    ///
    /// Panics if the range is too small to hold the metadata and at least one
    /// frame.
    #[must_use]
    pub unsafe fn new(range: Range<PhysAddr>, config: AllocatorConfig) -> Self {
        assert!(range.start <= range.end);
        let max_pages = range
            .end
            .page_rounddown()
            .addr()
            .saturating_sub(range.start.page_roundup().addr())
            / PAGE_SIZE;

        let (counts, rest) = match config.ref_counting {
            RefCounting::Shared => {
                let (counts, rest) = unsafe { meta::carve(range, max_pages, || 0_u32) };
                (Some(counts), rest)
            }
            RefCounting::Exclusive => (None, range),
        };

        let allocator = unsafe { PageFrameAllocator::new(rest, config.sharding) };
        let refs = counts.map(|counts| PageRefTable::new(counts, allocator.heap_range()));

        let heap = allocator.heap_range();
        log::info!(
            "page manager: {} frames in {:#x}..{:#x}, {} shard(s), {:?} references",
            allocator.total_pages(),
            heap.start,
            heap.end,
            allocator.shard_count(),
            config.ref_counting,
        );

        Self {
            allocator,
            refs,
            config,
        }
    }

    /// Returns the configuration the manager was created with.
    #[must_use]
    pub fn config(&self) -> AllocatorConfig {
        self.config
    }

    /// Returns the underlying frame allocator.
    #[must_use]
    pub fn allocator(&self) -> &PageFrameAllocator<ShardMutex, C> {
        &self.allocator
    }

    /// Checks if the given address is a frame managed by this manager.
    #[must_use]
    pub fn is_heap_addr(&self, pa: PhysAddr) -> bool {
        self.allocator.is_heap_addr(pa)
    }

    fn take_ownership(&self, pa: PhysAddr) -> PhysAddr {
        if let Some(refs) = &self.refs {
            let _intr = C::push_disabled();
            refs.set_exclusive(pa);
        }
        pa
    }

    /// Allocates one 4096-byte page of physical memory.
    ///
    /// The page is filled with junk and has a reference count of one.
    pub fn alloc_page(&self) -> Result<PhysAddr, PageAllocError> {
        let pa = self.allocator.alloc().ok_or(PageAllocError::NoFreePage)?;
        Ok(self.take_ownership(pa))
    }

    /// Allocates one 4096-byte zeroed page of physical memory.
    pub fn alloc_zeroed_page(&self) -> Result<PhysAddr, PageAllocError> {
        let pa = self
            .allocator
            .alloc_zeroed()
            .ok_or(PageAllocError::NoFreePage)?;
        Ok(self.take_ownership(pa))
    }

    /// Drops one reference to the page at `pa`.
    ///
    /// The page goes back to the allocator when no reference remains, or
    /// immediately if it was never counted.
    ///
    /// # Safety
    ///
    /// The caller must own the reference being dropped, and must not access
    /// the page through it afterwards.
    ///
    /// # Panics
    ///
    /// Panics if `pa` is not a page managed by this manager, or if the page is
    /// already free.
    pub unsafe fn free_page(&self, pa: PhysAddr) {
        assert!(
            self.allocator.is_heap_addr(pa),
            "free_page: invalid page {pa:#x}"
        );

        if let Some(refs) = &self.refs {
            let release = {
                let _intr = C::push_disabled();
                refs.release(pa)
            };
            if !release.should_free() {
                log::trace!("free_page: {pa:#x} still shared ({release:?})");
                return;
            }
        }
        unsafe { self.allocator.free(pa) }
    }

    /// Adds a reference to the allocated page at `pa`.
    ///
    /// Returns the new reference count.
    ///
    /// # Panics
    ///
    /// Panics if the page is free.
    pub fn increase_ref(&self, pa: PhysAddr) -> Result<u32, PageAllocError> {
        let refs = self
            .refs
            .as_ref()
            .ok_or(PageAllocError::SharingUnsupported)?;
        let _intr = C::push_disabled();
        refs.increase(pa)
    }

    /// Returns the number of references to the page at `pa`.
    ///
    /// Without reference counting, an allocated page always has one.
    pub fn ref_count(&self, pa: PhysAddr) -> Result<u32, PageAllocError> {
        match &self.refs {
            Some(refs) => {
                let _intr = C::push_disabled();
                refs.count(pa)
            }
            None if self.allocator.is_heap_addr(pa) => {
                Ok(u32::from(self.allocator.is_allocated(pa)))
            }
            None => Err(PageAllocError::InvalidAddress(pa)),
        }
    }

    /// Retrieves memory information, including the number of free,
    /// referenced, and total pages.
    #[must_use]
    pub fn info(&self) -> MemoryInfo {
        let total_pages = self.allocator.total_pages();
        let free_pages = self.allocator.free_pages();
        let referenced_pages = match &self.refs {
            Some(refs) => {
                let _intr = C::push_disabled();
                refs.referenced_pages()
            }
            None => self.allocator.allocated_pages(),
        };
        MemoryInfo {
            free_pages,
            referenced_pages,
            total_pages,
            page_size: PAGE_SIZE,
        }
    }
}

impl<ShardMutex, RefMutex, C> FrameManager for PageManager<ShardMutex, RefMutex, C>
where
    ShardMutex: Mutex<Data = FreeList>,
    RefMutex: Mutex<Data = RefCounts>,
    C: Cpu,
{
    fn alloc_frame(&self) -> Result<PhysAddr, PageAllocError> {
        self.alloc_page()
    }

    fn alloc_zeroed_frame(&self) -> Result<PhysAddr, PageAllocError> {
        self.alloc_zeroed_page()
    }

    unsafe fn release_frame(&self, pa: PhysAddr) {
        unsafe { self.free_page(pa) }
    }

    fn share_frame(&self, pa: PhysAddr) -> Result<u32, PageAllocError> {
        self.increase_ref(pa)
    }

    fn frame_refs(&self, pa: PhysAddr) -> Result<u32, PageAllocError> {
        self.ref_count(pa)
    }

    fn is_managed(&self, pa: PhysAddr) -> bool {
        self.is_heap_addr(pa)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, thread};

    use kernel_params::NCPU;
    use sync_api::{SpinLock, ThreadCpu};

    use super::*;
    use crate::{
        Sharding,
        testing::{self, HostMemory, host_page_manager},
    };

    #[test]
    fn test_metadata_is_carved() {
        for config in testing::SHARED_CONFIGS {
            let manager = host_page_manager(64, config);
            let info = manager.info();
            assert_eq!(info.page_size, PAGE_SIZE);
            assert!(info.total_pages > 0 && info.total_pages < 64);
            assert_eq!(info.free_pages, info.total_pages);
            assert_eq!(info.referenced_pages, 0);
        }
    }

    #[test]
    fn test_conservation() {
        for config in testing::SHARED_CONFIGS {
            let manager = host_page_manager(32, config);
            let total = manager.info().total_pages;

            let pages = (0..total / 2)
                .map(|_| manager.alloc_page().unwrap())
                .collect::<Vec<_>>();
            assert_eq!(manager.info().free_pages, total - pages.len());
            assert_eq!(manager.info().referenced_pages, pages.len());
            testing::assert_conserved(&manager);

            manager.increase_ref(pages[0]).unwrap();
            unsafe { manager.free_page(pages[0]) };
            testing::assert_conserved(&manager);

            for pa in pages {
                unsafe { manager.free_page(pa) };
                testing::assert_conserved(&manager);
            }
            assert_eq!(manager.info().free_pages, total);
        }
    }

    #[test]
    fn test_round_trip() {
        for config in testing::SHARED_CONFIGS {
            let manager = host_page_manager(16, config);
            let pa = manager.alloc_zeroed_page().unwrap();
            assert!(unsafe { testing::page_bytes(pa) }.iter().all(|b| *b == 0));
            assert_eq!(manager.ref_count(pa), Ok(1));
            unsafe { manager.free_page(pa) };
            assert_eq!(manager.ref_count(pa), Ok(0));
            assert!(!manager.allocator().is_allocated(pa));
        }
    }

    #[test]
    fn test_shared_page_needs_every_release() {
        const N: u32 = 5;

        for config in testing::SHARED_CONFIGS {
            let manager = host_page_manager(16, config);
            let total = manager.info().total_pages;
            let pa = manager.alloc_page().unwrap();
            for n in 2..=N {
                assert_eq!(manager.increase_ref(pa), Ok(n));
            }

            for remaining in (1..N).rev() {
                unsafe { manager.free_page(pa) };
                assert_eq!(manager.ref_count(pa), Ok(remaining));
                assert!(manager.allocator().is_allocated(pa));
                assert_eq!(manager.info().free_pages, total - 1);
            }
            unsafe { manager.free_page(pa) };
            assert_eq!(manager.info().free_pages, total);
        }
    }

    #[test]
    fn test_exhaustion() {
        for config in testing::SHARED_CONFIGS {
            let manager = host_page_manager(24, config);
            let total = manager.info().total_pages;

            let mut pages = HashSet::new();
            for _ in 0..total {
                assert!(pages.insert(manager.alloc_page().unwrap()));
            }
            assert_eq!(manager.alloc_page(), Err(PageAllocError::NoFreePage));
            assert_eq!(manager.alloc_zeroed_page(), Err(PageAllocError::NoFreePage));

            for pa in pages {
                unsafe { manager.free_page(pa) };
            }
            assert_eq!(manager.info().free_pages, total);
        }
    }

    #[test]
    fn test_exclusive_pages() {
        let config = AllocatorConfig::new(Sharding::PerCpu, RefCounting::Exclusive);
        let manager = host_page_manager(16, config);
        let total = manager.info().total_pages;

        let pa = manager.alloc_page().unwrap();
        assert_eq!(manager.ref_count(pa), Ok(1));
        assert_eq!(
            manager.increase_ref(pa),
            Err(PageAllocError::SharingUnsupported)
        );
        assert_eq!(manager.info().referenced_pages, 1);
        testing::assert_conserved(&manager);
        unsafe { manager.free_page(pa) };
        assert_eq!(manager.ref_count(pa), Ok(0));
        assert_eq!(manager.info().free_pages, total);
        testing::assert_conserved(&manager);

        let outside = manager.allocator().heap_range().end;
        assert_eq!(
            manager.ref_count(outside),
            Err(PageAllocError::InvalidAddress(outside))
        );
    }

    #[test]
    fn test_exclusive_has_more_frames() {
        let shared = host_page_manager(
            256,
            AllocatorConfig::new(Sharding::Global, RefCounting::Shared),
        );
        let exclusive = host_page_manager(
            256,
            AllocatorConfig::new(Sharding::Global, RefCounting::Exclusive),
        );
        assert!(exclusive.info().total_pages >= shared.info().total_pages);
    }

    #[test]
    fn test_concurrent_share_and_release() {
        for config in testing::SHARED_CONFIGS {
            let manager = host_page_manager(8 * NCPU, config);
            let total = manager.info().total_pages;
            let pa = manager.alloc_page().unwrap();

            thread::scope(|s| {
                for cpu in 0..NCPU {
                    let manager = &manager;
                    s.spawn(move || {
                        ThreadCpu::set_current(cpu);
                        for _ in 0..100 {
                            manager.increase_ref(pa).unwrap();
                            let own = manager.alloc_page().unwrap();
                            unsafe {
                                manager.free_page(own);
                                manager.free_page(pa);
                            }
                        }
                    });
                }
            });

            assert_eq!(manager.ref_count(pa), Ok(1));
            unsafe { manager.free_page(pa) };
            assert_eq!(manager.info().free_pages, total);
        }
    }

    #[test]
    fn test_spin_locked_manager() {
        type SpinPageManager = PageManager<SpinLock<FreeList>, SpinLock<RefCounts>, ThreadCpu>;

        let memory = HostMemory::leak(32);
        let manager = unsafe { SpinPageManager::new(memory.range(), AllocatorConfig::default()) };
        let total = manager.info().total_pages;

        thread::scope(|s| {
            for cpu in 0..NCPU {
                let manager = &manager;
                s.spawn(move || {
                    ThreadCpu::set_current(cpu);
                    for _ in 0..50 {
                        if let Ok(pa) = manager.alloc_page() {
                            unsafe { manager.free_page(pa) };
                        }
                    }
                });
            }
        });
        assert_eq!(manager.info().free_pages, total);
    }

    #[test]
    fn test_locks_taken_with_interrupts_disabled() {
        let exclusive = AllocatorConfig::new(Sharding::PerCpu, RefCounting::Exclusive);
        for config in testing::SHARED_CONFIGS.into_iter().chain([exclusive]) {
            let manager = testing::checked_page_manager(16, config);
            let total = manager.info().total_pages;

            let pa = manager.alloc_page().unwrap();
            let zeroed = manager.alloc_zeroed_page().unwrap();
            if config.ref_counting == RefCounting::Shared {
                assert_eq!(manager.increase_ref(pa), Ok(2));
                unsafe { manager.free_page(pa) };
            }
            assert_eq!(manager.ref_count(pa), Ok(1));
            assert_eq!(manager.info().referenced_pages, 2);
            assert!(manager.allocator().shard_free_pages(0) <= total);
            testing::assert_conserved(&manager);

            unsafe {
                manager.free_page(pa);
                manager.free_page(zeroed);
            }
            assert_eq!(manager.info().free_pages, total);
            assert_eq!(ThreadCpu::disabled_depth(), 0);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free() {
        let manager = host_page_manager(8, AllocatorConfig::default());
        let pa = manager.alloc_page().unwrap();
        unsafe {
            manager.free_page(pa);
            manager.free_page(pa);
        }
    }

    #[test]
    #[should_panic(expected = "invalid page")]
    fn test_free_outside_heap() {
        let manager = host_page_manager(8, AllocatorConfig::default());
        let end = manager.allocator().heap_range().end;
        unsafe { manager.free_page(end) };
    }

    #[test]
    #[should_panic(expected = "is not allocated")]
    fn test_share_free_page() {
        let manager = host_page_manager(8, AllocatorConfig::default());
        let pa = manager.alloc_page().unwrap();
        unsafe { manager.free_page(pa) };
        let _ = manager.increase_ref(pa);
    }
}
