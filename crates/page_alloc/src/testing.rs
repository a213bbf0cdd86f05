//! Host-side stand-ins for physical memory.
//!
//! Host tests have no physical memory to hand over, so they leak page-aligned
//! buffers from the test heap and manage those instead.

use core::{ops::Range, slice};
use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard};

use kernel_params::PAGE_SIZE;
use sync_api::{Cpu, Mutex, ThreadCpu};

use crate::{
    AllocatorConfig, FreeList, PageManager, PhysAddr, RefCounting, RefCounts, Sharding,
};

/// Both shardings, with reference counting.
pub const SHARED_CONFIGS: [AllocatorConfig; 2] = [
    AllocatorConfig::new(Sharding::Global, RefCounting::Shared),
    AllocatorConfig::new(Sharding::PerCpu, RefCounting::Shared),
];

#[repr(C, align(4096))]
#[derive(Clone)]
struct Page([u8; PAGE_SIZE]);

const _: () = assert!(align_of::<Page>() == PAGE_SIZE);

/// A page-aligned buffer that lives until the process exits.
#[derive(Debug, Clone)]
pub struct HostMemory {
    range: Range<PhysAddr>,
}

impl HostMemory {
    /// Leaks `pages` zeroed pages from the heap.
    #[must_use]
    pub fn leak(pages: usize) -> Self {
        let pages = vec![Page([0; PAGE_SIZE]); pages].leak();
        let range = pages.as_mut_ptr_range();
        Self {
            range: PhysAddr::from_ptr(range.start)..PhysAddr::from_ptr(range.end),
        }
    }

    /// Returns the "physical" address range of the buffer.
    #[must_use]
    pub fn range(&self) -> Range<PhysAddr> {
        self.range.clone()
    }
}

/// Returns the contents of the page at `pa`.
///
/// # Safety
///
/// `pa` must be a page inside a [`HostMemory`] buffer, and nothing may write
/// to that page while the returned slice is alive.
#[must_use]
pub unsafe fn page_bytes(pa: PhysAddr) -> &'static [u8] {
    unsafe { slice::from_raw_parts(pa.as_ptr::<u8>(), PAGE_SIZE) }
}

/// A [`PageManager`] locked with `std::sync::Mutex`, with every thread
/// playing one CPU.
pub type HostPageManager = PageManager<StdMutex<FreeList>, StdMutex<RefCounts>, ThreadCpu>;

/// Creates a [`HostPageManager`] over `pages` pages of leaked host memory.
///
/// Part of the memory holds the frame metadata, so fewer than `pages` frames
/// are handed out.
#[must_use]
pub fn host_page_manager(pages: usize, config: AllocatorConfig) -> HostPageManager {
    let memory = HostMemory::leak(pages);
    unsafe { HostPageManager::new(memory.range(), config) }
}

/// A `std::sync::Mutex` that panics when locked while [`ThreadCpu`] has
/// interrupts enabled.
///
/// On a real hart such a lock could be re-entered from an interrupt handler
/// and spin forever.
#[derive(Debug)]
pub struct IrqCheckedMutex<T>(StdMutex<T>);

impl<T> Mutex for IrqCheckedMutex<T> {
    type Data = T;
    type Guard<'a>
        = StdMutexGuard<'a, T>
    where
        T: 'a;

    fn new(data: Self::Data) -> Self {
        Self(StdMutex::new(data))
    }

    fn lock(&self) -> Self::Guard<'_> {
        assert!(
            ThreadCpu::disabled_depth() > 0,
            "lock taken with interrupts enabled"
        );
        Mutex::lock(&self.0)
    }
}

/// A [`PageManager`] whose locks check the interrupt state.
pub type CheckedPageManager =
    PageManager<IrqCheckedMutex<FreeList>, IrqCheckedMutex<RefCounts>, ThreadCpu>;

/// Creates a [`CheckedPageManager`] over `pages` pages of leaked host memory.
#[must_use]
pub fn checked_page_manager(pages: usize, config: AllocatorConfig) -> CheckedPageManager {
    let memory = HostMemory::leak(pages);
    unsafe { CheckedPageManager::new(memory.range(), config) }
}

/// Checks that every frame is either free or referenced, never both.
///
/// Walks the whole heap, so the manager must not be in use by other threads.
///
/// # Panics
///
/// Panics if a frame's reference count disagrees with its allocator state, or
/// if the free and referenced totals do not add up.
pub fn assert_conserved<S, R, C>(manager: &PageManager<S, R, C>)
where
    S: Mutex<Data = FreeList>,
    R: Mutex<Data = RefCounts>,
    C: Cpu,
{
    let heap = manager.allocator().heap_range();
    for addr in (heap.start.addr()..heap.end.addr()).step_by(PAGE_SIZE) {
        let pa = PhysAddr::new(addr);
        let refs = match manager.ref_count(pa) {
            Ok(refs) => refs,
            Err(e) => panic!("frame {pa:#x}: {e}"),
        };
        assert_eq!(
            refs > 0,
            manager.allocator().is_allocated(pa),
            "frame {pa:#x} has {refs} reference(s)"
        );
    }

    let info = manager.info();
    assert_eq!(
        info.free_pages + info.referenced_pages,
        info.total_pages,
        "{info:?}"
    );
}
