use page_alloc::{PageAllocError, PhysAddr};

use crate::VirtAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("no free page")]
    NoFreePage,
    #[error("too large virtual address: {0:#x}")]
    TooLargeVirtualAddress(usize),
    #[error("virtual page not mapped: {0:#x}")]
    VirtualPageNotMapped(VirtAddr),
    #[error("not a copy-on-write page: {0:#x}")]
    NotCopyOnWrite(VirtAddr),
    #[error("copy-on-write resolution failed: {0:#x}")]
    CowResolutionFailed(VirtAddr),
    #[error("invalid page address: {0:#x}")]
    InvalidAddress(PhysAddr),
    #[error("page sharing is not supported without reference counting")]
    SharingUnsupported,
}

impl From<PageAllocError> for VmError {
    fn from(error: PageAllocError) -> Self {
        match error {
            PageAllocError::NoFreePage => Self::NoFreePage,
            PageAllocError::InvalidAddress(pa) => Self::InvalidAddress(pa),
            PageAllocError::SharingUnsupported => Self::SharingUnsupported,
        }
    }
}
