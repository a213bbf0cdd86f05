use crate::PhysAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PageAllocError {
    #[error("no free page")]
    NoFreePage,
    #[error("invalid page address: {0:#x}")]
    InvalidAddress(PhysAddr),
    #[error("page sharing is not supported without reference counting")]
    SharingUnsupported,
}
