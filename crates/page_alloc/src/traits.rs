use crate::{PageAllocError, PhysAddr};

/// The frame operations consumed by page-table code.
///
/// Every frame a page table installs or drops goes through this trait, so
/// reference counts stay consistent with the mappings.
pub trait FrameManager {
    /// Allocates a frame with unspecified contents and one reference.
    fn alloc_frame(&self) -> Result<PhysAddr, PageAllocError>;

    /// Allocates a zero-filled frame with one reference.
    fn alloc_zeroed_frame(&self) -> Result<PhysAddr, PageAllocError>;

    /// Drops one reference to frame `pa`, freeing it with the last one.
    ///
    /// # Safety
    ///
    /// The caller must own the reference being dropped, and must not access
    /// the frame through it afterwards.
    unsafe fn release_frame(&self, pa: PhysAddr);

    /// Adds a reference to the allocated frame `pa`.
    fn share_frame(&self, pa: PhysAddr) -> Result<u32, PageAllocError>;

    /// Returns the number of references to frame `pa`.
    fn frame_refs(&self, pa: PhysAddr) -> Result<u32, PageAllocError>;

    /// Returns `true` if `pa` is a frame handed out by this manager.
    fn is_managed(&self, pa: PhysAddr) -> bool;
}
