//! Copy-on-write fault resolution.

use kernel_params::PAGE_SIZE;
use page_alloc::{FrameManager, PhysAddr};

use crate::{PageTable, PtEntryFlags, VirtAddr, VmError};

impl PageTable {
    /// Returns `true` if the page containing `va` is mapped copy-on-write.
    ///
    /// Unmapped pages are not copy-on-write.
    pub fn is_cow_page(&self, va: usize) -> Result<bool, VmError> {
        let va = VirtAddr::new(va)?.page_rounddown();
        Ok(self.find(va).is_some_and(|pte| pte.is_cow()))
    }

    /// Gives the page containing `va` a writable frame of its own.
    ///
    /// Called on a store fault to a copy-on-write page. If no other mapping
    /// shares the frame, the entry is made writable in place. Otherwise the
    /// contents are copied to a new frame, the entry is pointed at it, and the
    /// shared frame loses one reference.
    ///
    /// Returns the physical address now backing the page. On failure the
    /// mapping is left as it was.
    pub fn resolve_cow<F>(&mut self, frames: &F, va: usize) -> Result<PhysAddr, VmError>
    where
        F: FrameManager + ?Sized,
    {
        let va = VirtAddr::new(va)?.page_rounddown();
        let pte = match self.walk(frames, va, false) {
            Ok(pte) if pte.is_valid() => pte,
            _ => return Err(VmError::VirtualPageNotMapped(va)),
        };
        if !pte.is_cow() {
            return Err(VmError::NotCopyOnWrite(va));
        }

        let old_pa = pte.phys_addr();
        let flags = (pte.flags() - PtEntryFlags::C) | PtEntryFlags::W;

        if frames.frame_refs(old_pa)? == 1 {
            pte.set_flags(flags);
            return Ok(old_pa);
        }

        let Ok(new_pa) = frames.alloc_frame() else {
            log::warn!("resolve_cow: no free page for {va:#x}");
            return Err(VmError::CowResolutionFailed(va));
        };
        unsafe {
            new_pa
                .as_mut_ptr::<u8>()
                .copy_from_nonoverlapping(old_pa.as_ptr::<u8>(), PAGE_SIZE);
        }

        let old = pte.take();
        let mapped = unsafe {
            self.map_pages(frames, va, PAGE_SIZE, new_pa, flags - PtEntryFlags::V)
        };
        if let Err(e) = mapped {
            unsafe { frames.release_frame(new_pa) };
            if let Ok(pte) = self.walk(frames, va, false) {
                *pte = old;
            }
            log::warn!("resolve_cow: cannot map {va:#x}: {e}");
            return Err(VmError::CowResolutionFailed(va));
        }

        unsafe { frames.release_frame(old_pa) };
        log::trace!("resolve_cow: copied {old_pa:#x} to {new_pa:#x} for {va:#x}");
        Ok(new_pa)
    }
}

#[cfg(test)]
mod tests {
    use std::iter;

    use page_alloc::{
        AllocatorConfig,
        testing::{self, HostPageManager, SHARED_CONFIGS, host_page_manager},
    };

    use super::*;

    const DATA: u8 = 0xA5;

    fn va(addr: usize) -> VirtAddr {
        VirtAddr::new(addr).unwrap()
    }

    /// A parent with one writable page filled with [`DATA`], and a child
    /// sharing it copy-on-write.
    fn forked(frames: &HostPageManager) -> (PageTable, PageTable, PhysAddr) {
        let mut parent = PageTable::new(frames).unwrap();
        let pa = frames.alloc_page().unwrap();
        unsafe {
            pa.as_mut_ptr::<u8>().write_bytes(DATA, PAGE_SIZE);
            parent
                .map_pages(frames, va(0), PAGE_SIZE, pa, PtEntryFlags::URW)
                .unwrap();
        }
        let mut child = PageTable::new(frames).unwrap();
        child.clone_cow_from(&mut parent, frames, PAGE_SIZE).unwrap();
        (parent, child, pa)
    }

    #[test]
    fn test_is_cow_page() {
        let frames = host_page_manager(32, AllocatorConfig::default());
        let (parent, child, _) = forked(&frames);

        assert_eq!(parent.is_cow_page(0x10), Ok(true));
        assert_eq!(child.is_cow_page(0), Ok(true));
        assert_eq!(child.is_cow_page(PAGE_SIZE), Ok(false));
        assert_eq!(child.is_cow_page(1 << 32), Ok(false));
        assert_eq!(
            child.is_cow_page(VirtAddr::MAX),
            Err(VmError::TooLargeVirtualAddress(VirtAddr::MAX))
        );
    }

    #[test]
    fn test_resolve_copies_shared_page() {
        for config in SHARED_CONFIGS {
            let frames = host_page_manager(32, config);
            let total = frames.info().total_pages;
            let (mut parent, mut child, shared) = forked(&frames);
            testing::assert_conserved(&frames);

            let new_pa = child.resolve_cow(&frames, 0x123).unwrap();
            assert_ne!(new_pa, shared);
            assert_eq!(child.walk_addr(va(0)), Ok(new_pa));
            assert_eq!(frames.ref_count(shared), Ok(1));
            assert_eq!(frames.ref_count(new_pa), Ok(1));
            testing::assert_conserved(&frames);

            let pte = child.find(va(0)).unwrap();
            assert!(pte.flags().contains(PtEntryFlags::URW));
            assert!(!pte.is_cow());

            // the copy is private to the child
            assert!(unsafe { testing::page_bytes(new_pa) }.iter().all(|b| *b == DATA));
            unsafe { new_pa.as_mut_ptr::<u8>().write_bytes(0, PAGE_SIZE) };
            assert!(unsafe { testing::page_bytes(shared) }.iter().all(|b| *b == DATA));

            // the parent is the last user of the old frame and keeps it
            assert_eq!(parent.is_cow_page(0), Ok(true));
            assert_eq!(parent.resolve_cow(&frames, 0), Ok(shared));
            assert_eq!(parent.is_cow_page(0), Ok(false));
            testing::assert_conserved(&frames);

            assert_eq!(child.destroy(&frames), 1 + 3);
            assert_eq!(parent.destroy(&frames), 1 + 3);
            assert_eq!(frames.info().free_pages, total);
            testing::assert_conserved(&frames);
        }
    }

    #[test]
    fn test_resolve_exclusive_page_in_place() {
        for config in SHARED_CONFIGS {
            let frames = host_page_manager(32, config);
            let (parent, mut child, shared) = forked(&frames);
            assert_eq!(parent.destroy(&frames), 1 + 3);
            assert_eq!(frames.ref_count(shared), Ok(1));
            testing::assert_conserved(&frames);

            let free = frames.info().free_pages;
            assert_eq!(child.resolve_cow(&frames, PAGE_SIZE - 1), Ok(shared));
            assert_eq!(frames.info().free_pages, free);

            let pte = child.find(va(0)).unwrap();
            assert!(pte.flags().contains(PtEntryFlags::W));
            assert!(!pte.flags().contains(PtEntryFlags::C));
            assert_eq!(frames.ref_count(shared), Ok(1));
            testing::assert_conserved(&frames);
        }
    }

    #[test]
    fn test_resolve_without_free_page() {
        for config in SHARED_CONFIGS {
            let frames = host_page_manager(32, config);
            let (_parent, mut child, shared) = forked(&frames);
            let hoard = iter::from_fn(|| frames.alloc_page().ok()).count();
            assert!(hoard > 0);

            assert_eq!(
                child.resolve_cow(&frames, 0),
                Err(VmError::CowResolutionFailed(va(0)))
            );
            let pte = child.find(va(0)).unwrap();
            assert!(pte.is_cow());
            assert_eq!(pte.phys_addr(), shared);
            assert_eq!(frames.ref_count(shared), Ok(2));
            testing::assert_conserved(&frames);
        }
    }

    #[test]
    fn test_resolve_rejects_other_pages() {
        let frames = host_page_manager(32, AllocatorConfig::default());
        let mut pt = PageTable::new(&frames).unwrap();
        let pa = frames.alloc_page().unwrap();
        unsafe {
            pt.map_pages(&frames, va(0), PAGE_SIZE, pa, PtEntryFlags::URW)
                .unwrap();
        }

        assert_eq!(
            pt.resolve_cow(&frames, 0),
            Err(VmError::NotCopyOnWrite(va(0)))
        );
        assert_eq!(
            pt.resolve_cow(&frames, PAGE_SIZE),
            Err(VmError::VirtualPageNotMapped(va(PAGE_SIZE)))
        );
        assert_eq!(
            pt.resolve_cow(&frames, 1 << 31),
            Err(VmError::VirtualPageNotMapped(va(1 << 31)))
        );
        assert_eq!(
            pt.resolve_cow(&frames, usize::MAX),
            Err(VmError::TooLargeVirtualAddress(usize::MAX))
        );
    }
}
