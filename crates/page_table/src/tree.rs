//! A three-level Sv39 page table whose frames come from a [`FrameManager`].
//!
//! The table does not free itself on drop: tearing it down needs the frame
//! manager, so the owner calls [`PageTable::destroy`] (or
//! [`PageTable::destroy_mirror`] for a kernel-side mirror).

use core::fmt;

use dataview::Pod;
use kernel_params::PAGE_SIZE;
use page_alloc::{FrameManager, PageRound as _, PhysAddr};

use crate::{PtEntry, PtEntryFlags, VirtAddr, VmError};

/// The 512 entries of one page table level, filling one frame.
#[repr(transparent)]
#[derive(Pod)]
pub(crate) struct PageTableEntries(pub(crate) [PtEntry; 512]);

const _: () = assert!(size_of::<PageTableEntries>() == PAGE_SIZE);

impl PageTableEntries {
    /// Returns the table stored in frame `pa`.
    ///
    /// # Safety
    ///
    /// `pa` must be a frame holding a page table, and the returned reference
    /// must not outlive the frame or alias a mutable reference to it.
    pub(crate) unsafe fn from_frame<'a>(pa: PhysAddr) -> &'a Self {
        unsafe { pa.as_non_null::<Self>().as_ref() }
    }

    /// Returns the table stored in frame `pa`, mutably.
    ///
    /// # Safety
    ///
    /// Same as [`Self::from_frame`], and the frame must not be otherwise
    /// referenced.
    pub(crate) unsafe fn from_frame_mut<'a>(pa: PhysAddr) -> &'a mut Self {
        unsafe { pa.as_non_null::<Self>().as_mut() }
    }
}

/// A user or kernel address space.
pub struct PageTable {
    root: PhysAddr,
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("root", &self.root)
            .finish()
    }
}

impl PageTable {
    /// Allocates an empty page table.
    pub fn new<F>(frames: &F) -> Result<Self, VmError>
    where
        F: FrameManager + ?Sized,
    {
        let root = frames.alloc_zeroed_frame()?;
        Ok(Self { root })
    }

    /// Returns the physical address of the root table.
    #[must_use]
    pub fn root_addr(&self) -> PhysAddr {
        self.root
    }

    fn root(&self) -> &PageTableEntries {
        unsafe { PageTableEntries::from_frame(self.root) }
    }

    fn root_mut(&mut self) -> &mut PageTableEntries {
        unsafe { PageTableEntries::from_frame_mut(self.root) }
    }

    /// Returns the level-0 entry for `va`, allocating missing intermediate
    /// tables if `alloc` is `true`.
    ///
    /// The returned entry may be invalid.
    pub fn walk<F>(
        &mut self,
        frames: &F,
        va: VirtAddr,
        alloc: bool,
    ) -> Result<&mut PtEntry, VmError>
    where
        F: FrameManager + ?Sized,
    {
        let mut pt = self.root_mut();
        for level in (1..=2).rev() {
            let pte = &mut pt.0[va.level_idx(level)];
            if !pte.is_valid() {
                if !alloc {
                    return Err(VmError::VirtualPageNotMapped(va));
                }
                let table = frames.alloc_zeroed_frame()?;
                unsafe { pte.set(table, PtEntryFlags::V) };
            }
            assert!(pte.is_non_leaf(), "walk: super page at {va:#x}");
            pt = unsafe { PageTableEntries::from_frame_mut(pte.phys_addr()) };
        }
        Ok(&mut pt.0[va.level_idx(0)])
    }

    /// Returns the level-0 entry for `va` without allocating.
    pub(crate) fn find(&self, va: VirtAddr) -> Option<&PtEntry> {
        let mut pt = self.root();
        for level in (1..=2).rev() {
            let pte = &pt.0[va.level_idx(level)];
            if !pte.is_non_leaf() {
                return None;
            }
            pt = unsafe { PageTableEntries::from_frame(pte.phys_addr()) };
        }
        Some(&pt.0[va.level_idx(0)])
    }

    /// Looks up a virtual address and returns the physical address of its
    /// page.
    ///
    /// Only user-accessible pages are reported.
    pub fn walk_addr(&self, va: VirtAddr) -> Result<PhysAddr, VmError> {
        match self.find(va) {
            Some(pte) if pte.is_leaf() && pte.flags().contains(PtEntryFlags::U) => {
                Ok(pte.phys_addr())
            }
            _ => Err(VmError::VirtualPageNotMapped(va)),
        }
    }

    /// Creates entries for virtual addresses starting at `va` that refer to
    /// physical addresses starting at `pa`.
    ///
    /// # Safety
    ///
    /// The physical pages must be valid for the permissions given, and owned
    /// by the mappings being created.
    ///
    /// # Panics
    ///
    /// Panics if `va`, `pa` or `size` is not page-aligned, if `size` is zero,
    /// if `perm` has none of `R`, `W`, `X`, or if a page is already mapped.
    pub unsafe fn map_pages<F>(
        &mut self,
        frames: &F,
        va: VirtAddr,
        size: usize,
        pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<(), VmError>
    where
        F: FrameManager + ?Sized,
    {
        assert!(va.is_page_aligned(), "map_pages: va not aligned: {va:#x}");
        assert!(pa.is_page_aligned(), "map_pages: pa not aligned: {pa:#x}");
        assert!(size.is_page_aligned(), "map_pages: size not aligned");
        assert!(size > 0, "map_pages: size");
        assert!(perm.intersects(PtEntryFlags::RWX), "perm={perm:?}");

        for offset in (0..size).step_by(PAGE_SIZE) {
            let va = va.byte_add(offset)?;
            let pa = pa
                .byte_add(offset)
                .ok_or(VmError::InvalidAddress(pa))?;
            let pte = self.walk(frames, va, true)?;
            assert!(!pte.is_valid(), "map_pages: remap at {va:#x}");
            unsafe { pte.set(pa, perm | PtEntryFlags::V) };
        }
        Ok(())
    }

    /// Removes `npages` of mappings starting at `va`, optionally releasing
    /// the pages.
    ///
    /// # Safety
    ///
    /// If `free` is `true`, the mappings must own a reference to their pages.
    ///
    /// # Panics
    ///
    /// Panics if `va` is not page-aligned or a page in the range is not
    /// mapped.
    pub unsafe fn unmap<F>(&mut self, frames: &F, va: VirtAddr, npages: usize, free: bool)
    where
        F: FrameManager + ?Sized,
    {
        assert!(va.is_page_aligned(), "unmap: not aligned: {va:#x}");

        for n in 0..npages {
            let va = match va.byte_add(n * PAGE_SIZE) {
                Ok(va) => va,
                Err(e) => panic!("unmap: {e}"),
            };
            let Ok(pte) = self.walk(frames, va, false) else {
                panic!("unmap: walk {va:#x}");
            };
            assert!(pte.is_valid(), "unmap: not mapped {va:#x}");
            assert!(pte.is_leaf(), "unmap: not a leaf {va:#x}");
            let pa = pte.take().phys_addr();
            if free {
                unsafe { frames.release_frame(pa) };
            }
        }
    }

    /// Shares the user pages `0..size` of `src` with this table.
    ///
    /// Writable pages of `src` become copy-on-write in both tables, and each
    /// shared page gains one reference.
    ///
    /// On failure the pages shared so far stay mapped in `self`; destroying
    /// `self` releases them. The page that failed keeps its original entry in
    /// `src`.
    ///
    /// # Panics
    ///
    /// Panics if a page in the range is not mapped in `src`.
    pub fn clone_cow_from<F>(
        &mut self,
        src: &mut Self,
        frames: &F,
        size: usize,
    ) -> Result<(), VmError>
    where
        F: FrameManager + ?Sized,
    {
        for addr in (0..size).step_by(PAGE_SIZE) {
            let va = VirtAddr::new(addr)?;
            let src_pte = match src.walk(frames, va, false) {
                Ok(pte) if pte.is_leaf() => pte,
                _ => panic!("clone_cow_from: page not present at {va:#x}"),
            };
            let pa = src_pte.phys_addr();
            let src_flags = src_pte.flags();

            frames.share_frame(pa)?;
            src_pte.make_copy_on_write();
            let flags = src_pte.flags() - PtEntryFlags::V;
            if let Err(e) = unsafe { self.map_pages(frames, va, PAGE_SIZE, pa, flags) } {
                src_pte.set_flags(src_flags);
                unsafe { frames.release_frame(pa) };
                return Err(e);
            }
        }
        Ok(())
    }

    /// Mirrors the mappings of `src` in `old_size..new_size` into this table,
    /// without user access.
    ///
    /// Existing entries of this table are overwritten. The mirror takes no
    /// references: the pages stay owned by `src`.
    ///
    /// # Panics
    ///
    /// Panics if a page in the range has no entry in `src`, or if an
    /// intermediate table cannot be allocated.
    pub fn duplicate_range_from<F>(
        &mut self,
        src: &Self,
        frames: &F,
        old_size: usize,
        new_size: usize,
    ) where
        F: FrameManager + ?Sized,
    {
        for addr in (old_size.page_roundup()..new_size).step_by(PAGE_SIZE) {
            let va = match VirtAddr::new(addr) {
                Ok(va) => va,
                Err(e) => panic!("duplicate_range_from: {e}"),
            };
            let Some(src_pte) = src.find(va) else {
                panic!("duplicate_range_from: source entry does not exist at {va:#x}");
            };
            let entry = PtEntry::new(src_pte.phys_addr(), src_pte.flags() - PtEntryFlags::U);
            match self.walk(frames, va, true) {
                Ok(pte) => *pte = entry,
                Err(e) => panic!("duplicate_range_from: walk {va:#x}: {e}"),
            }
        }
    }

    /// Frees the whole table, releasing every mapped page that belongs to
    /// the frame manager.
    ///
    /// Returns the number of frames whose reference was released: leaf pages
    /// plus table frames, the root included. A leaf still shared with another
    /// table is counted but stays allocated until its last reference goes.
    pub fn destroy<F>(self, frames: &F) -> usize
    where
        F: FrameManager + ?Sized,
    {
        let freed = unsafe { free_level(frames, self.root, 2, true) };
        log::debug!("destroyed page table {:#x}: {freed} frames", self.root);
        freed
    }

    /// Frees the table frames of a mirror built by
    /// [`Self::duplicate_range_from`], leaving the mapped pages alone.
    ///
    /// Returns the number of table frames freed, the root included.
    pub fn destroy_mirror<F>(self, frames: &F) -> usize
    where
        F: FrameManager + ?Sized,
    {
        let freed = unsafe { free_level(frames, self.root, 2, false) };
        log::debug!("destroyed mirror table {:#x}: {freed} frames", self.root);
        freed
    }
}

/// Clears every entry of the table in frame `pa` and frees it.
///
/// # Safety
///
/// `pa` must be a table frame at `level` owned by the caller.
unsafe fn free_level<F>(frames: &F, pa: PhysAddr, level: usize, free_leaves: bool) -> usize
where
    F: FrameManager + ?Sized,
{
    let pt = unsafe { PageTableEntries::from_frame_mut(pa) };
    let mut freed = 0;
    for pte in &mut pt.0 {
        if !pte.is_valid() {
            continue;
        }
        let non_leaf = pte.is_non_leaf();
        let child = pte.take().phys_addr();
        if non_leaf {
            assert!(level > 0, "free_level: table entry at level 0");
            freed += unsafe { free_level(frames, child, level - 1, free_leaves) };
        } else if free_leaves && frames.is_managed(child) {
            unsafe { frames.release_frame(child) };
            freed += 1;
        }
    }
    unsafe { frames.release_frame(pa) };
    freed + 1
}
