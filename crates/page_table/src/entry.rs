use core::{fmt, mem};

use bitflags::bitflags;
use dataview::Pod;
use page_alloc::{PhysAddr, PhysPageNum};

bitflags! {
    /// Flags for page table entries.
    ///
    /// These flags define the properties and permissions of a page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtEntryFlags: usize {
        /// Valid Bit of page table entry.
        ///
        /// If set, an entry for this virtual address exists.
        const V = 1 << 0;

        /// Read Bit of page table entry.
        const R = 1 << 1;

        /// Write Bit of page table entry.
        const W = 1 << 2;

        /// Executable Bit of page table entry.
        const X = 1 << 3;

        /// UserMode Bit of page table entry.
        ///
        /// If set, userspace can access this virtual address.
        const U = 1 << 4;

        /// Global Mapping Bit of page table entry.
        const G = 1 << 5;

        /// Access Bit of page table entry.
        const A = 1 << 6;

        /// Dirty Bit of page table entry.
        const D = 1 << 7;

        /// Copy-On-Write Bit of page table entry.
        ///
        /// If set, the page is shared read-only and gets its own copy on the
        /// first write. Never set together with `W`.
        const C = 1 << 8;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
        const UR = Self::U.bits() | Self::R.bits();
        const URW = Self::U.bits() | Self::RW.bits();
        const URX = Self::U.bits() | Self::RX.bits();
    }
}

/// A single Sv39 page table entry.
///
/// Bits 0..=9 hold the [`PtEntryFlags`], bits 10.. the physical page number.
#[repr(transparent)]
#[derive(Pod, Default, PartialEq, Eq)]
pub struct PtEntry(usize);

impl fmt::Debug for PtEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtEntry")
            .field("pa", &self.phys_addr())
            .field("flags", &self.flags())
            .finish()
    }
}

impl PtEntry {
    const FLAGS_MASK: usize = 0x3FF;
    const PPN_SHIFT: usize = 10;

    /// Creates an entry pointing at the page `pa` with the given flags.
    ///
    /// # Panics
    ///
    /// Panics if `flags` has bits outside the flag field.
    pub(crate) fn new(pa: PhysAddr, flags: PtEntryFlags) -> Self {
        assert_eq!(
            flags.bits() & Self::FLAGS_MASK,
            flags.bits(),
            "flags: {flags:#x}={flags:?}"
        );
        Self((pa.phys_page_num().value() << Self::PPN_SHIFT) | flags.bits())
    }

    /// Returns the raw bits of this entry.
    #[must_use]
    pub fn bits(&self) -> usize {
        self.0
    }

    /// Returns the physical address this entry points at.
    #[must_use]
    pub fn phys_addr(&self) -> PhysAddr {
        PhysPageNum::new(self.0 >> Self::PPN_SHIFT).phys_addr()
    }

    /// Returns the flags associated with this entry.
    #[must_use]
    pub fn flags(&self) -> PtEntryFlags {
        PtEntryFlags::from_bits_retain(self.0 & Self::FLAGS_MASK)
    }

    /// Returns `true` if this entry is valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PtEntryFlags::V)
    }

    /// Returns `true` if this entry is a valid leaf entry.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.is_valid() && self.flags().intersects(PtEntryFlags::RWX)
    }

    /// Returns `true` if this entry is a valid non-leaf entry.
    ///
    /// A valid entry with none of `R`, `W`, `X` points at the next level
    /// table.
    #[must_use]
    pub fn is_non_leaf(&self) -> bool {
        self.is_valid() && !self.is_leaf()
    }

    /// Returns `true` if this entry is a valid copy-on-write leaf.
    #[must_use]
    pub fn is_cow(&self) -> bool {
        self.is_leaf() && self.flags().contains(PtEntryFlags::C)
    }

    /// Points this invalid entry at the page `pa`.
    ///
    /// # Safety
    ///
    /// `pa` must be a page the owner of this table may map with `flags`.
    ///
    /// # Panics
    ///
    /// Panics if the entry is already valid or `flags` does not include `V`.
    pub unsafe fn set(&mut self, pa: PhysAddr, flags: PtEntryFlags) {
        assert!(!self.is_valid());
        assert!(flags.contains(PtEntryFlags::V));
        *self = Self::new(pa, flags);
    }

    /// Replaces the flags of this entry, keeping the page it points at.
    pub(crate) fn set_flags(&mut self, flags: PtEntryFlags) {
        *self = Self::new(self.phys_addr(), flags);
    }

    /// Invalidates this entry and returns its previous value.
    pub(crate) fn take(&mut self) -> Self {
        Self(mem::take(&mut self.0))
    }

    /// Turns a writable leaf into a read-only copy-on-write leaf.
    ///
    /// Entries without `W` are left unchanged.
    pub(crate) fn make_copy_on_write(&mut self) {
        let mut flags = self.flags();
        if flags.contains(PtEntryFlags::W) {
            flags.remove(PtEntryFlags::W);
            flags.insert(PtEntryFlags::C);
            self.set_flags(flags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_layout() {
        let pa = PhysAddr::new(0x8765_4000);
        let pte = PtEntry::new(pa, PtEntryFlags::V | PtEntryFlags::URW);
        assert_eq!(pte.bits(), (0x87654 << 10) | 0x17);
        assert_eq!(pte.phys_addr(), pa);
        assert!(pte.is_leaf());
        assert!(!pte.is_non_leaf());

        let table = PtEntry::new(pa, PtEntryFlags::V);
        assert!(table.is_non_leaf());
        assert!(!PtEntry::default().is_valid());
    }

    #[test]
    fn test_make_copy_on_write() {
        let pa = PhysAddr::new(0x8000_1000);
        let mut pte = PtEntry::new(pa, PtEntryFlags::V | PtEntryFlags::URW);
        pte.make_copy_on_write();
        assert!(pte.is_cow());
        assert!(!pte.flags().contains(PtEntryFlags::W));
        assert_eq!(pte.phys_addr(), pa);

        let mut ro = PtEntry::new(pa, PtEntryFlags::V | PtEntryFlags::UR);
        ro.make_copy_on_write();
        assert!(!ro.is_cow());
    }

    #[test]
    fn test_take() {
        let pa = PhysAddr::new(0x8000_2000);
        let mut pte = PtEntry::new(pa, PtEntryFlags::V | PtEntryFlags::R);
        let old = pte.take();
        assert!(!pte.is_valid());
        assert_eq!(old.phys_addr(), pa);
    }

    #[test]
    #[should_panic(expected = "assertion failed")]
    fn test_set_valid_entry() {
        let pa = PhysAddr::new(0x8000_3000);
        let mut pte = PtEntry::new(pa, PtEntryFlags::V | PtEntryFlags::R);
        unsafe { pte.set(pa, PtEntryFlags::V | PtEntryFlags::R) };
    }
}
