use core::fmt;

use kernel_params::{PAGE_SHIFT, PAGE_SIZE};

use crate::VmError;

/// Virtual Address
///
/// Sv39 splits a 39-bit virtual address into three 9-bit table indices and a
/// 12-bit page offset:
///
/// ```text
///     30..=38 -- 9 bits of level-2 index.
///     21..=29 -- 9 bits of level-1 index.
///     12..=20 -- 9 bits of level-0 index.
///      0..=11 -- 12 bits byte offset with the page.
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(usize);

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl VirtAddr {
    /// One beyond the highest possible virtual address.
    ///
    /// This is one bit less than the max allowed by Sv39, to avoid having to
    /// sign-extend virtual addresses that have the high bit set.
    pub const MAX: usize = 1 << (9 * 3 + PAGE_SHIFT - 1);
    pub const ZERO: Self = Self(0);

    pub const fn new(addr: usize) -> Result<Self, VmError> {
        if addr >= Self::MAX {
            return Err(VmError::TooLargeVirtualAddress(addr));
        }
        Ok(Self(addr))
    }

    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Returns the index of this address in the table of `level`.
    ///
    /// # Panics
    ///
    /// Panics if `level` is greater than 2.
    #[must_use]
    pub const fn level_idx(self, level: usize) -> usize {
        assert!(level <= 2);
        let shift = 9 * level + PAGE_SHIFT;
        (self.0 >> shift) & 0x1ff
    }

    pub const fn byte_add(self, offset: usize) -> Result<Self, VmError> {
        let Some(addr) = self.0.checked_add(offset) else {
            return Err(VmError::TooLargeVirtualAddress(usize::MAX));
        };
        Self::new(addr)
    }

    #[must_use]
    pub const fn page_rounddown(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_idx() {
        let va = VirtAddr::new((3 << 30) | (5 << 21) | (7 << 12) | 0x123).unwrap();
        assert_eq!(va.level_idx(2), 3);
        assert_eq!(va.level_idx(1), 5);
        assert_eq!(va.level_idx(0), 7);
        assert_eq!(va.page_rounddown().addr(), va.addr() - 0x123);
        assert!(!va.is_page_aligned());
    }

    #[test]
    fn test_range() {
        assert!(VirtAddr::new(VirtAddr::MAX - 1).is_ok());
        assert_eq!(
            VirtAddr::new(VirtAddr::MAX),
            Err(VmError::TooLargeVirtualAddress(VirtAddr::MAX))
        );
        assert!(VirtAddr::ZERO.byte_add(VirtAddr::MAX).is_err());
        assert!(VirtAddr::new(1).unwrap().byte_add(usize::MAX).is_err());
    }
}
