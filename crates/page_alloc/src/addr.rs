use core::{
    fmt,
    ptr::{self, NonNull},
};

use kernel_params::{PAGE_SHIFT, PAGE_SIZE};

const fn page_roundup(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

const fn page_rounddown(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

const fn is_page_aligned(addr: usize) -> bool {
    addr % PAGE_SIZE == 0
}

pub trait PageRound {
    fn as_addr(&self) -> usize;
    fn from_addr(addr: usize) -> Self;

    fn page_roundup(&self) -> Self
    where
        Self: Sized,
    {
        Self::from_addr(page_roundup(self.as_addr()))
    }

    fn page_rounddown(&self) -> Self
    where
        Self: Sized,
    {
        Self::from_addr(page_rounddown(self.as_addr()))
    }

    fn is_page_aligned(&self) -> bool {
        is_page_aligned(self.as_addr())
    }
}

impl PageRound for usize {
    fn as_addr(&self) -> usize {
        *self
    }

    fn from_addr(addr: usize) -> Self {
        addr
    }
}

impl PageRound for PhysAddr {
    fn as_addr(&self) -> usize {
        self.0
    }

    fn from_addr(addr: usize) -> Self {
        Self::new(addr)
    }
}

struct Hex(usize);
impl fmt::Debug for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

macro_rules! impl_fmt {
    ($ty:ident) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_tuple(stringify!($ty)).field(&Hex(self.0)).finish()
            }
        }
        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
        impl fmt::UpperHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::UpperHex::fmt(&self.0, f)
            }
        }
        impl fmt::Pointer for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let ptr = ptr::without_provenance::<u8>(self.0);
                fmt::Pointer::fmt(&ptr, f)
            }
        }
    };
}

/// Physical Address
///
/// The kernel maps physical memory one-to-one, so a physical address can be
/// turned into a pointer and dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(usize);
impl_fmt!(PhysAddr);

/// Physical Page Number of a page
///
/// The physical address shifted right by [`PAGE_SHIFT`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysPageNum(usize);
impl_fmt!(PhysPageNum);

impl PhysAddr {
    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the physical address of the memory `ptr` points to.
    ///
    /// The provenance of `ptr` is exposed so that the address can be turned
    /// back into a usable pointer later.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr.expose_provenance())
    }

    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    #[must_use]
    pub const fn phys_page_num(self) -> PhysPageNum {
        PhysPageNum(self.0 >> PAGE_SHIFT)
    }

    #[must_use]
    pub const fn byte_add(self, offset: usize) -> Option<Self> {
        let Some(addr) = self.0.checked_add(offset) else {
            return None;
        };
        Some(Self(addr))
    }

    #[must_use]
    pub fn as_ptr<T>(self) -> *const T {
        ptr::with_exposed_provenance(self.0)
    }

    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        ptr::with_exposed_provenance_mut(self.0)
    }

    /// Returns a non-null pointer to the memory at this address.
    ///
    /// # Panics
    ///
    /// Panics if the address is zero.
    #[must_use]
    pub fn as_non_null<T>(self) -> NonNull<T> {
        NonNull::new(self.as_mut_ptr()).unwrap()
    }
}

impl<T> From<NonNull<T>> for PhysAddr {
    fn from(ptr: NonNull<T>) -> Self {
        Self::from_ptr(ptr.as_ptr())
    }
}

impl PhysPageNum {
    #[must_use]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> usize {
        self.0
    }

    #[must_use]
    pub const fn phys_addr(self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_SHIFT)
    }
}
