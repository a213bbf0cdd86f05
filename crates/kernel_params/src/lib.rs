//! Compile-time parameters of the memory subsystem.

#![no_std]

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Bits of offset within a page
pub const PAGE_SHIFT: usize = 12;

/// Bytes per page
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Byte pattern written over a page when it is allocated.
///
/// Reads of memory the caller forgot to initialize show up as `0x05`.
pub const ALLOC_JUNK: u8 = 5;

/// Byte pattern written over a page when it is freed.
///
/// Reads through dangling references show up as `0x01`.
pub const FREE_JUNK: u8 = 1;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(ALLOC_JUNK != FREE_JUNK);
    assert!(NCPU > 0);
};
