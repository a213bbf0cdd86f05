//! Per-frame metadata carved from the managed memory itself.

use core::{mem::MaybeUninit, ops::Range, slice};

use crate::PhysAddr;

/// Places an array of `len` values at the start of `range`.
///
/// Returns the initialized array and the part of `range` following it.
///
/// # Safety
///
/// `range` must be valid, otherwise unused memory that lives as long as the
/// kernel.
///
/// # Panics
///
/// Panics if the array does not fit in `range`.
pub(crate) unsafe fn carve<T, F>(
    range: Range<PhysAddr>,
    len: usize,
    mut init: F,
) -> (&'static mut [T], Range<PhysAddr>)
where
    F: FnMut() -> T,
{
    let start = range.start.addr().next_multiple_of(align_of::<T>());
    let end = len
        .checked_mul(size_of::<T>())
        .and_then(|size| start.checked_add(size))
        .filter(|end| *end <= range.end.addr());
    let Some(end) = end else {
        panic!(
            "metadata of {len} entries does not fit in {:#x}..{:#x}",
            range.start, range.end
        );
    };

    let array = unsafe {
        slice::from_raw_parts_mut(PhysAddr::new(start).as_mut_ptr::<MaybeUninit<T>>(), len)
    };
    for value in &mut *array {
        value.write(init());
    }
    let array = unsafe { slice::from_raw_parts_mut(array.as_mut_ptr().cast::<T>(), len) };

    (array, PhysAddr::new(end)..range.end)
}
