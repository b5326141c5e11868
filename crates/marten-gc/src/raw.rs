//! Raw region allocation over the system allocator.
//!
//! Thin malloc/calloc/realloc/free-shaped wrappers. Failure is signalled by
//! a null return instead of an abort, so the collector can run an emergency
//! collection and retry.

use std::alloc::{self, Layout};
use std::ptr;

/// Alignment of every managed region; matches what malloc hands out.
pub(crate) const REGION_ALIGN: usize = 16;

fn layout_for(size: usize) -> Option<Layout> {
    // Zero-sized requests get a one-byte region so every managed address
    // stays unique and deallocatable.
    Layout::from_size_align(size.max(1), REGION_ALIGN).ok()
}

/// Total region size for an allocation request. `count == 0` selects the
/// plain `size`-byte path; otherwise `count * size` with overflow reported
/// as `None`.
pub(crate) fn region_size(count: usize, size: usize) -> Option<usize> {
    if count == 0 {
        Some(size)
    } else {
        count.checked_mul(size)
    }
}

/// Allocate a region: `count == 0` yields `size` uninitialised bytes,
/// anything else `count * size` zeroed bytes. Null on failure or overflow.
pub(crate) fn alloc_region(count: usize, size: usize) -> *mut u8 {
    let Some(total) = region_size(count, size) else {
        return ptr::null_mut();
    };
    let Some(layout) = layout_for(total) else {
        return ptr::null_mut();
    };
    // SAFETY: layout has non-zero size (layout_for clamps to >= 1 byte).
    unsafe {
        if count == 0 {
            alloc::alloc(layout)
        } else {
            alloc::alloc_zeroed(layout)
        }
    }
}

/// Resize a region in place or by moving it. Null on failure, in which
/// case the original region is untouched and still valid.
///
/// # Safety
/// `ptr` must have been returned by [`alloc_region`] (or
/// [`realloc_region`]) with a total size of `old_size` and not freed since.
pub(crate) unsafe fn realloc_region(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    let Some(layout) = layout_for(old_size) else {
        return ptr::null_mut();
    };
    if layout_for(new_size).is_none() {
        return ptr::null_mut();
    }
    // SAFETY: caller guarantees ptr was allocated with this layout; the new
    // size is clamped the same way layout_for clamps allocation sizes.
    unsafe { alloc::realloc(ptr, layout, new_size.max(1)) }
}

/// Return a region to the system.
///
/// # Safety
/// `ptr` must have been returned by [`alloc_region`] or
/// [`realloc_region`] with a total size of `size` and not freed since.
pub(crate) unsafe fn free_region(ptr: *mut u8, size: usize) {
    if ptr.is_null() {
        return;
    }
    let Some(layout) = layout_for(size) else {
        return;
    };
    // SAFETY: caller guarantees ptr/layout match the original allocation.
    unsafe { alloc::dealloc(ptr, layout) }
}

/// Fallible boxing for metadata nodes. `None` when the system allocator
/// fails, where `Box::new` would abort.
pub(crate) fn try_box<T>(value: T) -> Option<Box<T>> {
    let layout = Layout::new::<T>();
    debug_assert!(layout.size() > 0);
    // SAFETY: layout is the layout of T and has non-zero size.
    let p = unsafe { alloc::alloc(layout) } as *mut T;
    if p.is_null() {
        return None;
    }
    // SAFETY: p is non-null, properly aligned for T, and uninitialised;
    // after the write it holds a valid T allocated with T's layout, which
    // is exactly what Box::from_raw requires.
    unsafe {
        p.write(value);
        Some(Box::from_raw(p))
    }
}
