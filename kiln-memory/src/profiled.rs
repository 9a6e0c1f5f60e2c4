//! Profiled general-purpose allocation.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::group::AllocationGroup;

/// Allocates `layout` bytes and attributes them to `group`.
///
/// Returns `None` when the underlying allocator fails; callers decide
/// whether that is recoverable.
pub fn allocate_general(group: AllocationGroup, layout: Layout) -> Option<NonNull<u8>> {
    if layout.size() == 0 {
        return NonNull::new(layout.align() as *mut u8);
    }

    // SAFETY: layout has a non-zero size.
    let pointer = unsafe { alloc::alloc(layout) };
    let pointer = NonNull::new(pointer)?;
    group.on_allocate(layout.size());
    Some(pointer)
}

/// Frees memory previously returned by [`allocate_general`].
///
/// # Safety
///
/// `pointer` must come from `allocate_general` with exactly the same
/// `layout`, and must not be freed twice.
pub unsafe fn free_general(group: AllocationGroup, pointer: NonNull<u8>, layout: Layout) {
    if layout.size() == 0 {
        return;
    }
    alloc::dealloc(pointer.as_ptr(), layout);
    group.on_free(layout.size());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_profiled() {
        let group = AllocationGroup::root().child("profiled_test");
        let layout = Layout::from_size_align(96, 32).unwrap();

        let pointer = allocate_general(group, layout).unwrap();
        assert_eq!(pointer.as_ptr() as usize % 32, 0);
        assert_eq!(group.allocated_bytes(), 96);

        unsafe { free_general(group, pointer, layout) };
        assert_eq!(group.allocated_bytes(), 0);
    }
}
