//! Growable array with a stable in-memory layout.

use std::alloc::Layout;
use std::ptr::NonNull;

use kiln_memory::{allocate_general, free_general, AllocationGroup};

use crate::registry::Initializer;

/// Dynamic array with an explicit item layout, usable from patch targets.
///
/// The layout is fixed so the patch engine can resize arrays it reaches
/// through sections without knowing the Rust item type.
#[repr(C)]
pub struct DynamicArray {
    data: *mut u8,
    size: u32,
    capacity: u32,
    item_size: u32,
    item_align: u32,
    group: AllocationGroup,
}

impl DynamicArray {
    pub fn new(item_size: usize, item_align: usize, group: AllocationGroup) -> Self {
        debug_assert!(item_align.is_power_of_two());
        debug_assert!(item_size % item_align == 0);
        DynamicArray {
            data: std::ptr::null_mut(),
            size: 0,
            capacity: 0,
            item_size: item_size as u32,
            item_align: item_align as u32,
            group,
        }
    }

    /// Typed constructor for code that owns the item type.
    pub fn for_item<T>(group: AllocationGroup) -> Self {
        Self::new(std::mem::size_of::<T>(), std::mem::align_of::<T>(), group)
    }

    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn item_size(&self) -> usize {
        self.item_size as usize
    }

    pub fn data(&self) -> *mut u8 {
        self.data
    }

    fn layout_for(&self, items: usize) -> Layout {
        Layout::from_size_align(
            (self.item_size as usize).max(1) * items.max(1),
            (self.item_align as usize).max(1),
        )
        .unwrap()
    }

    /// Changes the capacity, moving existing items. Shrinking below the
    /// current size drops trailing items.
    pub fn set_capacity(&mut self, capacity: usize) {
        if capacity == self.capacity as usize {
            return;
        }

        let new_data = if capacity == 0 {
            std::ptr::null_mut()
        } else {
            let pointer = allocate_general(self.group, self.layout_for(capacity))
                .expect("dynamic array allocation failed");
            pointer.as_ptr()
        };

        let preserved = (self.size as usize).min(capacity);
        if preserved > 0 {
            // SAFETY: both buffers are live and at least preserved items long.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.data,
                    new_data,
                    preserved * self.item_size as usize,
                );
            }
        }

        if !self.data.is_null() {
            unsafe {
                free_general(
                    self.group,
                    NonNull::new_unchecked(self.data),
                    self.layout_for(self.capacity as usize),
                );
            }
        }

        self.data = new_data;
        self.capacity = capacity as u32;
        self.size = self.size.min(self.capacity);
    }

    /// Grows the logical size to at least `size`, zeroing new slots and
    /// running `initializer` over each of them.
    pub fn ensure_size(&mut self, size: usize, initializer: Option<Initializer>) {
        if size <= self.size as usize {
            return;
        }
        if size > self.capacity as usize {
            let grown = (self.capacity as usize * 2).max(size);
            self.set_capacity(grown);
        }

        let item_size = self.item_size as usize;
        for index in self.size as usize..size {
            // SAFETY: index < capacity after the growth above.
            unsafe {
                let slot = self.data.add(index * item_size);
                std::ptr::write_bytes(slot, 0, item_size);
                if let Some(initialize) = initializer {
                    initialize(slot);
                }
            }
        }
        self.size = size as u32;
    }

    /// Drops unused capacity so exactly `len` items stay allocated.
    pub fn trim(&mut self) {
        if self.capacity > self.size {
            self.set_capacity(self.size as usize);
        }
    }

    pub fn item_address(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.size as usize);
        // SAFETY: index is inside the allocation per the assert above.
        unsafe { self.data.add(index * self.item_size as usize) }
    }

    /// Borrow the items as a typed slice. `T` must match the item layout
    /// the array was created with.
    pub unsafe fn as_slice<T>(&self) -> &[T] {
        debug_assert_eq!(std::mem::size_of::<T>(), self.item_size as usize);
        if self.data.is_null() {
            return &[];
        }
        std::slice::from_raw_parts(self.data as *const T, self.size as usize)
    }
}

impl Drop for DynamicArray {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe {
                free_general(
                    self.group,
                    NonNull::new_unchecked(self.data),
                    self.layout_for(self.capacity as usize),
                );
            }
        }
    }
}

// SAFETY: the buffer is exclusively owned; all mutation requires &mut.
unsafe impl Send for DynamicArray {}
unsafe impl Sync for DynamicArray {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_size_zeroes_new_slots() {
        let mut array = DynamicArray::for_item::<u32>(AllocationGroup::IGNORE);
        array.ensure_size(4, None);
        assert_eq!(unsafe { array.as_slice::<u32>() }, &[0, 0, 0, 0]);
    }

    #[test]
    fn initializer_runs_per_slot() {
        fn fill(slot: *mut u8) {
            unsafe { *(slot as *mut u32) = 7 };
        }

        let mut array = DynamicArray::for_item::<u32>(AllocationGroup::IGNORE);
        array.ensure_size(3, Some(fill));
        assert_eq!(unsafe { array.as_slice::<u32>() }, &[7, 7, 7]);
    }

    #[test]
    fn trim_drops_capacity_not_items() {
        let mut array = DynamicArray::for_item::<u64>(AllocationGroup::IGNORE);
        array.ensure_size(2, None);
        array.set_capacity(16);
        array.trim();
        assert_eq!(array.capacity(), 2);
        assert_eq!(array.len(), 2);
    }
}
