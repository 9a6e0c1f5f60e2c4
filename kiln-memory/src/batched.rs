//! Pooled allocator for small fixed-size objects.
//!
//! Items are served from 64 KiB pages, one free list per 8-byte size
//! class. Freeing derives the owning page from the page-aligned item
//! address, so callers do not pass the item size back.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::group::AllocationGroup;

const PAGE_SIZE: usize = 64 * 1024;
const MIN_ITEM_SIZE: usize = 8;

/// Largest item the pool serves; bigger allocations belong to
/// [`crate::allocate_general`].
pub const MAX_BATCHED_ITEM_SIZE: usize = 256;

const CLASS_COUNT: usize = MAX_BATCHED_ITEM_SIZE / MIN_ITEM_SIZE;

#[repr(C)]
struct PageHeader {
    next_free_page: *mut PageHeader,
    first_free: *mut FreeItem,
    acquired_count: usize,
    item_size: usize,
}

#[repr(C)]
struct FreeItem {
    next_free: *mut FreeItem,
}

struct SizeClass {
    first_free_page: *mut PageHeader,
}

// SAFETY: the raw page pointers are only touched under the class mutex.
unsafe impl Send for SizeClass {}

struct PoolContext {
    main_group: AllocationGroup,
    reserve_group: AllocationGroup,
    classes: Vec<Mutex<SizeClass>>,
}

static POOL: Lazy<PoolContext> = Lazy::new(|| {
    let main_group = AllocationGroup::root().child("batched_allocator");
    PoolContext {
        main_group,
        reserve_group: main_group.child("reserve"),
        classes: (0..CLASS_COUNT)
            .map(|_| {
                Mutex::new(SizeClass {
                    first_free_page: std::ptr::null_mut(),
                })
            })
            .collect(),
    }
});

fn page_layout() -> Layout {
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

/// First item slot of a page: the header end rounded up so that the slot
/// address is a multiple of the item size.
unsafe fn page_data_begin(page: *mut PageHeader, item_size: usize) -> *mut u8 {
    let mut data = (page as *mut u8).add(std::mem::size_of::<PageHeader>());
    let misalignment = data as usize % item_size;
    if misalignment != 0 {
        data = data.add(item_size - misalignment);
    }
    data
}

unsafe fn create_page(pool: &PoolContext, item_size: usize) -> *mut PageHeader {
    let page = alloc::alloc(page_layout()) as *mut PageHeader;
    assert!(!page.is_null(), "batched allocator page allocation failed");

    (*page).next_free_page = std::ptr::null_mut();
    (*page).first_free = std::ptr::null_mut();
    (*page).acquired_count = 0;
    (*page).item_size = item_size;

    let data_begin = page_data_begin(page, item_size);
    let page_end = (page as *mut u8).add(PAGE_SIZE);
    let meta_size = data_begin as usize - page as usize;
    pool.main_group.on_allocate(meta_size);
    pool.reserve_group.on_allocate(PAGE_SIZE - meta_size);

    log::trace!(target: "memory", "new batched page for {} byte items", item_size);

    // Thread every full item slot into the page free list.
    let mut item = data_begin;
    while item.add(item_size) <= page_end {
        let next = item.add(item_size);
        let entry = item as *mut FreeItem;
        (*entry).next_free = if next.add(item_size) <= page_end {
            next as *mut FreeItem
        } else {
            std::ptr::null_mut()
        };
        item = next;
    }
    (*page).first_free = data_begin as *mut FreeItem;
    page
}

fn class_for_size(size: usize) -> (usize, usize) {
    let item_size = (size.max(MIN_ITEM_SIZE) + MIN_ITEM_SIZE - 1) & !(MIN_ITEM_SIZE - 1);
    assert!(
        item_size <= MAX_BATCHED_ITEM_SIZE,
        "batched allocation of {} bytes exceeds the {} byte pool limit",
        size,
        MAX_BATCHED_ITEM_SIZE
    );
    (item_size / MIN_ITEM_SIZE - 1, item_size)
}

/// Takes one pooled item of at least `size` bytes, attributing it to
/// `group`. The matching release is [`free_batched`].
pub fn allocate_batched(group: AllocationGroup, size: usize) -> NonNull<u8> {
    let pool = &*POOL;
    let (class_index, item_size) = class_for_size(size);
    let mut class = pool.classes[class_index].lock().unwrap();

    unsafe {
        if class.first_free_page.is_null() {
            class.first_free_page = create_page(pool, item_size);
        }

        let page = class.first_free_page;
        let item = (*page).first_free;
        debug_assert!(!item.is_null());
        (*page).first_free = (*item).next_free;
        (*page).acquired_count += 1;

        group.on_allocate(item_size);
        pool.reserve_group.on_free(item_size);

        if (*page).first_free.is_null() {
            // Page is now full; take it out of the free-page list.
            class.first_free_page = (*page).next_free_page;
        }

        NonNull::new_unchecked(item as *mut u8)
    }
}

/// Returns an item obtained from [`allocate_batched`] to its pool.
///
/// # Safety
///
/// `pointer` must come from `allocate_batched`, must not be freed twice,
/// and `group` must be the group it was allocated under.
pub unsafe fn free_batched(group: AllocationGroup, pointer: NonNull<u8>) {
    let pool = &*POOL;
    let address = pointer.as_ptr() as usize;
    let page = (address & !(PAGE_SIZE - 1)) as *mut PageHeader;
    let item_size = (*page).item_size;
    let class_index = item_size / MIN_ITEM_SIZE - 1;
    let mut class = pool.classes[class_index].lock().unwrap();

    debug_assert!((*page).acquired_count > 0);
    (*page).acquired_count -= 1;
    group.on_free(item_size);
    pool.reserve_group.on_allocate(item_size);

    if (*page).acquired_count == 0 {
        // Last item came back; release the whole page.
        if class.first_free_page == page {
            class.first_free_page = (*page).next_free_page;
        } else {
            let mut other = class.first_free_page;
            while (*other).next_free_page != page {
                other = (*other).next_free_page;
                debug_assert!(!other.is_null());
            }
            (*other).next_free_page = (*page).next_free_page;
        }

        let meta_size = page_data_begin(page, item_size) as usize - page as usize;
        pool.reserve_group.on_free(PAGE_SIZE - meta_size);
        pool.main_group.on_free(meta_size);
        alloc::dealloc(page as *mut u8, page_layout());
        return;
    }

    let item = pointer.as_ptr() as *mut FreeItem;
    let was_full = (*page).first_free.is_null();
    (*item).next_free = (*page).first_free;
    (*page).first_free = item;

    if was_full {
        // The free-page list is kept sorted by address so long-lived
        // allocations cluster on low pages and high pages can drain.
        if !class.first_free_page.is_null() && class.first_free_page < page {
            let mut sorted = class.first_free_page;
            while !(*sorted).next_free_page.is_null() && (*sorted).next_free_page < page {
                sorted = (*sorted).next_free_page;
            }
            (*page).next_free_page = (*sorted).next_free_page;
            (*sorted).next_free_page = page;
        } else {
            (*page).next_free_page = class.first_free_page;
            class.first_free_page = page;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_round_trip() {
        let group = AllocationGroup::root().child("batched_test_round_trip");
        let pointer = allocate_batched(group, 40);
        assert_eq!(group.allocated_bytes(), 40);
        unsafe { free_batched(group, pointer) };
        assert_eq!(group.allocated_bytes(), 0);
    }

    #[test]
    fn items_of_one_class_come_from_one_page() {
        let group = AllocationGroup::IGNORE;
        let a = allocate_batched(group, 64);
        let b = allocate_batched(group, 64);
        assert_eq!(
            a.as_ptr() as usize & !(PAGE_SIZE - 1),
            b.as_ptr() as usize & !(PAGE_SIZE - 1)
        );
        unsafe {
            free_batched(group, a);
            free_batched(group, b);
        }
    }

    #[test]
    fn freed_item_is_reused() {
        let group = AllocationGroup::IGNORE;
        let first = allocate_batched(group, 16);
        let keep = allocate_batched(group, 16);
        let address = first.as_ptr() as usize;
        unsafe { free_batched(group, first) };
        let second = allocate_batched(group, 16);
        assert_eq!(second.as_ptr() as usize, address);
        unsafe {
            free_batched(group, second);
            free_batched(group, keep);
        }
    }

    #[test]
    fn sizes_round_up_to_their_class() {
        let (class, item_size) = class_for_size(20);
        assert_eq!(item_size, 24);
        assert_eq!(class, 2);
        let (_, min_size) = class_for_size(1);
        assert_eq!(min_size, 8);
    }
}
