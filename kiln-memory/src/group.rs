//! Hierarchical allocation profiling groups.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::intern::InternedString;

struct GroupRecord {
    name: InternedString,
    parent: u32,
    allocated: AtomicU64,
    children: Vec<u32>,
}

// Index 0 is the ignore group, index 1 is the root. Both exist from the
// first registry access onward.
static REGISTRY: Lazy<RwLock<Vec<GroupRecord>>> = Lazy::new(|| {
    RwLock::new(vec![
        GroupRecord {
            name: InternedString::intern("ignore"),
            parent: 0,
            allocated: AtomicU64::new(0),
            children: Vec::new(),
        },
        GroupRecord {
            name: InternedString::intern("root"),
            parent: 1,
            allocated: AtomicU64::new(0),
            children: Vec::new(),
        },
    ])
});

/// Handle to a named node of the process-wide allocation profiling tree.
///
/// Groups are cheap to copy and never deallocated. Byte counters are
/// advisory: they are updated with relaxed atomics and may be slightly
/// off under contention, which is acceptable for profiling output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct AllocationGroup {
    index: u32,
}

impl AllocationGroup {
    /// Group that discards all profiling information.
    pub const IGNORE: AllocationGroup = AllocationGroup { index: 0 };

    /// Root of the profiling tree, created lazily on first access.
    pub fn root() -> Self {
        Lazy::force(&REGISTRY);
        AllocationGroup { index: 1 }
    }

    /// Returns the child with the given name, creating it if it does not
    /// exist yet. The (parent, name) pair is unique among siblings, so
    /// repeated calls return the same group.
    pub fn child(self, name: &str) -> Self {
        if self == Self::IGNORE {
            return Self::IGNORE;
        }

        let interned = InternedString::intern(name);
        {
            let registry = REGISTRY.read().unwrap();
            let record = &registry[self.index as usize];
            for &child in &record.children {
                if registry[child as usize].name == interned {
                    return AllocationGroup { index: child };
                }
            }
        }

        let mut registry = REGISTRY.write().unwrap();
        // Another thread may have created the child between the locks.
        let record = &registry[self.index as usize];
        for &child in &record.children {
            if registry[child as usize].name == interned {
                return AllocationGroup { index: child };
            }
        }

        let index = registry.len() as u32;
        registry.push(GroupRecord {
            name: interned,
            parent: self.index,
            allocated: AtomicU64::new(0),
            children: Vec::new(),
        });
        registry[self.index as usize].children.push(index);
        AllocationGroup { index }
    }

    pub fn name(self) -> InternedString {
        let registry = REGISTRY.read().unwrap();
        registry[self.index as usize].name
    }

    pub fn parent(self) -> Option<AllocationGroup> {
        if self == Self::IGNORE || self == Self::root() {
            return None;
        }
        let registry = REGISTRY.read().unwrap();
        Some(AllocationGroup {
            index: registry[self.index as usize].parent,
        })
    }

    /// Records `bytes` as allocated under this group.
    pub fn on_allocate(self, bytes: usize) {
        if self == Self::IGNORE {
            return;
        }
        let registry = REGISTRY.read().unwrap();
        registry[self.index as usize]
            .allocated
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records `bytes` as freed under this group.
    pub fn on_free(self, bytes: usize) {
        if self == Self::IGNORE {
            return;
        }
        let registry = REGISTRY.read().unwrap();
        registry[self.index as usize]
            .allocated
            .fetch_sub(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes currently attributed directly to this group.
    pub fn allocated_bytes(self) -> u64 {
        let registry = REGISTRY.read().unwrap();
        registry[self.index as usize].allocated.load(Ordering::Relaxed)
    }

    /// Bytes attributed to this group and its whole subtree.
    pub fn total_allocated_bytes(self) -> u64 {
        let registry = REGISTRY.read().unwrap();
        let mut total = 0u64;
        let mut pending = vec![self.index];
        while let Some(index) = pending.pop() {
            let record = &registry[index as usize];
            total += record.allocated.load(Ordering::Relaxed);
            pending.extend_from_slice(&record.children);
        }
        total
    }
}
