//! Memory services shared by every Kiln subsystem.
//!
//! Provides the allocation-group profiling tree, the profiled general
//! allocator, a batched small-object pool, a scoped stack allocator,
//! process-lifetime string interning and branded 32-bit ids.

mod batched;
mod group;
mod intern;
mod profiled;
mod stack;
mod typed_id;

pub use batched::{allocate_batched, free_batched, MAX_BATCHED_ITEM_SIZE};
pub use group::AllocationGroup;
pub use intern::InternedString;
pub use profiled::{allocate_general, free_general};
pub use stack::StackAllocator;
pub use typed_id::{IdGenerator32, TypedId32};
