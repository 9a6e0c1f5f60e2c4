//! Kiln: a modular game engine runtime.
//!
//! The runtime is split into subsystem crates re-exported here:
//!
//! - [`memory`] — allocation profiling groups, pooled allocators,
//!   string interning and branded ids;
//! - [`task`] — the CPU task dispatcher and job aggregation;
//! - [`workflow`] — data-race-validated execution graphs scheduled on
//!   the dispatcher;
//! - [`reflect`] — the reflection registry subset and patch engine;
//! - [`resource`] — virtual file system, packs and the resource
//!   provider with hot reload;
//! - [`render`] — the render backend resource layer;
//! - [`context`] — ordered assembly of runtime systems.

pub use kiln_context as context;
pub use kiln_memory as memory;
pub use kiln_reflect as reflect;
pub use kiln_render as render;
pub use kiln_resource as resource;
pub use kiln_task as task;
pub use kiln_workflow as workflow;
