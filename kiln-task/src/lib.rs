//! CPU work dispatch for Kiln.
//!
//! A process-wide worker pool executes [`Task`]s submitted through
//! [`dispatch`] or grouped into [`Job`]s. A job is a counted set of tasks
//! with an optional completion task that fires exactly once after the job
//! is released and its last task finishes.

mod dispatch;
mod job;
mod section;

pub use dispatch::{
    dispatch, dispatch_list, reset_task_dispatch_counter, task_dispatch_counter, Task, TaskHandle,
};
pub use job::Job;
pub use section::{section, CpuSection, SectionTimer};
