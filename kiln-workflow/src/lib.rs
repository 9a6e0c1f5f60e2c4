//! Data processing graphs scheduled on the Kiln CPU dispatcher.
//!
//! A graph is built from named nodes with declared resource accesses and
//! string-named dependencies. Unresolved dependency names become
//! checkpoints, which are expanded to real edges and optimized out during
//! finalization. Finalization also rejects dependency cycles and pairs of
//! potentially-concurrent nodes whose declared accesses could race.
//!
//! Each node function receives a fresh [`kiln_task::Job`]: it may attach
//! any number of tasks to it and must release it; the node counts as
//! finished once the job completes, which is what drives successors.

mod builder;
mod graph;

pub use builder::{AccessClass, GraphBuilder, GraphError, NodeBuilder};
pub use graph::{Graph, NodeFunction};
