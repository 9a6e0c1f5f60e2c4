//! Finalized graph storage and execution.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use kiln_memory::{AllocationGroup, InternedString};
use kiln_task::{Job, Task};

/// Body of a workflow node. Receives the node's job in assembling state;
/// must release it (possibly after attaching tasks).
pub type NodeFunction = Arc<dyn Fn(Job) + Send + Sync + 'static>;

pub(crate) struct Vertex {
    pub name: InternedString,
    pub function: NodeFunction,
    pub inbound_count: u32,
    pub outbound: Vec<usize>,
}

pub(crate) struct GraphInner {
    pub vertices: Vec<Vertex>,
}

/// Executable workflow graph. Stateless between executions; reusable any
/// number of times, one execution at a time.
pub struct Graph {
    inner: Arc<GraphInner>,
    group: AllocationGroup,
}

struct ExecutionState {
    inbound: Vec<AtomicU32>,
    remaining: AtomicUsize,
    done: Mutex<bool>,
    signal: Condvar,
}

impl Graph {
    pub(crate) fn from_inner(inner: GraphInner, group: AllocationGroup) -> Self {
        Graph {
            inner: Arc::new(inner),
            group,
        }
    }

    pub fn node_count(&self) -> usize {
        self.inner.vertices.len()
    }

    pub fn allocation_group(&self) -> AllocationGroup {
        self.group
    }

    /// Runs every node, honoring the graph edges. Returns when all nodes
    /// have finished.
    pub fn execute(&self) {
        if self.inner.vertices.is_empty() {
            return;
        }

        let state = Arc::new(ExecutionState {
            inbound: self
                .inner
                .vertices
                .iter()
                .map(|vertex| AtomicU32::new(vertex.inbound_count))
                .collect(),
            remaining: AtomicUsize::new(self.inner.vertices.len()),
            done: Mutex::new(false),
            signal: Condvar::new(),
        });

        for (index, vertex) in self.inner.vertices.iter().enumerate() {
            if vertex.inbound_count == 0 {
                dispatch_vertex(&self.inner, &state, index);
            }
        }

        let mut done = state.done.lock().unwrap();
        while !*done {
            done = state.signal.wait(done).unwrap();
        }
    }
}

fn dispatch_vertex(graph: &Arc<GraphInner>, state: &Arc<ExecutionState>, index: usize) {
    let vertex = &graph.vertices[index];
    let job = Job::new();

    let completion = {
        let graph = Arc::clone(graph);
        let state = Arc::clone(state);
        Task::new(vertex.name, move || {
            for &next in &graph.vertices[index].outbound {
                if state.inbound[next].fetch_sub(1, Ordering::AcqRel) == 1 {
                    dispatch_vertex(&graph, &state, next);
                }
            }

            if state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                *state.done.lock().unwrap() = true;
                state.signal.notify_all();
            }
        })
    };
    job.set_completion_task(completion);

    // The node function itself runs as a member task of the node's job,
    // so the job cannot complete before the function returns even when it
    // releases early.
    let function = Arc::clone(&vertex.function);
    let member_job = job.clone();
    job.dispatch_task(Task::new(vertex.name, move || function(member_job)))
        .detach();
}
