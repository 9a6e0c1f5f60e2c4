//! Global worker pool and task handles.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use kiln_memory::InternedString;
use once_cell::sync::Lazy;

use crate::job::JobInner;
use crate::section;

/// How long an idle worker blocks on the queue before re-checking.
const NO_TASK_SLEEP: Duration = Duration::from_micros(500);

const STATE_QUEUED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_FINISHED: u8 = 2;

/// One unit of work for the dispatcher.
pub struct Task {
    pub name: InternedString,
    pub function: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    pub fn new(name: impl Into<InternedString>, function: impl FnOnce() + Send + 'static) -> Self {
        Task {
            name: name.into(),
            function: Box::new(function),
        }
    }
}

pub(crate) struct TaskNode {
    name: InternedString,
    state: AtomicU8,
    function: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
    job: Option<Arc<JobInner>>,
}

/// Handle to a dispatched task.
///
/// Dropping or [`detach`](Self::detach)-ing the handle never cancels the
/// work; the node itself is reclaimed once both the handle and the worker
/// are done with it.
pub struct TaskHandle {
    node: Arc<TaskNode>,
}

impl TaskHandle {
    /// Non-blocking completion check.
    pub fn is_finished(&self) -> bool {
        self.node.state.load(Ordering::Acquire) == STATE_FINISHED
    }

    /// Gives the node up; it is reclaimed as soon as execution finishes
    /// (or immediately when it already has).
    pub fn detach(self) {}
}

struct Dispatcher {
    sender: Sender<Arc<TaskNode>>,
    dispatched_counter: AtomicUsize,
}

static DISPATCHER: Lazy<Dispatcher> = Lazy::new(|| {
    let (sender, receiver) = crossbeam_channel::unbounded::<Arc<TaskNode>>();
    let worker_count = num_cpus::get().max(1);

    for index in 0..worker_count {
        let receiver = receiver.clone();
        std::thread::Builder::new()
            .name(format!("kiln-cpu-worker-{}", index))
            .spawn(move || worker_loop(receiver))
            .expect("failed to spawn dispatcher worker");
    }

    log::debug!(target: "task", "spawned {} dispatcher workers", worker_count);
    Dispatcher {
        sender,
        dispatched_counter: AtomicUsize::new(0),
    }
});

#[profiling::function]
fn worker_loop(receiver: Receiver<Arc<TaskNode>>) {
    loop {
        let node = match receiver.recv_timeout(NO_TASK_SLEEP) {
            Ok(node) => node,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        execute_node(node);
    }
}

fn execute_node(node: Arc<TaskNode>) {
    let previous = node.state.swap(STATE_RUNNING, Ordering::AcqRel);
    debug_assert_eq!(previous, STATE_QUEUED);

    let function = node
        .function
        .lock()
        .unwrap()
        .take()
        .expect("task function executed twice");

    {
        let _timer = section(node.name).enter();
        function();
    }

    if let Some(job) = &node.job {
        job.report_task_finished();
    }

    node.state.store(STATE_FINISHED, Ordering::Release);
}

pub(crate) fn dispatch_into(job: Option<Arc<JobInner>>, task: Task) -> TaskHandle {
    let dispatcher = &*DISPATCHER;
    let node = Arc::new(TaskNode {
        name: task.name,
        state: AtomicU8::new(STATE_QUEUED),
        function: Mutex::new(Some(task.function)),
        job,
    });

    dispatcher
        .sender
        .send(Arc::clone(&node))
        .expect("dispatcher queue closed");
    dispatcher.dispatched_counter.fetch_add(1, Ordering::Relaxed);
    TaskHandle { node }
}

pub(crate) fn dispatch_list_into(job: Option<&Arc<JobInner>>, tasks: Vec<Task>) -> Vec<TaskHandle> {
    let dispatcher = &*DISPATCHER;
    let count = tasks.len();
    let mut handles = Vec::with_capacity(count);

    for task in tasks {
        let node = Arc::new(TaskNode {
            name: task.name,
            state: AtomicU8::new(STATE_QUEUED),
            function: Mutex::new(Some(task.function)),
            job: job.map(Arc::clone),
        });
        dispatcher
            .sender
            .send(Arc::clone(&node))
            .expect("dispatcher queue closed");
        handles.push(TaskHandle { node });
    }

    dispatcher.dispatched_counter.fetch_add(count, Ordering::Relaxed);
    handles
}

/// Queues a standalone task for execution on the worker pool.
pub fn dispatch(task: Task) -> TaskHandle {
    dispatch_into(None, task)
}

/// Queues a batch of standalone tasks in one submission.
pub fn dispatch_list(tasks: Vec<Task>) -> Vec<TaskHandle> {
    dispatch_list_into(None, tasks)
}

/// Total tasks dispatched since startup or the last reset.
pub fn task_dispatch_counter() -> usize {
    DISPATCHER.dispatched_counter.load(Ordering::Relaxed)
}

pub fn reset_task_dispatch_counter() {
    DISPATCHER.dispatched_counter.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn dispatched_task_runs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&counter);
        let handle = dispatch(Task::new("dispatch_test_single", move || {
            captured.fetch_add(1, Ordering::SeqCst);
        }));

        while !handle.is_finished() {
            std::thread::sleep(Duration::from_micros(50));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn list_dispatch_runs_every_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks = (0..16)
            .map(|_| {
                let captured = Arc::clone(&counter);
                Task::new("dispatch_test_list", move || {
                    captured.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        let handles = dispatch_list(tasks);
        for handle in &handles {
            while !handle.is_finished() {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn detach_does_not_cancel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&counter);
        dispatch(Task::new("dispatch_test_detach", move || {
            captured.fetch_add(1, Ordering::SeqCst);
        }))
        .detach();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "detached task never ran");
            std::thread::sleep(Duration::from_micros(50));
        }
    }
}
