//! Counted task aggregation with a single-fire completion task.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dispatch::{dispatch_into, dispatch_list_into, Task, TaskHandle};

/// How long [`Job::wait`] sleeps between status polls.
const WAIT_CHECK_DELAY: Duration = Duration::from_micros(100);

const STATE_ASSEMBLING: u32 = 0;
const STATE_RELEASED: u32 = 1;
const STATE_DETACHED: u32 = 2;
// A job that thinks it has completed first parks in the finishing state,
// so a concurrent wait or detach cannot reclaim it while the completion
// task is still being fired.
const STATE_FINISHING: u32 = 3;
const STATE_COMPLETED: u32 = 4;

const TASK_COUNT_BITS: u32 = 24;
const TASK_COUNT_MASK: u32 = (1 << TASK_COUNT_BITS) - 1;

fn pack(state: u32, outstanding: u32) -> u32 {
    (state << TASK_COUNT_BITS) | outstanding
}

fn state_of(status: u32) -> u32 {
    status >> TASK_COUNT_BITS
}

fn outstanding_of(status: u32) -> u32 {
    status & TASK_COUNT_MASK
}

pub(crate) struct JobInner {
    status: AtomicU32,
    completion: Mutex<Option<Task>>,
}

impl JobInner {
    fn fire_completion(&self) {
        if let Some(task) = self.completion.lock().unwrap().take() {
            dispatch_into(None, task).detach();
        }
    }

    pub(crate) fn report_task_finished(&self) {
        let mut old_status = self.status.load(Ordering::Acquire);
        let new_status = loop {
            debug_assert_ne!(state_of(old_status), STATE_COMPLETED);
            debug_assert!(outstanding_of(old_status) > 0);

            let mut new_status = old_status - 1;
            if state_of(old_status) != STATE_ASSEMBLING && outstanding_of(new_status) == 0 {
                new_status = pack(STATE_FINISHING, 0);
            }

            match self.status.compare_exchange_weak(
                old_status,
                new_status,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break new_status,
                Err(current) => old_status = current,
            }
        };

        if new_status == pack(STATE_FINISHING, 0) {
            let old_state = state_of(old_status);
            debug_assert!(old_state == STATE_RELEASED || old_state == STATE_DETACHED);
            self.fire_completion();

            if old_state != STATE_DETACHED {
                // Nothing can move us out of finishing; publish completed.
                let swapped = self.status.compare_exchange(
                    pack(STATE_FINISHING, 0),
                    pack(STATE_COMPLETED, 0),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                debug_assert!(swapped.is_ok());
            }
        }
    }
}

/// A counted set of tasks with an optional completion task.
///
/// Lifecycle: tasks are attached while the job is assembling, then the
/// job is [`release`](Self::release)d. Once released and drained, the
/// completion task (if any) is dispatched exactly once. The creator then
/// either [`wait`](Self::wait)s for completion or
/// [`detach`](Self::detach)es the handle.
///
/// Clones refer to the same job; `wait` and `detach` consume one handle
/// and any remaining clones keep observing the shared state.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub fn new() -> Self {
        Job {
            inner: Arc::new(JobInner {
                status: AtomicU32::new(pack(STATE_ASSEMBLING, 0)),
                completion: Mutex::new(None),
            }),
        }
    }

    /// Sets the task dispatched when the job completes. Only valid while
    /// the job is assembling.
    pub fn set_completion_task(&self, task: Task) {
        debug_assert_eq!(
            state_of(self.inner.status.load(Ordering::Acquire)),
            STATE_ASSEMBLING
        );
        *self.inner.completion.lock().unwrap() = Some(task);
    }

    /// Attaches `task` to the job and queues it for execution.
    pub fn dispatch_task(&self, task: Task) -> TaskHandle {
        let previous = self.inner.status.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(state_of(previous), STATE_ASSEMBLING);
        debug_assert!(outstanding_of(previous) + 1 < TASK_COUNT_MASK);
        dispatch_into(Some(Arc::clone(&self.inner)), task)
    }

    /// Attaches a batch of tasks in one submission.
    pub fn dispatch_task_list(&self, tasks: Vec<Task>) -> Vec<TaskHandle> {
        let count = tasks.len() as u32;
        let previous = self.inner.status.fetch_add(count, Ordering::AcqRel);
        debug_assert_eq!(state_of(previous), STATE_ASSEMBLING);
        debug_assert!(outstanding_of(previous) + count < TASK_COUNT_MASK);
        dispatch_list_into(Some(&self.inner), tasks)
    }

    /// Ends assembly. With no outstanding tasks the job completes on the
    /// spot, firing the completion task from the calling thread's queue
    /// submission.
    pub fn release(&self) {
        let mut old_status = self.inner.status.load(Ordering::Acquire);
        let new_status = loop {
            debug_assert_eq!(state_of(old_status), STATE_ASSEMBLING);
            let outstanding = outstanding_of(old_status);
            let new_status = if outstanding == 0 {
                pack(STATE_COMPLETED, 0)
            } else {
                pack(STATE_RELEASED, outstanding)
            };

            match self.inner.status.compare_exchange_weak(
                old_status,
                new_status,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break new_status,
                Err(current) => old_status = current,
            }
        };

        if new_status == pack(STATE_COMPLETED, 0) {
            self.inner.fire_completion();
        }
    }

    /// Gives the job handle up without waiting. The job still runs to
    /// completion and fires its completion task.
    pub fn detach(self) {
        let mut old_status = self.inner.status.load(Ordering::Acquire);
        loop {
            match state_of(old_status) {
                STATE_COMPLETED => return,
                STATE_FINISHING => {
                    std::hint::spin_loop();
                    old_status = self.inner.status.load(Ordering::Acquire);
                }
                STATE_RELEASED => {
                    let new_status = pack(STATE_DETACHED, outstanding_of(old_status));
                    match self.inner.status.compare_exchange_weak(
                        old_status,
                        new_status,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(current) => old_status = current,
                    }
                }
                other => unreachable!("detach from job state {}", other),
            }
        }
    }

    /// Blocks until the job completes, polling with a short sleep.
    pub fn wait(self) {
        loop {
            let status = self.inner.status.load(Ordering::Acquire);
            match state_of(status) {
                STATE_COMPLETED => return,
                STATE_FINISHING => std::hint::spin_loop(),
                STATE_RELEASED => std::thread::sleep(WAIT_CHECK_DELAY),
                other => unreachable!("wait on job state {}", other),
            }
        }
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn counting_task(name: &str, counter: &Arc<AtomicUsize>) -> Task {
        let captured = Arc::clone(counter);
        Task::new(name, move || {
            captured.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn await_counter(counter: &Arc<AtomicUsize>, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) != expected {
            assert!(Instant::now() < deadline, "counter never reached {}", expected);
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    #[test]
    fn empty_job_completes_on_release() {
        let fired = Arc::new(AtomicUsize::new(0));
        let job = Job::new();
        job.set_completion_task(counting_task("job_test_empty_completion", &fired));
        job.release();
        job.wait();
        await_counter(&fired, 1);
    }

    #[test]
    fn completion_runs_after_every_task() {
        let executed = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let job = Job::new();
        job.set_completion_task(counting_task("job_test_completion", &completed));
        for _ in 0..12 {
            job.dispatch_task(counting_task("job_test_member", &executed))
                .detach();
        }
        job.release();
        job.wait();

        assert_eq!(executed.load(Ordering::SeqCst), 12);
        await_counter(&completed, 1);
    }

    #[test]
    fn completion_fires_exactly_once() {
        for _ in 0..32 {
            let completed = Arc::new(AtomicUsize::new(0));
            let job = Job::new();
            job.set_completion_task(counting_task("job_test_once", &completed));
            job.dispatch_task(Task::new("job_test_once_member", || {}))
                .detach();
            job.release();
            job.wait();
            await_counter(&completed, 1);
            assert_eq!(completed.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn detached_job_still_completes() {
        let completed = Arc::new(AtomicUsize::new(0));
        let job = Job::new();
        job.set_completion_task(counting_task("job_test_detached", &completed));
        job.dispatch_task(Task::new("job_test_detached_member", || {
            std::thread::sleep(Duration::from_millis(1));
        }))
        .detach();
        job.release();
        job.detach();
        await_counter(&completed, 1);
    }

    #[test]
    fn task_list_counts_as_outstanding() {
        let executed = Arc::new(AtomicUsize::new(0));
        let job = Job::new();
        let tasks = (0..8)
            .map(|_| counting_task("job_test_list", &executed))
            .collect();
        for handle in job.dispatch_task_list(tasks) {
            handle.detach();
        }
        job.release();
        job.wait();
        assert_eq!(executed.load(Ordering::SeqCst), 8);
    }
}
