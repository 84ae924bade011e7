//! Work-stealing task executor.
//!
//! Workers pull from a local FIFO deque first, then batch-steal from the
//! global injector, then steal from sibling workers. Tasks made ready by a
//! running body land in that worker's local deque; externally submitted
//! work goes through [`ExecutorHandle::submit`]/[`ExecutorHandle::flush`]
//! staging so producers can build several submissions before waking anyone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_deque::{Injector, Steal, Stealer, Worker as WorkerQueue};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::scope::TaskScope;
use crate::submission::TaskSubmission;
use crate::task::{Task, TaskContext, TaskOps};
use crate::TaskResult;

/// Executor construction options.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecutorOptions {
    /// Number of worker threads; 0 selects the available parallelism.
    pub worker_count: usize,
}

struct ExecutorShared {
    injector: Injector<Arc<Task>>,
    stealers: Vec<Stealer<Arc<Task>>>,
    staged: Mutex<Vec<Arc<Task>>>,
    sleep: Mutex<()>,
    wake: Condvar,
    shutdown: AtomicBool,
}

/// Owns the worker threads. Dropping the executor signals shutdown, wakes
/// every worker, and joins them; in-flight tasks finish first.
pub struct Executor {
    handle: ExecutorHandle,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(options: ExecutorOptions) -> Executor {
        let worker_count = if options.worker_count == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            options.worker_count
        };
        let queues: Vec<WorkerQueue<Arc<Task>>> =
            (0..worker_count).map(|_| WorkerQueue::new_fifo()).collect();
        let stealers = queues.iter().map(|queue| queue.stealer()).collect();
        let shared = Arc::new(ExecutorShared {
            injector: Injector::new(),
            stealers,
            staged: Mutex::new(Vec::new()),
            sleep: Mutex::new(()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = queues
            .into_iter()
            .enumerate()
            .map(|(index, queue)| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("skein-worker-{index}"))
                    .spawn(move || worker_main(index, queue, shared))
                    .expect("failed to spawn executor worker thread")
            })
            .collect();
        Executor {
            handle: ExecutorHandle { shared },
            workers: Mutex::new(workers),
        }
    }

    /// Cheap shareable handle to the executor core.
    pub fn handle(&self) -> ExecutorHandle {
        self.handle.clone()
    }

    pub fn submit(&self, submission: TaskSubmission) {
        self.handle.submit(submission);
    }

    pub fn flush(&self) {
        self.handle.flush();
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        let shared = &self.handle.shared;
        shared.shutdown.store(true, Ordering::Release);
        {
            let _guard = shared.sleep.lock();
            shared.wake.notify_all();
        }
        for worker in self.workers.get_mut().drain(..) {
            let _ = worker.join();
        }
    }
}

/// Submission interface onto a live executor, cloneable and shareable with
/// queues, semaphores, and task bodies. Holding a handle keeps the
/// executor's queues alive but not its worker threads.
#[derive(Clone)]
pub struct ExecutorHandle {
    shared: Arc<ExecutorShared>,
}

impl ExecutorHandle {
    /// Stages a submission. The tasks become visible to workers on the next
    /// [`flush`](ExecutorHandle::flush).
    pub fn submit(&self, submission: TaskSubmission) {
        if submission.is_empty() {
            return;
        }
        self.shared.staged.lock().extend(submission.into_tasks());
    }

    /// Publishes all staged tasks to the workers and wakes them.
    pub fn flush(&self) {
        let staged = std::mem::take(&mut *self.shared.staged.lock());
        if staged.is_empty() {
            return;
        }
        trace!(count = staged.len(), "flushing staged tasks");
        for task in staged {
            if task.release_dependency() {
                self.shared.injector.push(task);
            }
        }
        let _guard = self.shared.sleep.lock();
        self.shared.wake.notify_all();
    }

    /// Hands one task to the executor, discharging one of its pending
    /// dependencies: the construction latch for a freshly wired task, or a
    /// satisfied wait edge for a task parked on a timepoint. The task runs
    /// once its remaining dependencies resolve; if this was the last one it
    /// is scheduled immediately.
    pub fn schedule(&self, task: Arc<Task>) {
        if task.release_dependency() {
            self.shared.injector.push(task);
            let _guard = self.shared.sleep.lock();
            self.shared.wake.notify_all();
        }
    }

    /// Returns a scope-bound fence: a no-op task used as the terminal
    /// completion of a graph so external observers can hang off it without
    /// coupling to the graph's own nodes. The caller wires it and then
    /// schedules it like any other dependent task.
    pub fn acquire_fence(&self, scope: &Arc<TaskScope>) -> Arc<Task> {
        Task::new(scope, FenceOps)
    }
}

struct FenceOps;

impl TaskOps for FenceOps {
    fn execute(&self, _ctx: &mut TaskContext<'_>) -> TaskResult<()> {
        Ok(())
    }
}

fn worker_main(index: usize, local: WorkerQueue<Arc<Task>>, shared: Arc<ExecutorShared>) {
    trace!(worker = index, "executor worker started");
    let handle = ExecutorHandle {
        shared: shared.clone(),
    };
    loop {
        if let Some(task) = find_task(&local, &shared) {
            run_task(task, &handle, &local, &shared);
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let mut guard = shared.sleep.lock();
        // Re-check under the sleep lock: a producer that pushed before we
        // got here also notifies under this lock, so we cannot miss it.
        if !shared.injector.is_empty() || shared.shutdown.load(Ordering::Acquire) {
            continue;
        }
        shared.wake.wait(&mut guard);
    }
    trace!(worker = index, "executor worker stopped");
}

fn find_task(local: &WorkerQueue<Arc<Task>>, shared: &ExecutorShared) -> Option<Arc<Task>> {
    if let Some(task) = local.pop() {
        return Some(task);
    }
    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(task) => return Some(task),
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }
    let mut retry = true;
    while retry {
        retry = false;
        for stealer in &shared.stealers {
            match stealer.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Retry => retry = true,
                Steal::Empty => {}
            }
        }
    }
    None
}

fn run_task(
    task: Arc<Task>,
    handle: &ExecutorHandle,
    local: &WorkerQueue<Arc<Task>>,
    shared: &ExecutorShared,
) {
    let mut pending = TaskSubmission::new();
    {
        let mut ctx = TaskContext {
            executor: handle,
            pending: &mut pending,
        };
        task.run(&mut ctx);
    }
    drop(task);

    let mut readied = 0usize;
    for next in pending.into_tasks() {
        if next.release_dependency() {
            local.push(next);
            readied += 1;
        }
    }
    // With more than one readied task there is parallelism to share; give
    // parked siblings a chance to steal.
    if readied > 1 {
        let _guard = shared.sleep.lock();
        shared.wake.notify_all();
    }
}
