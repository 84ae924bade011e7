//! Reference-counted task DAG nodes.
//!
//! A [`Task`] pairs a behavior ([`TaskOps`]) with the linkage the executor
//! uses to drive a graph: a pending-dependency counter, a completion edge, a
//! sequence edge, and a poison slot carrying the first upstream failure.
//!
//! # Dependency accounting
//!
//! Readiness is a single atomic counter. Every task is created with one
//! pending dependency, the construction latch, and gains one more for each
//! inbound edge (completion, sequence, or semaphore timepoint). Each
//! dependency is discharged exactly once: the construction latch when the
//! task is handed to the executor (submission absorption or
//! [`ExecutorHandle::schedule`]), edge dependencies when the upstream task
//! or timepoint fires. Whichever discharge drives the counter to zero runs
//! the task, so a task can never run twice or before its graph is fully
//! wired.
//!
//! [`ExecutorHandle::schedule`]: crate::executor::ExecutorHandle::schedule

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{TaskError, TaskResult};
use crate::executor::ExecutorHandle;
use crate::scope::TaskScope;
use crate::submission::TaskSubmission;

/// Context handed to task bodies by the executor worker running them.
pub struct TaskContext<'a> {
    /// Handle to the executor driving this task.
    pub executor: &'a ExecutorHandle,
    /// Output parameter: tasks made ready by this body (sub-graph leaves,
    /// resolved waits) are enqueued here and absorbed by the worker.
    pub pending: &'a mut TaskSubmission,
}

/// Behavior of one task node.
pub trait TaskOps: Send + Sync + 'static {
    /// Runs the task body. Bodies run to completion on a worker thread and
    /// never block on other tasks; downstream work is expressed through the
    /// pending submission instead.
    fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult<()>;

    /// Invoked exactly once with the terminal status, after the body ran or
    /// in its place when the task was poisoned. Cleanup must not assume the
    /// body ran.
    fn cleanup(&self, status: &TaskResult<()>) {
        let _ = status;
    }
}

#[derive(Default)]
struct TaskLinks {
    completion: Option<Arc<Task>>,
    sequence: Option<Arc<Task>>,
    poison: Option<TaskError>,
}

/// One node in a task graph.
pub struct Task {
    scope: Arc<TaskScope>,
    ops: Box<dyn TaskOps>,
    pending_dependencies: AtomicUsize,
    links: Mutex<TaskLinks>,
}

impl Task {
    /// Creates a task registered in `scope`, carrying the construction
    /// latch as its first pending dependency.
    pub fn new(scope: &Arc<TaskScope>, ops: impl TaskOps) -> Arc<Task> {
        scope.register_task();
        Arc::new(Task {
            scope: scope.clone(),
            ops: Box::new(ops),
            pending_dependencies: AtomicUsize::new(1),
            links: Mutex::new(TaskLinks::default()),
        })
    }

    pub fn scope(&self) -> &Arc<TaskScope> {
        &self.scope
    }

    /// Sets the task notified when this task completes. Failure statuses
    /// propagate along this edge by poisoning the target.
    ///
    /// Single assignment; must be wired before this task is handed to the
    /// executor.
    pub fn set_completion_task(&self, task: &Arc<Task>) {
        task.add_dependency();
        let mut links = self.links.lock();
        debug_assert!(
            links.completion.is_none(),
            "completion task may only be set once"
        );
        links.completion = Some(task.clone());
    }

    /// Sets the task readied when this task completes, without propagating
    /// status. Used to serialize successive queue issues in FIFO order.
    ///
    /// Single assignment. Unlike the completion edge this may be wired after
    /// this task was handed to the executor, provided the caller serializes
    /// against this task's cleanup (the queue does so with its tail mutex).
    pub fn set_sequence_task(&self, task: &Arc<Task>) {
        task.add_dependency();
        let mut links = self.links.lock();
        debug_assert!(
            links.sequence.is_none(),
            "sequence task may only be set once"
        );
        links.sequence = Some(task.clone());
    }

    /// Adds one pending dependency. Paired with exactly one discharge.
    pub fn add_dependency(&self) {
        self.pending_dependencies.fetch_add(1, Ordering::AcqRel);
    }

    /// Discharges one pending dependency, returning true when the task
    /// became ready and must now be run by the caller's executor.
    pub fn release_dependency(&self) -> bool {
        let previous = self.pending_dependencies.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "dependency accounting underflow");
        previous == 1
    }

    /// Records an upstream failure. The first poison wins; later ones are
    /// dropped. A poisoned task skips its body and finishes with the
    /// recorded status so the graph drains.
    pub fn poison(&self, status: TaskError) {
        let mut links = self.links.lock();
        if links.poison.is_none() {
            links.poison = Some(status);
        }
    }

    fn take_poison(&self) -> Option<TaskError> {
        self.links.lock().poison.take()
    }

    /// Runs body and cleanup, then fires the outbound edges. Worker-only.
    pub(crate) fn run(&self, ctx: &mut TaskContext<'_>) {
        let status = match self.take_poison() {
            Some(poison) => Err(poison),
            None => self.ops.execute(ctx),
        };
        self.finish(status, ctx);
    }

    fn finish(&self, status: TaskResult<()>, ctx: &mut TaskContext<'_>) {
        self.ops.cleanup(&status);
        if let Err(err) = &status {
            self.scope.fail(err.clone());
        }
        let (completion, sequence) = {
            let mut links = self.links.lock();
            (links.completion.take(), links.sequence.take())
        };
        if let Some(next) = completion {
            if let Err(err) = &status {
                next.poison(err.clone());
            }
            ctx.pending.enqueue(next);
        }
        if let Some(next) = sequence {
            ctx.pending.enqueue(next);
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.scope.unregister_task();
    }
}
