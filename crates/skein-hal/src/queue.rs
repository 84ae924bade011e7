//! The per-queue submission pipeline.
//!
//! Each submitted batch becomes a small task DAG:
//!
//! ```text
//!   (previous issue) ---sequence---+     Successive issues on one queue run
//!                                  |     in submission order; only the issue
//!   [wait task] --- timepoints     |     is serialized, the commands two
//!        |          on semaphores  |     batches fan out may still overlap.
//!        v                         v
//!   [issue task] --- fans each command buffer's sub-graph into the
//!        |           pending submission, every leaf completing into the
//!        v           retire task
//!   [retire task] -- signals (or fails) the batch's semaphores and
//!        |           reclaims the submission arena
//!        v
//!   [fence]
//! ```
//!
//! The wait task exists only when the batch has waits. Waits whose
//! semaphore already reached the threshold register nothing at all; FIFO
//! stitching guarantees that for same-queue signal/wait chains the signal
//! ran first, so only cross-queue and external waits ever park.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use skein_task::{
    Arena, ArenaBlockPool, ExecutorHandle, Task, TaskContext, TaskError, TaskOps, TaskResult,
    TaskScope, TaskSubmission, Timeout,
};

use crate::command_buffer::CommandBuffer;
use crate::semaphore::{SemaphoreClones, SemaphoreList};

/// One unit of caller intent: wait until the wait semaphores reach their
/// payload values, execute the command buffers, then advance the signal
/// semaphores to theirs.
#[derive(Clone, Copy, Default)]
pub struct SubmissionBatch<'a> {
    pub wait_semaphores: SemaphoreList<'a>,
    pub command_buffers: &'a [Arc<dyn CommandBuffer>],
    pub signal_semaphores: SemaphoreList<'a>,
}

/// Executor-facing per-queue state passed to every command-buffer issue.
pub struct QueueState {
    identifier: String,
    issued_batches: AtomicU64,
}

impl QueueState {
    fn new(identifier: &str) -> QueueState {
        QueueState {
            identifier: identifier.to_string(),
            issued_batches: AtomicU64::new(0),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Number of batches whose issue task has begun executing.
    pub fn issued_batches(&self) -> u64 {
        self.issued_batches.load(Ordering::Relaxed)
    }

    fn record_issue(&self) -> u64 {
        self.issued_batches.fetch_add(1, Ordering::Relaxed) + 1
    }
}

struct TailIssue {
    serial: u64,
    task: Arc<Task>,
}

/// State shared between the queue and its in-flight issue tasks.
struct QueueShared {
    /// Most recently submitted issue task whose cleanup has not run yet;
    /// the FIFO anchor the next submission stitches onto.
    tail_issue_task: Mutex<Option<TailIssue>>,
    submission_serial: AtomicU64,
}

/// A FIFO submission queue executing batches under a shared executor.
///
/// Dropping the queue waits (without a deadline) for everything in flight
/// to retire; submitting work that can never complete and then dropping the
/// queue therefore blocks until some other party fails or signals the
/// blocking semaphore.
pub struct Queue {
    executor: ExecutorHandle,
    block_pool: Arc<ArenaBlockPool>,
    scope: Arc<TaskScope>,
    shared: Arc<QueueShared>,
    state: Arc<QueueState>,
}

impl Queue {
    pub fn new(
        identifier: impl Into<String>,
        executor: ExecutorHandle,
        block_pool: Arc<ArenaBlockPool>,
    ) -> Queue {
        let identifier = identifier.into();
        let state = Arc::new(QueueState::new(&identifier));
        Queue {
            executor,
            block_pool,
            scope: TaskScope::new(identifier),
            shared: Arc::new(QueueShared {
                tail_issue_task: Mutex::new(None),
                submission_serial: AtomicU64::new(0),
            }),
            state,
        }
    }

    pub fn identifier(&self) -> &str {
        self.state.identifier()
    }

    pub fn state(&self) -> &QueueState {
        &self.state
    }

    /// Submits `batches` in order. Returns the first batch-construction
    /// error; batches enqueued before the failing one stay enqueued and run
    /// to completion. The executor is flushed before returning either way.
    pub fn submit(&self, batches: &[SubmissionBatch<'_>]) -> TaskResult<()> {
        trace!(queue = %self.identifier(), batches = batches.len(), "queue submit");
        let mut result = Ok(());
        for batch in batches {
            if let Err(err) = self.submit_batch(batch) {
                result = Err(err);
                break;
            }
        }
        self.executor.flush();
        result
    }

    /// Blocks until every previously submitted batch has retired, returning
    /// the scope's propagated failure if any batch failed.
    pub fn wait_idle(&self, timeout: Timeout) -> TaskResult<()> {
        trace!(queue = %self.identifier(), "queue wait idle");
        self.scope.wait_idle(timeout)
    }

    fn submit_batch(&self, batch: &SubmissionBatch<'_>) -> TaskResult<()> {
        let wait_count = batch.wait_semaphores.validate()?;

        // The retire task comes first: it owns the arena every other
        // allocation of this submission lives in, including the cloned
        // semaphore lists. Until the graph reaches the executor, dropping
        // these locals is the failure path: clones release their retained
        // semaphores and the arena returns its blocks.
        let arena = Arc::new(Arena::new(self.block_pool.clone()));
        let signals = SemaphoreClones::clone_into(&batch.signal_semaphores, &arena)?;
        let signal_count = signals.len();
        let retire = Task::new(&self.scope, RetireCommand::new(signals, arena.clone()));

        let fence = self.executor.acquire_fence(&self.scope);
        retire.set_completion_task(&fence);

        let serial = self.shared.submission_serial.fetch_add(1, Ordering::Relaxed);
        let issue = Task::new(
            &self.scope,
            IssueCommand {
                queue: Arc::downgrade(&self.shared),
                state: self.state.clone(),
                serial,
                retire: retire.clone(),
                command_buffers: batch.command_buffers.to_vec().into_boxed_slice(),
                arena: arena.clone(),
            },
        );
        issue.set_completion_task(&retire);

        let wait = if wait_count > 0 {
            let waits = SemaphoreClones::clone_into(&batch.wait_semaphores, &arena)?;
            let wait = Task::new(
                &self.scope,
                WaitCommand {
                    waits: Mutex::new(Some(waits)),
                    target: issue.clone(),
                    _arena: arena,
                },
            );
            wait.set_completion_task(&issue);
            Some(wait)
        } else {
            None
        };

        debug!(
            queue = %self.identifier(),
            serial,
            waits = wait_count,
            commands = batch.command_buffers.len(),
            signals = signal_count,
            "submitting batch"
        );

        // FIFO stitching: serialize this issue behind the previous one.
        // Seeing a tail here means its cleanup (which clears the tail under
        // this mutex before the task's edges fire) has not run, so the
        // sequence edge is guaranteed to be observed.
        {
            let mut tail = self.shared.tail_issue_task.lock();
            if let Some(previous) = tail.as_ref() {
                previous.task.set_sequence_task(&issue);
            }
            *tail = Some(TailIssue {
                serial,
                task: issue.clone(),
            });
        }

        // The graph is fully wired; discharge the construction latches of
        // the dependent tasks. None of them can become ready here: the
        // retire waits on the issue, the fence on the retire, and a
        // wait-gated issue on its wait task.
        let root = if let Some(wait) = wait {
            self.executor.schedule(issue);
            wait
        } else {
            issue
        };
        self.executor.schedule(retire);
        self.executor.schedule(fence);

        let mut submission = TaskSubmission::new();
        submission.enqueue(root);
        self.executor.submit(submission);
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // Shutdown path: drain whatever is in flight, ignoring the status.
        let _ = self.scope.wait_idle(Timeout::Infinite);
        debug_assert!(
            self.shared.tail_issue_task.lock().is_none(),
            "tail issue task must be clear once the queue is idle"
        );
    }
}

/// Optional head of a submission's DAG: registers one timepoint per wait
/// semaphore, gating the issue task until all are satisfied. Waits already
/// satisfied at registration add nothing.
struct WaitCommand {
    waits: Mutex<Option<SemaphoreClones>>,
    /// The issue task the timepoints discharge into; also this task's
    /// completion.
    target: Arc<Task>,
    /// Keeps the cloned list's backing blocks alive on teardown paths where
    /// this command is destroyed without having run.
    _arena: Arc<Arena>,
}

impl TaskOps for WaitCommand {
    fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult<()> {
        let guard = self.waits.lock();
        let Some(waits) = guard.as_ref() else {
            return Err(TaskError::internal("wait command state already reclaimed"));
        };
        waits.enqueue_timepoints(&self.target, ctx.executor)
    }

    fn cleanup(&self, _status: &TaskResult<()>) {
        // Dropping the clones releases every retained wait semaphore; the
        // list memory itself is reclaimed with the submission arena.
        drop(self.waits.lock().take());
    }
}

/// Issues every command buffer of the batch, fanning their sub-graphs into
/// the pending submission. After this task completes the commands have been
/// issued but may finish in any order; only the retire task observes their
/// completion.
struct IssueCommand {
    queue: Weak<QueueShared>,
    state: Arc<QueueState>,
    serial: u64,
    retire: Arc<Task>,
    command_buffers: Box<[Arc<dyn CommandBuffer>]>,
    arena: Arc<Arena>,
}

impl TaskOps for IssueCommand {
    fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult<()> {
        let issued = self.state.record_issue();
        trace!(
            queue = %self.state.identifier(),
            serial = self.serial,
            issued,
            commands = self.command_buffers.len(),
            "issuing command buffers"
        );
        // No command buffers is fine: the submission is synchronization
        // only.
        for command_buffer in self.command_buffers.iter() {
            command_buffer.issue(&self.state, &self.retire, &self.arena, ctx.pending)?;
        }
        Ok(())
    }

    fn cleanup(&self, _status: &TaskResult<()>) {
        // Clear the queue's FIFO anchor if it still points at this issue so
        // a later submission cannot stitch onto a retired task. Runs before
        // this task's edges fire, serialized by the tail mutex.
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let mut tail = queue.tail_issue_task.lock();
        if tail.as_ref().is_some_and(|tail| tail.serial == self.serial) {
            *tail = None;
        }
    }
}

struct RetireState {
    // Declaration order is load-bearing: the cloned list points into the
    // arena and must drop (releasing its retained semaphores) first.
    signals: SemaphoreClones,
    arena: Arc<Arena>,
}

/// Terminal task of a submission. Signals the batch's semaphores on
/// success, fails them all on any upstream or signalling failure, and
/// reclaims the submission arena.
struct RetireCommand {
    state: Mutex<Option<RetireState>>,
}

impl RetireCommand {
    fn new(signals: SemaphoreClones, arena: Arc<Arena>) -> RetireCommand {
        RetireCommand {
            state: Mutex::new(Some(RetireState { signals, arena })),
        }
    }
}

impl TaskOps for RetireCommand {
    fn execute(&self, _ctx: &mut TaskContext<'_>) -> TaskResult<()> {
        let guard = self.state.lock();
        match guard.as_ref() {
            Some(state) => state.signals.signal_all(),
            None => Err(TaskError::internal("retire command state already reclaimed")),
        }
    }

    fn cleanup(&self, status: &TaskResult<()>) {
        // Move the submission state out before teardown: once the arena
        // drops, its blocks are back in the pool and nothing may touch
        // them.
        let Some(state) = self.state.lock().take() else {
            return;
        };
        if let Err(err) = status {
            // Fail every signal semaphore so dependents on any queue
            // observe the failure instead of hanging.
            state.signals.fail_all(err);
        }
        drop(state);
    }
}
