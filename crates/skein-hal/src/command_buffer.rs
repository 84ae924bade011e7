//! The seam between the queue and command-buffer implementations.

use std::sync::Arc;

use skein_task::{Arena, Task, TaskContext, TaskOps, TaskResult, TaskSubmission};

use crate::queue::QueueState;

/// A pre-recorded command buffer that knows how to enqueue its own task
/// sub-graph into a pending submission.
///
/// `issue` is called from the queue's issue task once the batch's waits are
/// satisfied. Implementations enqueue zero or more leaf tasks into
/// `pending`, wiring every leaf's completion to `completion_task` so the
/// batch retires only after all of its commands finished. The shared
/// `arena` is the submission's transient allocator and outlives every task
/// of the sub-graph.
pub trait CommandBuffer: Send + Sync + 'static {
    fn issue(
        &self,
        queue_state: &QueueState,
        completion_task: &Arc<Task>,
        arena: &Arena,
        pending: &mut TaskSubmission,
    ) -> TaskResult<()>;
}

/// The simplest issuer: a single leaf task that runs a host callback.
///
/// Useful as a reference implementation of the seam and for tests that
/// need observable (or failing) commands without a full recording layer.
pub struct CallbackCommandBuffer {
    callback: Arc<dyn Fn() -> TaskResult<()> + Send + Sync>,
}

impl CallbackCommandBuffer {
    pub fn new(callback: impl Fn() -> TaskResult<()> + Send + Sync + 'static) -> CallbackCommandBuffer {
        CallbackCommandBuffer {
            callback: Arc::new(callback),
        }
    }
}

impl CommandBuffer for CallbackCommandBuffer {
    fn issue(
        &self,
        _queue_state: &QueueState,
        completion_task: &Arc<Task>,
        _arena: &Arena,
        pending: &mut TaskSubmission,
    ) -> TaskResult<()> {
        let leaf = Task::new(
            completion_task.scope(),
            CallbackTask {
                callback: self.callback.clone(),
            },
        );
        leaf.set_completion_task(completion_task);
        pending.enqueue(leaf);
        Ok(())
    }
}

struct CallbackTask {
    callback: Arc<dyn Fn() -> TaskResult<()> + Send + Sync>,
}

impl TaskOps for CallbackTask {
    fn execute(&self, _ctx: &mut TaskContext<'_>) -> TaskResult<()> {
        (self.callback)()
    }
}
