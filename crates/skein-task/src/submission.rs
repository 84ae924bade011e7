use std::sync::Arc;

use crate::task::Task;

/// An ordered set of tasks being handed to the executor together.
///
/// Built on the stack by submitters and by task bodies that fan out
/// sub-graphs, then absorbed by the executor. Each enqueued task has one
/// pending dependency discharged when the submission is absorbed (see
/// [`Task`] for the dependency accounting rules).
#[derive(Default)]
pub struct TaskSubmission {
    tasks: Vec<Arc<Task>>,
}

impl TaskSubmission {
    pub fn new() -> TaskSubmission {
        TaskSubmission::default()
    }

    pub fn enqueue(&mut self, task: Arc<Task>) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn into_tasks(self) -> Vec<Arc<Task>> {
        self.tasks
    }
}
