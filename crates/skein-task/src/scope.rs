//! Progress tracking for groups of related tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{TaskError, TaskResult};

/// How long a blocking wait may run.
#[derive(Clone, Copy, Debug)]
pub enum Timeout {
    /// Poll: fail immediately if the condition is not already met.
    Immediate,
    /// Wait up to the given duration.
    After(Duration),
    /// Wait until the condition is met, however long that takes.
    Infinite,
}

impl Timeout {
    fn as_deadline(self) -> Option<Instant> {
        match self {
            Timeout::Immediate => Some(Instant::now()),
            // A duration too large to represent waits forever.
            Timeout::After(duration) => Instant::now().checked_add(duration),
            Timeout::Infinite => None,
        }
    }
}

struct ScopeState {
    live_tasks: usize,
    failure: Option<TaskError>,
}

/// Tracks every live task created on behalf of one logical owner (a queue)
/// and latches the first failure any of them reports.
///
/// A task counts as live from construction until its node is destroyed,
/// which happens only after its cleanup ran and its outbound edges fired;
/// idleness therefore implies all transient state of the scope's
/// submissions has been reclaimed.
pub struct TaskScope {
    name: String,
    state: Mutex<ScopeState>,
    idle: Condvar,
}

impl TaskScope {
    pub fn new(name: impl Into<String>) -> Arc<TaskScope> {
        Arc::new(TaskScope {
            name: name.into(),
            state: Mutex::new(ScopeState {
                live_tasks: 0,
                failure: None,
            }),
            idle: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().live_tasks == 0
    }

    /// First failure reported by any task of this scope, if any.
    pub fn failure(&self) -> Option<TaskError> {
        self.state.lock().failure.clone()
    }

    /// Latches `status` as the scope's permanent failure if none is set.
    pub fn fail(&self, status: TaskError) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            warn!(scope = %self.name, error = %status, "scope entered failure state");
            state.failure = Some(status);
        }
    }

    /// Blocks until every task of the scope has been destroyed or the
    /// timeout passes. Returns the scope's latched failure once idle.
    pub fn wait_idle(&self, timeout: Timeout) -> TaskResult<()> {
        let deadline = timeout.as_deadline();
        let mut state = self.state.lock();
        while state.live_tasks > 0 {
            match deadline {
                None => self.idle.wait(&mut state),
                Some(deadline) => {
                    if self.idle.wait_until(&mut state, deadline).timed_out()
                        && state.live_tasks > 0
                    {
                        return Err(TaskError::DeadlineExceeded);
                    }
                }
            }
        }
        match &state.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn register_task(&self) {
        self.state.lock().live_tasks += 1;
    }

    pub(crate) fn unregister_task(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.live_tasks > 0, "scope task accounting underflow");
        state.live_tasks -= 1;
        if state.live_tasks == 0 {
            self.idle.notify_all();
        }
    }
}
