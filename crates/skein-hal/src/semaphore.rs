//! Timeline semaphores: monotonically advancing 64-bit payloads with a
//! failure latch, shared between producers and consumers across queues.
//!
//! Waiters register *timepoints*: a target task plus a threshold value.
//! The semaphore discharges one dependency of the target task when its
//! value reaches the threshold. A wait whose threshold is already satisfied
//! at registration never creates a timepoint at all; FIFO issue ordering on
//! a queue guarantees this for same-queue signal/wait chains, so only
//! cross-queue and external waits ever park.

use std::alloc::Layout;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use skein_task::{Arena, ExecutorHandle, Task, TaskError, TaskResult};

/// A timeline semaphore handle. Cloning retains the underlying semaphore;
/// dropping the last handle (and the last in-flight submission reference)
/// releases it.
#[derive(Clone)]
pub struct Semaphore {
    shared: Arc<SemaphoreShared>,
}

impl Semaphore {
    pub fn new(initial_value: u64) -> Semaphore {
        Semaphore {
            shared: Arc::new(SemaphoreShared {
                state: Mutex::new(SemaphoreState {
                    value: initial_value,
                    failure: None,
                    timepoints: Vec::new(),
                }),
            }),
        }
    }

    /// Current payload value, or the latched failure.
    pub fn query(&self) -> TaskResult<u64> {
        let state = self.shared.state.lock();
        match &state.failure {
            Some(err) => Err(err.clone()),
            None => Ok(state.value),
        }
    }

    /// Advances the payload to `value`. The payload may never move
    /// backwards, and a failed semaphore cannot be signalled again.
    pub fn signal(&self, value: u64) -> TaskResult<()> {
        self.shared.signal(value)
    }

    /// Latches `status` as the semaphore's permanent failure and fails
    /// every registered and future waiter with a clone of it.
    pub fn fail(&self, status: TaskError) {
        self.shared.fail(status);
    }

    /// Registers `target` to have one dependency discharged once the
    /// payload reaches `value`. Already-satisfied thresholds register
    /// nothing; already-failed semaphores return the latched failure.
    pub fn enqueue_timepoint(
        &self,
        value: u64,
        target: &Arc<Task>,
        executor: &ExecutorHandle,
    ) -> TaskResult<()> {
        self.shared.enqueue_timepoint(value, target, executor)
    }

    /// Number of registered, not yet satisfied timepoints.
    pub fn pending_timepoints(&self) -> usize {
        self.shared.state.lock().timepoints.len()
    }

    pub(crate) fn shared(&self) -> &Arc<SemaphoreShared> {
        &self.shared
    }
}

pub(crate) struct SemaphoreShared {
    state: Mutex<SemaphoreState>,
}

struct SemaphoreState {
    value: u64,
    failure: Option<TaskError>,
    timepoints: Vec<Timepoint>,
}

/// One registered wait. Owned by the semaphore, not by the submission that
/// created it, so a timepoint can never dangle into a retired submission's
/// arena.
struct Timepoint {
    threshold: u64,
    target: Arc<Task>,
    executor: ExecutorHandle,
}

impl SemaphoreShared {
    pub(crate) fn signal(&self, value: u64) -> TaskResult<()> {
        let fired = {
            let mut state = self.state.lock();
            if let Some(err) = &state.failure {
                return Err(TaskError::failed_precondition(format!(
                    "semaphore already failed: {err}"
                )));
            }
            if value < state.value {
                return Err(TaskError::invalid_argument(format!(
                    "semaphore payload may not move backwards: current {}, requested {}",
                    state.value, value
                )));
            }
            state.value = value;
            drain_satisfied(&mut state.timepoints, value)
        };
        for timepoint in fired {
            timepoint.executor.schedule(timepoint.target);
        }
        Ok(())
    }

    pub(crate) fn fail(&self, status: TaskError) {
        let (latched, fired) = {
            let mut state = self.state.lock();
            if state.failure.is_none() {
                warn!(error = %status, "semaphore entered failure state");
            }
            let latched = state.failure.get_or_insert(status).clone();
            (latched, std::mem::take(&mut state.timepoints))
        };
        for timepoint in fired {
            timepoint.target.poison(latched.clone());
            timepoint.executor.schedule(timepoint.target);
        }
    }

    pub(crate) fn enqueue_timepoint(
        &self,
        threshold: u64,
        target: &Arc<Task>,
        executor: &ExecutorHandle,
    ) -> TaskResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }
        if state.value >= threshold {
            // Already satisfied: the wait is elided entirely.
            return Ok(());
        }
        target.add_dependency();
        state.timepoints.push(Timepoint {
            threshold,
            target: target.clone(),
            executor: executor.clone(),
        });
        Ok(())
    }
}

fn drain_satisfied(timepoints: &mut Vec<Timepoint>, value: u64) -> Vec<Timepoint> {
    let mut fired = Vec::new();
    let mut index = 0;
    while index < timepoints.len() {
        if timepoints[index].threshold <= value {
            fired.push(timepoints.swap_remove(index));
        } else {
            index += 1;
        }
    }
    fired
}

/// Borrowed parallel lists of semaphores and the payload values they are
/// waited on or signalled to. Indices correspond; lengths must match.
#[derive(Clone, Copy, Default)]
pub struct SemaphoreList<'a> {
    pub semaphores: &'a [Semaphore],
    pub payload_values: &'a [u64],
}

impl SemaphoreList<'_> {
    pub fn is_empty(&self) -> bool {
        self.semaphores.is_empty()
    }

    /// Checks the parallel-list invariant, returning the shared length.
    pub fn validate(&self) -> TaskResult<usize> {
        if self.semaphores.len() != self.payload_values.len() {
            return Err(TaskError::invalid_argument(format!(
                "semaphore list length mismatch: {} semaphores, {} payload values",
                self.semaphores.len(),
                self.payload_values.len()
            )));
        }
        Ok(self.semaphores.len())
    }
}

/// A semaphore list cloned into a submission arena: one contiguous region
/// holding N retained raw semaphore references followed by N payload
/// values.
///
/// Every referenced semaphore is retained at clone time and released
/// exactly once: explicitly when the owning command cleans up, or on drop
/// for graphs that were torn down before reaching the executor. The region
/// itself is reclaimed with the arena, which the owning command keeps alive
/// for at least as long as this list exists.
pub(crate) struct SemaphoreClones {
    semaphores: NonNull<*const SemaphoreShared>,
    payload_values: NonNull<u64>,
    count: usize,
    released: bool,
}

// SAFETY: the raw entries are retained `Arc<SemaphoreShared>` references
// (thread-safe targets) in arena memory only this list touches; `released`
// is only mutated through exclusive access.
unsafe impl Send for SemaphoreClones {}
unsafe impl Sync for SemaphoreClones {}

impl SemaphoreClones {
    /// Clones `source` into `arena`, retaining every semaphore. Fails
    /// without retaining anything if the list is malformed or the arena is
    /// exhausted.
    pub(crate) fn clone_into(
        source: &SemaphoreList<'_>,
        arena: &Arena,
    ) -> TaskResult<SemaphoreClones> {
        let count = source.validate()?;
        if count == 0 {
            return Ok(SemaphoreClones {
                semaphores: NonNull::dangling(),
                payload_values: NonNull::dangling(),
                count: 0,
                released: false,
            });
        }

        let refs_size = count * size_of::<*const SemaphoreShared>();
        let total_size = refs_size + count * size_of::<u64>();
        let layout = Layout::from_size_align(total_size, size_of::<*const SemaphoreShared>())
            .map_err(|err| TaskError::invalid_argument(format!("bad clone layout: {err}")))?;
        let buffer = arena.allocate(layout)?;

        let semaphores = buffer.cast::<*const SemaphoreShared>();
        // SAFETY: refs_size is within the allocation; the payload region
        // starts 8-byte aligned because the reference region is a whole
        // number of pointers.
        let payload_values =
            unsafe { NonNull::new_unchecked(buffer.as_ptr().add(refs_size)).cast::<u64>() };

        for (index, semaphore) in source.semaphores.iter().enumerate() {
            let retained = Arc::into_raw(semaphore.shared().clone());
            // SAFETY: index < count, so both writes stay inside the regions
            // carved out above.
            unsafe {
                semaphores.as_ptr().add(index).write(retained);
                payload_values
                    .as_ptr()
                    .add(index)
                    .write(source.payload_values[index]);
            }
        }

        Ok(SemaphoreClones {
            semaphores,
            payload_values,
            count,
            released: false,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    fn entry(&self, index: usize) -> (&SemaphoreShared, u64) {
        debug_assert!(index < self.count && !self.released);
        // SAFETY: index is in bounds, the entries were initialized by
        // `clone_into`, and the retained reference keeps the target alive
        // until `release`.
        unsafe {
            (
                &*self.semaphores.as_ptr().add(index).read(),
                self.payload_values.as_ptr().add(index).read(),
            )
        }
    }

    /// Signals each semaphore to its payload value, stopping at the first
    /// failure.
    pub(crate) fn signal_all(&self) -> TaskResult<()> {
        for index in 0..self.count {
            let (semaphore, value) = self.entry(index);
            semaphore.signal(value)?;
        }
        Ok(())
    }

    /// Fails every semaphore with a clone of `status`.
    pub(crate) fn fail_all(&self, status: &TaskError) {
        for index in 0..self.count {
            let (semaphore, _) = self.entry(index);
            semaphore.fail(status.clone());
        }
    }

    /// Registers one timepoint per entry on `target`, stopping at the first
    /// registration failure.
    pub(crate) fn enqueue_timepoints(
        &self,
        target: &Arc<Task>,
        executor: &ExecutorHandle,
    ) -> TaskResult<()> {
        for index in 0..self.count {
            let (semaphore, value) = self.entry(index);
            semaphore.enqueue_timepoint(value, target, executor)?;
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for index in 0..self.count {
            // SAFETY: each entry holds exactly one retained reference from
            // `clone_into`, released exactly once here.
            unsafe {
                drop(Arc::from_raw(self.semaphores.as_ptr().add(index).read()));
            }
        }
    }
}

impl Drop for SemaphoreClones {
    fn drop(&mut self) {
        self.release();
    }
}
