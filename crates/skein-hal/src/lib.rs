//! Queue core of the skein hardware abstraction layer.
//!
//! The HAL executes pre-compiled command buffers on CPU-like backends under
//! the `skein-task` work-stealing executor. Callers describe work as
//! [`SubmissionBatch`]es (wait semaphores, command buffers, signal
//! semaphores) and a [`Queue`] turns each batch into a small task DAG:
//! an optional wait task gating on semaphore timepoints, an issue task that
//! fans out every command buffer's own sub-graph, and a retire task that
//! signals (or fails) the batch's semaphores and reclaims the submission's
//! transient arena. Issues on one queue run in FIFO submission order; the
//! commands they fan out may overlap freely.

pub mod command_buffer;
pub mod queue;
pub mod semaphore;

pub use command_buffer::{CallbackCommandBuffer, CommandBuffer};
pub use queue::{Queue, QueueState, SubmissionBatch};
pub use semaphore::{Semaphore, SemaphoreList};

pub use skein_task::{TaskError, TaskResult};
