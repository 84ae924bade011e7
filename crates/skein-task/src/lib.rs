//! Task-system primitives backing the skein hardware abstraction layer.
//!
//! The crate provides the pieces a queue implementation stitches together:
//! a shared [`TaskError`] status type, a block-pooled bump [`Arena`] for
//! per-submission transient state, reference-counted [`Task`] DAG nodes with
//! completion/sequence linkage, a [`TaskScope`] progress barrier, and a
//! work-stealing [`Executor`] that drives tasks on a pool of worker threads.
//! The API surface is intentionally low-level so higher layers (queues,
//! semaphores, command-buffer issuers) can build their own graphs on top.

pub mod arena;
pub mod error;
pub mod executor;
pub mod scope;
pub mod submission;
pub mod task;

pub use arena::{Arena, ArenaBlockPool};
pub use error::{TaskError, TaskResult};
pub use executor::{Executor, ExecutorHandle, ExecutorOptions};
pub use scope::{TaskScope, Timeout};
pub use submission::TaskSubmission;
pub use task::{Task, TaskContext, TaskOps};
