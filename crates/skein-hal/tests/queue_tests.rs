//! End-to-end queue tests: signalling, same-queue chaining, cross-queue
//! waits, failure propagation, FIFO issue ordering, and timeouts.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use skein_hal::{
    CallbackCommandBuffer, CommandBuffer, Queue, QueueState, Semaphore, SemaphoreList,
    SubmissionBatch, TaskError, TaskResult,
};
use skein_task::{Arena, ArenaBlockPool, Executor, ExecutorOptions, Task, TaskSubmission, Timeout};

fn setup() -> (Executor, Arc<ArenaBlockPool>) {
    (
        Executor::new(ExecutorOptions { worker_count: 4 }),
        Arc::new(ArenaBlockPool::new(4096)),
    )
}

fn semaphore_list<'a>(semaphores: &'a [Semaphore], values: &'a [u64]) -> SemaphoreList<'a> {
    SemaphoreList {
        semaphores,
        payload_values: values,
    }
}

/// Records its batch index at issue time, preserving issue order.
struct OrderLogging {
    index: usize,
    log: Arc<Mutex<Vec<usize>>>,
}

impl CommandBuffer for OrderLogging {
    fn issue(
        &self,
        _queue_state: &QueueState,
        _completion_task: &Arc<Task>,
        _arena: &Arena,
        _pending: &mut TaskSubmission,
    ) -> TaskResult<()> {
        self.log.lock().push(self.index);
        Ok(())
    }
}

/// Fails at issue time, before any leaf task exists.
struct FailingIssue;

impl CommandBuffer for FailingIssue {
    fn issue(
        &self,
        _queue_state: &QueueState,
        _completion_task: &Arc<Task>,
        _arena: &Arena,
        _pending: &mut TaskSubmission,
    ) -> TaskResult<()> {
        Err(TaskError::invalid_argument("broken command buffer"))
    }
}

// ============================================================================
// Signalling
// ============================================================================

#[test]
fn signal_only_submission_advances_semaphore() {
    let (executor, pool) = setup();
    let queue = Queue::new("q0", executor.handle(), pool);
    let signal = Semaphore::new(0);

    let signals = [signal.clone()];
    queue
        .submit(&[SubmissionBatch {
            signal_semaphores: semaphore_list(&signals, &[1]),
            ..Default::default()
        }])
        .unwrap();

    queue.wait_idle(Timeout::Infinite).unwrap();
    assert_eq!(signal.query().unwrap(), 1);
}

#[test]
fn commands_complete_before_signals_advance() {
    let (executor, pool) = setup();
    let queue = Queue::new("q0", executor.handle(), pool);
    let done = Semaphore::new(0);
    let log = Arc::new(Mutex::new(Vec::new()));

    let observed = log.clone();
    let command: Arc<dyn CommandBuffer> = Arc::new(CallbackCommandBuffer::new(move || {
        observed.lock().push("command");
        Ok(())
    }));
    let signals = [done.clone()];
    queue
        .submit(&[SubmissionBatch {
            command_buffers: &[command],
            signal_semaphores: semaphore_list(&signals, &[7]),
            ..Default::default()
        }])
        .unwrap();

    queue.wait_idle(Timeout::Infinite).unwrap();
    assert_eq!(done.query().unwrap(), 7);
    assert_eq!(*log.lock(), vec!["command"]);
}

#[test]
fn zero_batches_is_a_noop() {
    let (executor, pool) = setup();
    let queue = Queue::new("q0", executor.handle(), pool);
    queue.submit(&[]).unwrap();
    queue.wait_idle(Timeout::Infinite).unwrap();
    assert_eq!(queue.state().issued_batches(), 0);
}

#[test]
fn semaphore_list_length_mismatch_is_rejected() {
    let (executor, pool) = setup();
    let queue = Queue::new("q0", executor.handle(), pool);
    let signal = Semaphore::new(0);

    let signals = [signal.clone()];
    let result = queue.submit(&[SubmissionBatch {
        signal_semaphores: semaphore_list(&signals, &[1, 2]),
        ..Default::default()
    }]);
    assert!(matches!(result, Err(TaskError::InvalidArgument(_))));

    // The queue stays usable and the semaphore was never retained.
    queue.wait_idle(Timeout::Infinite).unwrap();
    assert_eq!(signal.query().unwrap(), 0);
}

// ============================================================================
// Waits and chaining
// ============================================================================

#[test]
fn chained_batches_elide_same_queue_waits() {
    let (executor, pool) = setup();
    let queue = Queue::new("q0", executor.handle(), pool);
    let a = Semaphore::new(0);
    let b = Semaphore::new(0);

    let first_signals = [a.clone()];
    let second_waits = [a.clone()];
    let second_signals = [b.clone()];
    queue
        .submit(&[
            SubmissionBatch {
                signal_semaphores: semaphore_list(&first_signals, &[1]),
                ..Default::default()
            },
            SubmissionBatch {
                wait_semaphores: semaphore_list(&second_waits, &[1]),
                signal_semaphores: semaphore_list(&second_signals, &[1]),
                ..Default::default()
            },
        ])
        .unwrap();

    queue.wait_idle(Timeout::Infinite).unwrap();
    assert_eq!(a.query().unwrap(), 1);
    assert_eq!(b.query().unwrap(), 1);
    // The same-queue wait resolved without leaving a parked timepoint.
    assert_eq!(a.pending_timepoints(), 0);
}

#[test]
fn wait_satisfied_before_submit_behaves_like_after() {
    let (executor, pool) = setup();
    let queue = Queue::new("q0", executor.handle(), pool);
    let gate = Semaphore::new(0);
    let done = Semaphore::new(0);

    // Signalled before the batch is even submitted.
    gate.signal(3).unwrap();

    let waits = [gate.clone()];
    let signals = [done.clone()];
    queue
        .submit(&[SubmissionBatch {
            wait_semaphores: semaphore_list(&waits, &[3]),
            signal_semaphores: semaphore_list(&signals, &[1]),
            ..Default::default()
        }])
        .unwrap();

    queue.wait_idle(Timeout::Infinite).unwrap();
    assert_eq!(done.query().unwrap(), 1);
}

#[test]
fn cross_queue_wait_resolves_after_producer_signals() {
    let (executor, pool) = setup();
    let producer = Queue::new("q1", executor.handle(), pool.clone());
    let consumer = Queue::new("q2", executor.handle(), pool);
    let x = Semaphore::new(0);
    let y = Semaphore::new(0);

    // Submit the consumer first so its wait genuinely parks.
    let consumer_waits = [x.clone()];
    let consumer_signals = [y.clone()];
    consumer
        .submit(&[SubmissionBatch {
            wait_semaphores: semaphore_list(&consumer_waits, &[5]),
            signal_semaphores: semaphore_list(&consumer_signals, &[1]),
            ..Default::default()
        }])
        .unwrap();

    let producer_signals = [x.clone()];
    producer
        .submit(&[SubmissionBatch {
            signal_semaphores: semaphore_list(&producer_signals, &[5]),
            ..Default::default()
        }])
        .unwrap();

    producer.wait_idle(Timeout::Infinite).unwrap();
    consumer.wait_idle(Timeout::Infinite).unwrap();
    assert_eq!(x.query().unwrap(), 5);
    assert_eq!(y.query().unwrap(), 1);
}

// ============================================================================
// FIFO issue ordering
// ============================================================================

#[test]
fn issues_run_in_submission_order() {
    let (executor, pool) = setup();
    let queue = Queue::new("q0", executor.handle(), pool);
    let log = Arc::new(Mutex::new(Vec::new()));

    const BATCHES: usize = 100;
    let commands: Vec<Arc<dyn CommandBuffer>> = (0..BATCHES)
        .map(|index| {
            Arc::new(OrderLogging {
                index,
                log: log.clone(),
            }) as Arc<dyn CommandBuffer>
        })
        .collect();
    let batches: Vec<SubmissionBatch<'_>> = commands
        .chunks(1)
        .map(|command| SubmissionBatch {
            command_buffers: command,
            ..Default::default()
        })
        .collect();
    queue.submit(&batches).unwrap();

    queue.wait_idle(Timeout::Infinite).unwrap();
    let log = log.lock();
    assert_eq!(*log, (0..BATCHES).collect::<Vec<_>>());
    assert_eq!(queue.state().issued_batches(), BATCHES as u64);
}

// ============================================================================
// Failure propagation
// ============================================================================

#[test]
fn failed_issue_fails_signal_semaphores() {
    let (executor, pool) = setup();
    let queue = Queue::new("q0", executor.handle(), pool);
    let a = Semaphore::new(0);
    let b = Semaphore::new(0);

    let failing: Arc<dyn CommandBuffer> = Arc::new(FailingIssue);
    let first_signals = [a.clone()];
    let second_waits = [a.clone()];
    let second_signals = [b.clone()];
    let result = queue.submit(&[
        SubmissionBatch {
            command_buffers: &[failing],
            signal_semaphores: semaphore_list(&first_signals, &[1]),
            ..Default::default()
        },
        SubmissionBatch {
            wait_semaphores: semaphore_list(&second_waits, &[1]),
            signal_semaphores: semaphore_list(&second_signals, &[1]),
            ..Default::default()
        },
    ]);
    // Both batches construct fine; the failure is asynchronous.
    result.unwrap();

    assert!(queue.wait_idle(Timeout::Infinite).is_err());
    assert!(a.query().is_err(), "failed batch must fail its signals");
    assert!(b.query().is_err(), "dependent batch must cascade the failure");
}

#[test]
fn failed_command_callback_fails_signal_semaphores() {
    let (executor, pool) = setup();
    let queue = Queue::new("q0", executor.handle(), pool);
    let done = Semaphore::new(0);

    let command: Arc<dyn CommandBuffer> = Arc::new(CallbackCommandBuffer::new(|| {
        Err(TaskError::failed_precondition("device fault"))
    }));
    let signals = [done.clone()];
    queue
        .submit(&[SubmissionBatch {
            command_buffers: &[command],
            signal_semaphores: semaphore_list(&signals, &[1]),
            ..Default::default()
        }])
        .unwrap();

    assert!(queue.wait_idle(Timeout::Infinite).is_err());
    assert!(matches!(done.query(), Err(TaskError::FailedPrecondition(_))));
}

#[test]
fn unrelated_batch_survives_earlier_failure() {
    let (executor, pool) = setup();
    let queue = Queue::new("q0", executor.handle(), pool);
    let failed = Semaphore::new(0);
    let unrelated = Semaphore::new(0);

    let failing: Arc<dyn CommandBuffer> = Arc::new(FailingIssue);
    let first_signals = [failed.clone()];
    let second_signals = [unrelated.clone()];
    queue
        .submit(&[
            SubmissionBatch {
                command_buffers: &[failing],
                signal_semaphores: semaphore_list(&first_signals, &[1]),
                ..Default::default()
            },
            SubmissionBatch {
                signal_semaphores: semaphore_list(&second_signals, &[2]),
                ..Default::default()
            },
        ])
        .unwrap();

    assert!(queue.wait_idle(Timeout::Infinite).is_err());
    assert!(failed.query().is_err());
    // No data dependency on the failed batch: it still runs and signals.
    assert_eq!(unrelated.query().unwrap(), 2);
}

// ============================================================================
// Timeouts and teardown
// ============================================================================

#[test]
fn wait_idle_deadline_leaves_queue_usable() {
    let (executor, pool) = setup();
    let queue = Queue::new("q0", executor.handle(), pool);
    let external = Semaphore::new(0);
    let first_done = Semaphore::new(0);
    let second_done = Semaphore::new(0);

    let waits = [external.clone()];
    let first_signals = [first_done.clone()];
    queue
        .submit(&[SubmissionBatch {
            wait_semaphores: semaphore_list(&waits, &[1]),
            signal_semaphores: semaphore_list(&first_signals, &[1]),
            ..Default::default()
        }])
        .unwrap();

    assert!(matches!(
        queue.wait_idle(Timeout::After(Duration::from_millis(10))),
        Err(TaskError::DeadlineExceeded)
    ));

    // The queue keeps accepting work while the first batch is parked.
    let second_signals = [second_done.clone()];
    queue
        .submit(&[SubmissionBatch {
            signal_semaphores: semaphore_list(&second_signals, &[1]),
            ..Default::default()
        }])
        .unwrap();

    // Unblock externally; everything drains in order.
    external.signal(1).unwrap();
    queue.wait_idle(Timeout::Infinite).unwrap();
    assert_eq!(first_done.query().unwrap(), 1);
    assert_eq!(second_done.query().unwrap(), 1);
}

#[test]
fn queue_drops_cleanly_after_wait_idle() {
    let (executor, pool) = setup();
    let signal = Semaphore::new(0);
    {
        let queue = Queue::new("q0", executor.handle(), pool);
        let signals = [signal.clone()];
        queue
            .submit(&[SubmissionBatch {
                signal_semaphores: semaphore_list(&signals, &[1]),
                ..Default::default()
            }])
            .unwrap();
        queue.wait_idle(Timeout::Infinite).unwrap();
        // Drop runs here and asserts the tail issue task is clear.
    }
    assert_eq!(signal.query().unwrap(), 1);
}

#[test]
fn many_chained_batches_reuse_pool_blocks() {
    let (executor, pool) = setup();
    let queue = Queue::new("q0", executor.handle(), pool.clone());
    let counter = Semaphore::new(0);

    for round in 1..=50u64 {
        let waits = [counter.clone()];
        let signals = [counter.clone()];
        let wait_values = [round - 1];
        let signal_values = [round];
        queue
            .submit(&[SubmissionBatch {
                wait_semaphores: semaphore_list(&waits, &wait_values),
                signal_semaphores: semaphore_list(&signals, &signal_values),
                ..Default::default()
            }])
            .unwrap();
    }

    queue.wait_idle(Timeout::Infinite).unwrap();
    assert_eq!(counter.query().unwrap(), 50);
    // Every submission arena returned its blocks to the shared pool.
    assert!(pool.cached_block_count() > 0);
}
