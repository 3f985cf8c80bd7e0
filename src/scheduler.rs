//! Timer collaborators driven by the [`Pacer`](crate::Pacer).
//!
//! A [`Scheduler`] arms a one-shot timer that hands a [`Command`] to an
//! [`Executor`] once its delay elapses, and returns a [`ScheduledTask`]
//! handle that can be polled or cancelled.
//!
//! | Scheduler             | Behaviour |
//! |-----------------------|-----------|
//! | [`DisabledScheduler`] | Never runs anything; every handle is already done |
//! | [`ThreadScheduler`]   | One background timer thread ordered by deadline |
//! | [`GuardedScheduler`]  | Wraps another scheduler and turns failures into a disabled handle |

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A maintenance routine; shared so the same command can be re-armed.
pub type Command = Arc<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

/// Runs commands handed over by a scheduler.
pub trait Executor: Send + Sync {
    fn execute(&self, command: Command);
}

/// Runs the command inline on the thread that fires the timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct SameThreadExecutor;

impl Executor for SameThreadExecutor {
    fn execute(&self, command: Command) {
        command()
    }
}

/// An [`Executor`] backed by a closure.
pub struct FnExecutor<F>(pub F);

impl<F> Executor for FnExecutor<F>
where
    F: Fn(Command) + Send + Sync,
{
    fn execute(&self, command: Command) {
        (self.0)(command)
    }
}

// ---------------------------------------------------------------------------
// Task handles
// ---------------------------------------------------------------------------

/// Handle to a timer armed by a [`Scheduler`].
pub trait ScheduledTask {
    /// Requests cancellation.  Never interrupts a command that is already
    /// running.  Returns `true` if the command will now not run.
    fn cancel(&self) -> bool;

    /// `true` once the timer fired or was cancelled.
    fn is_done(&self) -> bool;
}

impl<T: ScheduledTask + ?Sized> ScheduledTask for Box<T> {
    fn cancel(&self) -> bool {
        (**self).cancel()
    }

    fn is_done(&self) -> bool {
        (**self).is_done()
    }
}

impl<T: ScheduledTask + ?Sized> ScheduledTask for Arc<T> {
    fn cancel(&self) -> bool {
        (**self).cancel()
    }

    fn is_done(&self) -> bool {
        (**self).is_done()
    }
}

/// Sentinel handle meaning "maintenance disabled": always done.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisabledTask;

impl ScheduledTask for DisabledTask {
    fn cancel(&self) -> bool {
        false
    }

    fn is_done(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Scheduler trait
// ---------------------------------------------------------------------------

/// Arms one-shot timers.
pub trait Scheduler {
    type Task: ScheduledTask;

    /// Submits `command` to `executor` after `delay`.
    ///
    /// Implementations may call back into their caller synchronously.
    fn schedule(
        &self,
        executor: &Arc<dyn Executor>,
        command: Command,
        delay: Duration,
    ) -> Result<Self::Task>;
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    type Task = S::Task;

    fn schedule(
        &self,
        executor: &Arc<dyn Executor>,
        command: Command,
        delay: Duration,
    ) -> Result<Self::Task> {
        (**self).schedule(executor, command, delay)
    }
}

/// A scheduler that ignores every request.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledScheduler;

impl Scheduler for DisabledScheduler {
    type Task = DisabledTask;

    fn schedule(&self, _: &Arc<dyn Executor>, _: Command, _: Duration) -> Result<DisabledTask> {
        Ok(DisabledTask)
    }
}

// ---------------------------------------------------------------------------
// GuardedScheduler
// ---------------------------------------------------------------------------

/// Wraps a scheduler so that a failure to arm a timer is logged instead of
/// propagated.  The failed request yields an already-done handle.
pub struct GuardedScheduler<S> {
    inner: S,
}

impl<S: Scheduler> GuardedScheduler<S> {
    pub fn new(inner: S) -> Self {
        GuardedScheduler { inner }
    }
}

/// Handle returned by [`GuardedScheduler`]; `None` when scheduling failed.
pub struct GuardedTask<T>(Option<T>);

impl<T: ScheduledTask> ScheduledTask for GuardedTask<T> {
    fn cancel(&self) -> bool {
        self.0.as_ref().is_some_and(|t| t.cancel())
    }

    fn is_done(&self) -> bool {
        self.0.as_ref().map_or(true, |t| t.is_done())
    }
}

impl<S: Scheduler> Scheduler for GuardedScheduler<S> {
    type Task = GuardedTask<S::Task>;

    fn schedule(
        &self,
        executor: &Arc<dyn Executor>,
        command: Command,
        delay: Duration,
    ) -> Result<Self::Task> {
        match self.inner.schedule(executor, command, delay) {
            Ok(task) => Ok(GuardedTask(Some(task))),
            Err(err) => {
                warn!(error = %err, ?delay, "failed to schedule maintenance task");
                Ok(GuardedTask(None))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ThreadScheduler
// ---------------------------------------------------------------------------

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

/// Heap size below which cancelled timers are only dropped as they surface.
const MIN_COMPACT_LEN: usize = 64;

/// Handle to a timer armed on a [`ThreadScheduler`].
#[derive(Clone, Debug)]
pub struct TaskHandle {
    state: Arc<AtomicU8>,
}

impl TaskHandle {
    fn new() -> Self {
        TaskHandle {
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// Claims the timer for execution; loses against a concurrent cancel.
    fn fire(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

impl ScheduledTask for TaskHandle {
    fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) != PENDING
    }
}

struct Timer {
    deadline: Instant,
    /// Tie-breaker keeping equal deadlines in submission order.
    seq: u64,
    handle: TaskHandle,
    executor: Arc<dyn Executor>,
    command: Command,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

struct State {
    /// Min-heap on deadline.  Cancelled timers are discarded once they reach
    /// the top, or in bulk when the heap grows to `compact_at`.
    timers: BinaryHeap<Reverse<Timer>>,
    compact_at: usize,
    next_seq: u64,
    shutdown: bool,
}

impl State {
    fn discard_cancelled(&mut self) {
        self.timers.retain(|Reverse(timer)| !timer.handle.is_done());
        self.compact_at = (self.timers.len() * 2).max(MIN_COMPACT_LEN);
    }
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

/// A scheduler backed by a single named timer thread.
///
/// Dropping the scheduler stops the thread; timers that have not fired yet
/// are discarded.
pub struct ThreadScheduler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadScheduler {
    /// Starts the timer thread.
    pub fn new() -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                timers: BinaryHeap::new(),
                compact_at: MIN_COMPACT_LEN,
                next_seq: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });
        let worker = thread::Builder::new().name("lungo-timer".to_string()).spawn({
            let shared = Arc::clone(&shared);
            move || run_timers(&shared)
        })?;
        Ok(ThreadScheduler {
            shared,
            worker: Some(worker),
        })
    }

    /// Stops accepting timers and wakes the timer thread so it exits.
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wakeup.notify_all();
    }

    /// Number of timers held by the timer thread, including cancelled ones
    /// not yet discarded.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().timers.len()
    }
}

impl Scheduler for ThreadScheduler {
    type Task = TaskHandle;

    fn schedule(
        &self,
        executor: &Arc<dyn Executor>,
        command: Command,
        delay: Duration,
    ) -> Result<TaskHandle> {
        let deadline = Instant::now()
            .checked_add(delay)
            .ok_or_else(|| Error::Rejected(format!("delay {delay:?} overflows the clock")))?;

        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(Error::SchedulerShutdown);
        }
        if state.timers.len() >= state.compact_at {
            state.discard_cancelled();
        }
        let handle = TaskHandle::new();
        let seq = state.next_seq;
        state.next_seq += 1;

        let earliest = state
            .timers
            .peek()
            .map_or(true, |Reverse(next)| deadline < next.deadline);
        state.timers.push(Reverse(Timer {
            deadline,
            seq,
            handle: handle.clone(),
            executor: Arc::clone(executor),
            command,
        }));
        drop(state);

        if earliest {
            self.shared.wakeup.notify_one();
        }
        Ok(handle)
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(worker) = self.worker.take() {
            // The last reference may be released by a command on the timer
            // thread itself.
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("timer thread terminated with a panic");
            }
        }
    }
}

fn run_timers(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        while state
            .timers
            .peek()
            .is_some_and(|Reverse(t)| t.handle.is_cancelled())
        {
            state.timers.pop();
        }
        let next_deadline = state.timers.peek().map(|Reverse(t)| t.deadline);
        match next_deadline {
            None => shared.wakeup.wait(&mut state),
            Some(deadline) if deadline > Instant::now() => {
                let _ = shared.wakeup.wait_until(&mut state, deadline);
            }
            Some(_) => {
                let Some(Reverse(timer)) = state.timers.pop() else {
                    continue;
                };
                if !timer.handle.fire() {
                    continue;
                }
                MutexGuard::unlocked(&mut state, || {
                    let Timer {
                        executor, command, ..
                    } = timer;
                    if catch_unwind(AssertUnwindSafe(|| executor.execute(command))).is_err() {
                        warn!("scheduled command panicked");
                    }
                });
            }
        }
    }
    debug!(discarded = state.timers.len(), "timer thread stopped");
}
