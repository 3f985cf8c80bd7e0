//! Debounced arming of the maintenance timer.
//!
//! Every cache read or write may ask for a maintenance pass.  The [`Pacer`]
//! keeps at most one timer armed and absorbs requests that the armed timer
//! already satisfies to within [`TOLERANCE`], so bursts of requests cost a
//! couple of comparisons instead of a scheduler round-trip each.
//!
//! ## States
//!
//! | From  | Event                          | To    |
//! |-------|--------------------------------|-------|
//! | Idle  | `schedule`                     | Armed |
//! | Armed | `schedule`, within tolerance   | Armed (untouched) |
//! | Armed | `schedule`, earlier than that  | Armed (old timer cancelled, new one armed) |
//! | Armed | `cancel`                       | Idle  |
//! | Idle  | `cancel`                       | Idle  |

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::Result;
use crate::scheduler::{Command, Executor, ScheduledTask, Scheduler};

/// Default tolerance window in nanoseconds: the power of two just above one
/// second (≈1.07 s).
pub const TOLERANCE: u64 = 1 << 30;

/// Coalesces maintenance requests into a single armed timer.
///
/// Timestamps are nanoseconds on a monotonic clock chosen by the caller and
/// are compared with wrapping arithmetic.  A `next_fire_time` of 0 means
/// nothing is committed.
///
/// The pacer is not `Sync`; the owner serializes access, typically under the
/// same lock that guards the rest of its maintenance state.  Methods take
/// `&self` so that a scheduler which synchronously calls back into
/// [`schedule`](Self::schedule) can do so.
pub struct Pacer<S: Scheduler> {
    scheduler: S,
    /// Tolerance window in nanoseconds; at least 1.
    tolerance: u64,
    future: RefCell<Option<S::Task>>,
    next_fire_time: Cell<u64>,
}

impl<S: Scheduler> Pacer<S> {
    /// Creates an idle pacer using the default [`TOLERANCE`].
    pub fn new(scheduler: S) -> Self {
        Self::with_tolerance(scheduler, Duration::from_nanos(TOLERANCE))
    }

    /// Creates an idle pacer with a custom tolerance window.
    ///
    /// The window is clamped to `[1ns, i64::MAX ns]`.
    pub fn with_tolerance(scheduler: S, tolerance: Duration) -> Self {
        let tolerance = tolerance.as_nanos().clamp(1, i64::MAX as u128) as u64;
        Pacer {
            scheduler,
            tolerance,
            future: RefCell::new(None),
            next_fire_time: Cell::new(0),
        }
    }

    /// Requests that `command` runs on `executor` `delay` nanoseconds after
    /// `now`.
    ///
    /// Nothing happens when the armed timer fires no later than `now + delay`
    /// give or take the tolerance window.  Otherwise the armed timer (if any)
    /// is cancelled and a new one is armed for `max(delay, tolerance)`.
    ///
    /// `next_fire_time` is committed before the scheduler is invoked and the
    /// handle slot is left empty for the duration of that call; a request
    /// arriving from inside the scheduler therefore sees a pending
    /// commitment and is absorbed.  A [`cancel`](Self::cancel) arriving the
    /// same way withdraws the commitment, and the new handle is cancelled
    /// rather than stored.
    ///
    /// # Errors
    /// Propagates the scheduler's error.  The commitment is rolled back so
    /// that a later call can retry.
    pub fn schedule(
        &self,
        executor: &Arc<dyn Executor>,
        command: &Command,
        now: u64,
        delay: u64,
    ) -> Result<()> {
        let schedule_at = now.wrapping_add(delay);
        if self.absorbs(schedule_at) {
            trace!(
                schedule_at,
                next_fire_time = self.next_fire_time.get(),
                "maintenance already armed"
            );
            return Ok(());
        }

        if let Some(prior) = self.future.take() {
            prior.cancel();
        }
        let actual_delay = delay.max(self.tolerance);
        self.next_fire_time.set(now.wrapping_add(actual_delay));
        trace!(actual_delay, "arming maintenance");

        match self.scheduler.schedule(
            executor,
            Arc::clone(command),
            Duration::from_nanos(actual_delay),
        ) {
            // cancelled from inside the scheduler: the commitment is gone
            Ok(task) if self.next_fire_time.get() == 0 => {
                trace!("maintenance cancelled while arming");
                task.cancel();
                Ok(())
            }
            Ok(task) => {
                *self.future.borrow_mut() = Some(task);
                Ok(())
            }
            Err(err) => {
                self.next_fire_time.set(0);
                Err(err)
            }
        }
    }

    /// `true` while a timer is armed and has neither fired nor been
    /// cancelled.
    pub fn is_scheduled(&self) -> bool {
        self.future
            .borrow()
            .as_ref()
            .is_some_and(|task| !task.is_done())
    }

    /// Cancels the armed timer, if any, without waiting for it.  Idempotent.
    pub fn cancel(&self) {
        if let Some(task) = self.future.take() {
            task.cancel();
        }
        self.next_fire_time.set(0);
    }

    /// The committed fire time, or 0 when idle.
    pub fn next_fire_time(&self) -> u64 {
        self.next_fire_time.get()
    }

    pub fn tolerance(&self) -> Duration {
        Duration::from_nanos(self.tolerance)
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    fn absorbs(&self, schedule_at: u64) -> bool {
        match self.future.borrow().as_ref() {
            // no handle yet but a commitment: a call up the stack is arming
            None => self.next_fire_time.get() != 0,
            Some(task) => !task.is_done() && self.may_skip(schedule_at),
        }
    }

    /// `schedule_at` is not earlier than `next_fire_time - tolerance`.
    fn may_skip(&self, schedule_at: u64) -> bool {
        let delta = schedule_at.wrapping_sub(self.next_fire_time.get()) as i64;
        delta >= -(self.tolerance as i64)
    }
}
