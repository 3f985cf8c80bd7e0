use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use tracing::debug;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::pacer::{Pacer, TOLERANCE};
use crate::scheduler::{Command, DisabledScheduler, Executor, SameThreadExecutor, Scheduler};
use crate::sketch::FrequencySketch;

/// Builder for configuring and constructing an [`Engine`].
///
/// Defaults: maintenance disabled ([`DisabledScheduler`]), commands run on
/// the thread that fires the timer, a tolerance of [`TOLERANCE`] and a
/// freshly seeded hasher.
///
/// # Example
/// ```
/// use lungo::scheduler::ThreadScheduler;
/// use lungo::EngineBuilder;
/// use std::time::Duration;
///
/// let engine = EngineBuilder::new(10_000)
///     .scheduler(ThreadScheduler::new().unwrap())
///     .tolerance(Duration::from_millis(250))
///     .maintenance(|| {
///         // drain buffers, evict, expire
///     })
///     .build()
///     .unwrap();
/// engine.schedule_maintenance(Duration::ZERO).unwrap();
/// assert!(engine.is_maintenance_scheduled());
/// ```
pub struct EngineBuilder<S = DisabledScheduler> {
    maximum_size: i64,
    tolerance: Duration,
    hasher: Option<RandomState>,
    scheduler: S,
    executor: Arc<dyn Executor>,
    command: Command,
}

impl EngineBuilder<DisabledScheduler> {
    pub fn new(maximum_size: i64) -> Self {
        EngineBuilder {
            maximum_size,
            tolerance: Duration::from_nanos(TOLERANCE),
            hasher: None,
            scheduler: DisabledScheduler,
            executor: Arc::new(SameThreadExecutor),
            command: Arc::new(|| {}),
        }
    }
}

impl<S> EngineBuilder<S> {
    /// Window within which maintenance requests are coalesced; also the
    /// shortest delay ever armed.
    pub fn tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Hasher used to place keys in the frequency sketch.
    pub fn hasher(mut self, hasher: RandomState) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Where the maintenance command runs once its timer fires.
    pub fn executor<E: Executor + 'static>(mut self, executor: E) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// The maintenance routine armed by
    /// [`Engine::schedule_maintenance`](crate::Engine::schedule_maintenance).
    pub fn maintenance<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.command = Arc::new(f);
        self
    }

    /// Replaces the scheduler that arms maintenance timers.
    pub fn scheduler<T: Scheduler>(self, scheduler: T) -> EngineBuilder<T> {
        EngineBuilder {
            maximum_size: self.maximum_size,
            tolerance: self.tolerance,
            hasher: self.hasher,
            scheduler,
            executor: self.executor,
            command: self.command,
        }
    }
}

impl<S: Scheduler> EngineBuilder<S> {
    /// # Errors
    /// [`Error::NegativeCapacity`] for a negative maximum size and
    /// [`Error::InvalidTolerance`] for a zero tolerance.
    pub fn build(self) -> Result<Engine<S>> {
        if self.tolerance.is_zero() {
            return Err(Error::InvalidTolerance);
        }
        let mut sketch = FrequencySketch::with_hasher(self.hasher.unwrap_or_default());
        sketch.ensure_capacity(self.maximum_size)?;
        debug!(
            maximum_size = self.maximum_size,
            tolerance = ?self.tolerance,
            "building engine"
        );
        let pacer = Pacer::with_tolerance(self.scheduler, self.tolerance);
        Ok(Engine::new(sketch, pacer, self.executor, self.command))
    }
}
