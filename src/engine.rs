use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use parking_lot::{Mutex, ReentrantMutex};

use crate::builder::EngineBuilder;
use crate::error::Result;
use crate::pacer::Pacer;
use crate::scheduler::{Command, DisabledScheduler, Executor, Scheduler};
use crate::sketch::FrequencySketch;

// ---------------------------------------------------------------------------
// Engine interior
// ---------------------------------------------------------------------------

/// Shared interior of an [`Engine`].
pub(crate) struct Inner<S: Scheduler> {
    pub(crate) sketch: Mutex<FrequencySketch<RandomState>>,
    /// Reentrant so that a scheduler which runs the maintenance command
    /// synchronously may request maintenance again from the same thread.
    pub(crate) pacer: ReentrantMutex<Pacer<S>>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) command: Command,
    pub(crate) epoch: Instant,
}

// ---------------------------------------------------------------------------
// Engine handle
// ---------------------------------------------------------------------------

/// The estimation and scheduling core a cache drives on every access.
///
/// Owns one [`FrequencySketch`] and one [`Pacer`], each behind its own lock,
/// and a clock measured in nanoseconds since the engine was built.
///
/// # Example
/// ```
/// use lungo::EngineBuilder;
///
/// let engine = EngineBuilder::new(1_000).build().unwrap();
/// engine.record_access("user:42");
/// engine.record_access("user:42");
/// assert_eq!(engine.frequency("user:42"), 2);
/// ```
pub struct Engine<S: Scheduler = DisabledScheduler> {
    inner: Arc<Inner<S>>,
}

impl<S: Scheduler> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Engine {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Scheduler> fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (table_len, sample_size) = {
            let sketch = self.inner.sketch.lock();
            (sketch.table_len(), sketch.sample_size())
        };
        let pacer = self.inner.pacer.lock();
        f.debug_struct("Engine")
            .field("table_len", &table_len)
            .field("sample_size", &sample_size)
            .field("tolerance", &pacer.tolerance())
            .field("next_fire_time", &pacer.next_fire_time())
            .finish()
    }
}

impl Engine<DisabledScheduler> {
    /// Returns an [`EngineBuilder`] sized for `maximum_size` entries.
    pub fn builder(maximum_size: i64) -> EngineBuilder<DisabledScheduler> {
        EngineBuilder::new(maximum_size)
    }
}

impl<S: Scheduler> Engine<S> {
    pub(crate) fn new(
        sketch: FrequencySketch<RandomState>,
        pacer: Pacer<S>,
        executor: Arc<dyn Executor>,
        command: Command,
    ) -> Self {
        Engine {
            inner: Arc::new(Inner {
                sketch: Mutex::new(sketch),
                pacer: ReentrantMutex::new(pacer),
                executor,
                command,
                epoch: Instant::now(),
            }),
        }
    }

    #[inline]
    fn now_nanos(&self) -> u64 {
        self.inner.epoch.elapsed().as_nanos() as u64
    }

    // -----------------------------------------------------------------------
    // Frequency
    // -----------------------------------------------------------------------

    /// Resizes the sketch for a new cache capacity.  Growing forgets all
    /// recorded frequencies; an equal or smaller capacity changes nothing.
    pub fn set_capacity(&self, maximum_size: i64) -> Result<()> {
        self.inner.sketch.lock().ensure_capacity(maximum_size)
    }

    /// Records one access to `key`.
    #[inline]
    pub fn record_access<K: Hash + ?Sized>(&self, key: &K) {
        self.inner.sketch.lock().increment(key);
    }

    /// Estimated recent access count of `key`, in `[0, 15]`.
    #[inline]
    pub fn frequency<K: Hash + ?Sized>(&self, key: &K) -> u8 {
        self.inner.sketch.lock().frequency(key)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Asks for the maintenance command to run within `delay`.
    ///
    /// Cheap when a suitable run is already armed.
    pub fn schedule_maintenance(&self, delay: Duration) -> Result<()> {
        let now = self.now_nanos();
        let delay = delay.as_nanos().min(u128::from(u64::MAX)) as u64;
        let pacer = self.inner.pacer.lock();
        pacer.schedule(&self.inner.executor, &self.inner.command, now, delay)
    }

    /// Cancels the armed maintenance run, if any.  A run already in progress
    /// is not waited for.
    pub fn cancel_maintenance(&self) {
        self.inner.pacer.lock().cancel();
    }

    pub fn is_maintenance_scheduled(&self) -> bool {
        self.inner.pacer.lock().is_scheduled()
    }

    /// When the armed maintenance run is committed to fire, if one is.
    pub fn next_maintenance(&self) -> Option<Instant> {
        match self.inner.pacer.lock().next_fire_time() {
            0 => None,
            nanos => Some(self.inner.epoch + Duration::from_nanos(nanos)),
        }
    }
}
