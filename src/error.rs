use thiserror::Error;

/// Errors surfaced by the sketch, the schedulers and the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// `ensure_capacity` was called with a negative maximum size.
    #[error("maximum size must be non-negative, got {0}")]
    NegativeCapacity(i64),

    /// A zero-length tolerance window was requested.
    #[error("pacer tolerance must be greater than zero")]
    InvalidTolerance,

    /// The scheduler has been shut down and no longer arms timers.
    #[error("scheduler is shut down")]
    SchedulerShutdown,

    /// The scheduler refused the task.
    #[error("scheduler rejected the task: {0}")]
    Rejected(String),

    #[error("failed to start the timer thread: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
