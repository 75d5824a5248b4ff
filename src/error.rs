use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuartzError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Function not registered: {0}")]
    FunctionNotFound(String),

    #[error("Function already registered: {0}")]
    DuplicateFunction(String),

    #[error("Pool is frozen, submission rejected")]
    PoolFrozen,

    #[error("Pool is shut down, submission rejected")]
    PoolClosed,

    #[error("Host is already running")]
    AlreadyRunning,

    /// Backend failure surfaced by an [`OccurrenceStore`] implementation.
    ///
    /// [`OccurrenceStore`]: crate::store::OccurrenceStore
    #[error("Store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, QuartzError>;
