use shipyard_bus::BusError;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No matching job, or the job is not in a state allowing the operation.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// The worker pool definition does not match the registered messages.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A thread panicked while holding the store connection.
    #[error("Job store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
