use thiserror::Error;

use crate::state::InvalidTransition;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression does not have five fields.
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    /// A job definition or builder value is unusable.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// No job with the given ID is known to the scheduler.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The queue lock could not be acquired within its time budget.
    #[error("Timed out acquiring queue lock at {path}")]
    LockTimeout { path: String },

    /// The pending directory already holds `max` items.
    #[error("Queue is full ({max} pending items)")]
    QueueFull { max: usize },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// An in-process job raised an unrecoverable error.
    #[error("Job {id} aborted: {message}")]
    CallableAborted { id: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Process error: {0}")]
    Process(#[from] cronkeep_exec::ExecError),

    #[error("Configuration error: {0}")]
    Config(#[from] cronkeep_core::CoreError),
}

impl SchedulerError {
    /// Short error code string reported to CLI and HTTP callers.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidCron(_) => "INVALID_CRON",
            SchedulerError::InvalidJob(_) => "INVALID_JOB",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::LockTimeout { .. } => "LOCK_TIMEOUT",
            SchedulerError::QueueFull { .. } => "QUEUE_FULL",
            SchedulerError::InvalidTransition(_) => "INVALID_TRANSITION",
            SchedulerError::CallableAborted { .. } => "CALLABLE_ABORTED",
            SchedulerError::Io(_) => "IO_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Process(_) => "PROCESS_ERROR",
            SchedulerError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
