//! Error types for weaver operations.

use thiserror::Error;

use super::job::{JobId, JobStatus};

/// Errors produced by the weaver and job bookkeeping.
///
/// Failures inside a job's own work never show up here; they are recorded on
/// the job (see [`crate::core::Job::success`]).
#[derive(Debug, Error)]
pub enum WeaverError {
    /// The weaver is shutting down and rejects new work.
    #[error("weaver is not accepting work")]
    NotAcceptingWork,
    /// The job is in a state that forbids the requested operation.
    #[error("job {id} is {status}")]
    InvalidJobState {
        /// Job identifier.
        id: JobId,
        /// Status observed when the operation was attempted.
        status: JobStatus,
    },
    /// A job was asked to depend on itself.
    #[error("job {0} cannot depend on itself")]
    SelfDependency(JobId),
    /// The job is already an element of the collection, or is the
    /// collection itself.
    #[error("job {0} is already part of the collection")]
    DuplicateElement(JobId),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

/// Application-facing result using anyhow, returned by job payloads.
pub type AppResult<T> = Result<T, anyhow::Error>;
