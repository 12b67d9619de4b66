use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::job::JobId;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job queue is drained, new jobs are not accepted")]
    Drained,

    #[error("Job queue is full ({0} live jobs)")]
    Full(usize),

    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Invalid priority {0}, must be one of -10, 0, 10")]
    InvalidPriority(i32),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job queue at {0} is locked by another process")]
    QueueLocked(PathBuf),

    #[error("Job queue version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Corrupt queue file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
