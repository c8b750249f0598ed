//! Error types for Stagelog
//!
//! One taxonomy serves every layer: the log writer, the flush engine, the
//! request tracker and the dataset facade. Errors are `Clone` because the
//! outcome of a replayed write is stored in its pending request until the
//! caller waits on it.

use crate::types::RequestId;
use std::io;
use thiserror::Error;

/// Result type alias for log operations
pub type LogResult<T> = std::result::Result<T, LogError>;

/// Completion status of a single request
pub type Status = std::result::Result<(), LogError>;

/// Error types for the deferred log
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    /// Write attempted before the log files were created
    #[error("log not initialized: dataset is still in define mode")]
    NotInitialized,

    /// Log file is not a log, or does not belong to this dataset/process
    #[error("bad log file: {0}")]
    BadLogFile(String),

    /// Log contents are inconsistent, or the log could not be reset
    #[error("corrupt log: {0}")]
    CorruptLog(String),

    /// Short write on a log file
    #[error("incomplete write: expected {expected} bytes, wrote {written}")]
    IncompleteWrite {
        /// Bytes requested
        expected: u64,
        /// Bytes actually written
        written: u64,
    },

    /// Short read on a log file
    #[error("incomplete read: expected {expected} bytes, read {read}")]
    IncompleteRead {
        /// Bytes requested
        expected: u64,
        /// Bytes actually read
        read: u64,
    },

    /// Buffer growth failed, or an entry cannot be split to fit the budget
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Request id is unknown or already consumed
    #[error("invalid request id: {0}")]
    InvalidRequestId(RequestId),

    /// Cancel on a request that was already replayed; carries its outcome
    #[error("request already completed")]
    AlreadyCompleted(Option<Box<LogError>>),

    /// Other I/O failure on a log file
    #[error("I/O error: {0}")]
    Io(String),

    /// Error reported by the base driver
    #[error("driver error {code}: {message}")]
    Driver {
        /// Driver-specific error code
        code: i32,
        /// Human readable description
        message: String,
    },

    /// Malformed call arguments
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Verify-on-write found the on-disk log disagreeing with memory
    #[error("log check failed: {0}")]
    LogCheck(String),

    /// Operation requires define mode
    #[error("dataset is not in define mode")]
    NotInDefineMode,

    /// Operation is not allowed in define mode
    #[error("dataset is in define mode")]
    InDefineMode,
}

impl LogError {
    /// Build the status reported by `cancel` for an already-replayed request.
    pub fn already_completed(status: &Status) -> Self {
        LogError::AlreadyCompleted(status.as_ref().err().map(|e| Box::new(e.clone())))
    }

    /// Whether the error leaves the log unusable for further writes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LogError::CorruptLog(_))
    }
}

// Short reads and writes are reported with their byte counts by the file
// helpers; a bare io::Error carries none, so it always maps to Io.
impl From<io::Error> for LogError {
    fn from(e: io::Error) -> Self {
        LogError::Io(e.to_string())
    }
}
