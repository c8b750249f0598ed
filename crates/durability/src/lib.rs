//! Durability layer for stagelog
//!
//! This crate handles everything that touches the log files:
//!
//! - Buffers: growable metadata mirror and per-entry size ledger
//! - Format: log header, entry encoding, metadata and data log files
//! - WAL: log writer, metadata index, pending requests, flush/replay engine
//!   and the per-process log context tying them together
//! - Recovery: reading and replaying a log left behind by a crashed process
//! - Testing: in-memory driver for exercising the log without a dataset

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer; // Growable mirror buffer and size ledger
pub mod format; // On-disk log header, entries and files
pub mod recovery; // Replay of logs left on disk
pub mod testing; // In-memory driver
pub mod wal; // Log context, writer, flush engine

// === Re-exports ===
pub use buffer::{GrowableBuffer, SizeLedger, Span};
pub use format::{BlockLayout, DataLog, LogEntry, LogHeader, MetaLog};
pub use recovery::{LogReader, LogRecovery, RecoveredLog, RecoveryStats};
pub use wal::{
    DeferredLog, FlushStats, LogConfig, LogConfigError, LogMetrics, LogPaths, LogWriter,
    MetadataIndex, RequestTracker,
};
