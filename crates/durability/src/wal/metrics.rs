//! Per-log accounting.

use std::time::Duration;

/// Cumulative log counters.
///
/// Owned by one log context and never reset by a flush, so they describe
/// the whole lifetime of an open dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogMetrics {
    /// Payload bytes appended to the data log
    pub data_bytes: u64,
    /// Metadata bytes appended to the metadata log
    pub meta_bytes: u64,
    /// Entries appended
    pub entries_logged: u64,
    /// Flushes that had entries to replay
    pub flushes: u64,
    /// Entries issued to the base driver
    pub entries_replayed: u64,
    /// Cancelled entries skipped during replay
    pub entries_skipped: u64,
    /// Entries too large for the replay budget
    pub entries_split: u64,
    /// Failed writes to the on-disk metadata mirror
    pub mirror_failures: u64,
    /// Largest replay buffer allocated
    pub peak_flush_buffer: u64,
    /// Time spent appending to the log files
    pub log_write_nanos: u64,
    /// Time spent reading the data log during replay
    pub flush_read_nanos: u64,
    /// Time spent in base driver calls during replay
    pub flush_replay_nanos: u64,
    /// Total time spent in flushes
    pub flush_total_nanos: u64,
}

pub(crate) fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl LogMetrics {
    /// Total bytes written to both log files.
    pub fn total_bytes(&self) -> u64 {
        self.data_bytes + self.meta_bytes
    }
}
