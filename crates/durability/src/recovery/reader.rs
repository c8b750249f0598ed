//! Reading a log pair back from disk
//!
//! The header's `num_entries` is the commit marker: entries beyond it were
//! never acknowledged and are ignored, however complete they look.
//!
//! A counted entry whose payload is missing from the data log was staged in
//! the data-log buffer when the process died. It is treated as uncommitted,
//! together with every entry after it.

use stagelog_core::{LogError, LogResult};

use crate::format::{BlockLayout, DataLog, LogEntry, LogHeader, MetaLog};
use crate::wal::LogPaths;

/// Committed contents of a log pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredLog {
    /// Header as found on disk
    pub header: LogHeader,
    /// Committed entries in log order
    pub entries: Vec<LogEntry>,
    /// Counted entries dropped because their payload never reached the disk
    pub lost_entries: usize,
    /// Metadata bytes past the last committed entry
    pub trailing_meta_bytes: u64,
    /// Payload bytes past the last committed payload
    pub trailing_data_bytes: u64,
}

impl RecoveredLog {
    /// Payload bytes referenced by committed entries.
    pub fn committed_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.data_len).sum()
    }
}

/// Reader for a log pair left on disk.
#[derive(Debug, Clone)]
pub struct LogReader {
    paths: LogPaths,
    layout: BlockLayout,
}

impl LogReader {
    /// Create a reader for a private log pair.
    pub fn new(paths: LogPaths) -> Self {
        Self::with_layout(paths, BlockLayout::Private)
    }

    /// Create a reader whose data log uses `layout`.
    pub fn with_layout(paths: LogPaths, layout: BlockLayout) -> Self {
        LogReader { paths, layout }
    }

    /// Log pair this reader reads.
    pub fn paths(&self) -> &LogPaths {
        &self.paths
    }

    /// Open the data log with this reader's layout.
    pub fn open_data(&self) -> LogResult<DataLog> {
        DataLog::open_with(self.paths.data(), self.layout)
    }

    /// Read the header and committed entries, checking that each entry's
    /// payload directly follows the previous one inside the data log.
    pub fn read(&self) -> LogResult<RecoveredLog> {
        let mut meta_log = MetaLog::open(self.paths.meta())?;
        let bytes = meta_log.read_all()?;
        let header = LogHeader::from_bytes(&bytes)?;

        let entry_begin = header.entry_begin as usize;
        if entry_begin < header.encoded_len() || entry_begin > bytes.len() || entry_begin % 4 != 0 {
            return Err(LogError::BadLogFile(format!(
                "entry_begin {} is inconsistent with a {}-byte header",
                entry_begin,
                header.encoded_len()
            )));
        }

        let payload_len = self.open_data()?.payload_len();

        let mut entries = Vec::new();
        let mut pos = entry_begin;
        let mut expected_off = 0u64;
        let mut lost_entries = 0;
        for i in 0..header.num_entries {
            let (entry, used) = LogEntry::decode(&bytes[pos..]).map_err(|e| {
                LogError::CorruptLog(format!("committed entry {} unreadable: {}", i, e))
            })?;
            if entry.data_off != expected_off {
                return Err(LogError::CorruptLog(format!(
                    "entry {} payload starts at {}, expected {}",
                    i, entry.data_off, expected_off
                )));
            }
            let needed = entry.selection().payload_len(entry.elem).map_err(|e| {
                LogError::CorruptLog(format!("entry {} selection is invalid: {}", i, e))
            })?;
            if needed != entry.data_len {
                return Err(LogError::CorruptLog(format!(
                    "entry {} records {} payload bytes, its selection needs {}",
                    i, entry.data_len, needed
                )));
            }
            let end = expected_off
                .checked_add(entry.data_len)
                .ok_or_else(|| LogError::CorruptLog(format!("entry {} payload overflows", i)))?;
            if end > payload_len {
                lost_entries = (header.num_entries - i) as usize;
                tracing::warn!(
                    entry = i,
                    payload_end = end,
                    data_log_bytes = payload_len,
                    lost = lost_entries,
                    "Payloads never reached the data log; dropping entries"
                );
                break;
            }
            expected_off = end;
            pos += used;
            entries.push(entry);
        }

        Ok(RecoveredLog {
            header,
            entries,
            lost_entries,
            trailing_meta_bytes: (bytes.len() - pos) as u64,
            trailing_data_bytes: payload_len.saturating_sub(expected_off),
        })
    }
}
