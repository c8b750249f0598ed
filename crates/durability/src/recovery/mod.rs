//! Crash recovery
//!
//! A process that dies between logging and flushing leaves its log pair
//! behind. [`LogRecovery`] validates such a pair against the dataset and
//! replays its committed entries through the base driver, with the same
//! batching and splitting rules as a normal flush.
//!
//! # Usage
//!
//! ```ignore
//! let recovery = LogRecovery::for_config(&config, &dataset)?;
//! if recovery.exists() {
//!     let stats = recovery.recover(&mut dataset, IoMode::Collective, config.flush_limit())?;
//! }
//! ```

mod reader;

pub use reader::{LogReader, RecoveredLog};

use std::path::Path;

use stagelog_core::{BaseDriver, DatasetCatalog, IoMode, LogResult};

use crate::format::{BlockLayout, LogHeader, MetaLog, NUM_ENTRIES_OFFSET};
use crate::wal::{check, flush_budget, FlushStats, LogConfig, LogPaths, Replayer};

/// Outcome of a recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Committed entries found
    pub committed: usize,
    /// Counted entries whose payload never reached the data log
    pub lost: usize,
    /// Metadata bytes past the last committed entry
    pub ignored_meta_bytes: u64,
    /// Payload bytes past the last committed payload
    pub ignored_data_bytes: u64,
    /// Replay counters
    pub replay: FlushStats,
}

/// Replays a leftover log pair into the dataset.
#[derive(Debug, Clone)]
pub struct LogRecovery {
    reader: LogReader,
}

impl LogRecovery {
    /// Recovery for an explicit log pair.
    pub fn new(paths: LogPaths) -> Self {
        LogRecovery {
            reader: LogReader::new(paths),
        }
    }

    /// Recovery for the log pair a dataset would use.
    pub fn for_catalog<C: DatasetCatalog + ?Sized>(log_dir: &Path, catalog: &C) -> LogResult<Self> {
        Ok(Self::new(LogPaths::for_catalog(log_dir, catalog)?))
    }

    /// Recovery for the files a dataset logging under `config` would use,
    /// shared data log included.
    pub fn for_config<C: DatasetCatalog + ?Sized>(config: &LogConfig, catalog: &C) -> LogResult<Self> {
        let paths = LogPaths::for_config(config, catalog)?;
        let layout = if paths.is_shared() {
            BlockLayout::shared(config.shared_block_size, catalog.rank(), catalog.num_procs())?
        } else {
            BlockLayout::Private
        };
        Ok(LogRecovery {
            reader: LogReader::with_layout(paths, layout),
        })
    }

    /// Whether the data log is shared with other processes.
    pub fn is_shared(&self) -> bool {
        self.reader.paths().is_shared()
    }

    /// Whether a log pair is present.
    pub fn exists(&self) -> bool {
        self.reader.paths().exists()
    }

    /// Read the committed contents without replaying.
    pub fn inspect(&self) -> LogResult<RecoveredLog> {
        self.reader.read()
    }

    /// Replay the committed entries, then mark the log empty.
    ///
    /// Collective. The log is only marked empty when every entry replayed
    /// successfully; otherwise it is left as found and the first error is
    /// returned.
    pub fn recover<D>(&self, driver: &mut D, mode: IoMode, limit: Option<u64>) -> LogResult<RecoveryStats>
    where
        D: BaseDriver + DatasetCatalog + ?Sized,
    {
        let paths = self.reader.paths();
        let log = self.reader.read()?;
        check::check_ownership(
            &log.header,
            paths.dataset_path(),
            driver.rank(),
            driver.num_procs(),
        )?;

        let mut stats = RecoveryStats {
            committed: log.entries.len(),
            lost: log.lost_entries,
            ignored_meta_bytes: log.trailing_meta_bytes,
            ignored_data_bytes: log.trailing_data_bytes,
            replay: FlushStats::default(),
        };
        if log.trailing_meta_bytes > 0 || log.trailing_data_bytes > 0 {
            tracing::warn!(
                meta_bytes = log.trailing_meta_bytes,
                data_bytes = log.trailing_data_bytes,
                "Ignoring uncommitted tail of write-ahead log"
            );
        }

        let mut data = self.reader.open_data()?;
        let budget = flush_budget(limit, log.committed_bytes());
        let mut replayer = Replayer::new(driver, mode, budget)?;
        let status = replayer.run(log.entries.as_slice(), &mut data, |_, _| {});
        stats.replay = replayer.into_stats();
        status?;

        let mut meta = MetaLog::open(paths.meta())?;
        meta.write_at(NUM_ENTRIES_OFFSET as u64, &LogHeader::encode_u64(0))?;
        meta.truncate(log.header.entry_begin)?;
        data.reset()?;

        tracing::info!(
            entries = stats.committed,
            replayed = stats.replay.replayed,
            meta = %paths.meta().display(),
            "Recovered write-ahead log"
        );
        Ok(stats)
    }

    /// Remove the log pair.
    ///
    /// A shared data log is only removed by its owner; the other processes
    /// must be done with it first.
    pub fn discard(&self) -> LogResult<()> {
        self.reader.paths().remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ints, to_ints, MemoryDriver};
    use crate::wal::{DeferredLog, LogConfig};
    use stagelog_core::{DatasetBackend, ElementType, LogError, Selection, VarId, WriteCall};
    use std::io::Write;
    use tempfile::{tempdir, TempDir};

    /// Log two writes and abandon the log as a crashed process would.
    fn crashed() -> (TempDir, MemoryDriver, VarId) {
        let dir = tempdir().unwrap();
        let mut driver = MemoryDriver::new(dir.path().join("out.nc"));
        let x = driver.define_dimension("x", Some(8)).unwrap();
        let v = driver.define_variable("v", ElementType::Int, &[x]).unwrap();
        driver.enddef().unwrap();

        let mut log = DeferredLog::new(LogConfig::for_testing(dir.path()));
        log.note_variable_ndims(1).unwrap();
        log.initialize(&driver).unwrap();
        let a = ints(&[1, 2]);
        let b = ints(&[3]);
        log.append_write(
            &driver,
            &driver,
            &WriteCall::new(Selection::range(v, &[0], &[2]), ElementType::Int, &a),
        )
        .unwrap();
        log.append_write(
            &driver,
            &driver,
            &WriteCall::new(Selection::range(v, &[5], &[1]), ElementType::Int, &b),
        )
        .unwrap();
        log.abandon().unwrap();
        (dir, driver, v)
    }

    #[test]
    fn test_recover_replays_committed_entries() {
        let (dir, mut driver, v) = crashed();
        let recovery = LogRecovery::for_catalog(dir.path(), &driver).unwrap();
        assert!(recovery.exists());
        assert_eq!(recovery.inspect().unwrap().entries.len(), 2);

        let stats = recovery
            .recover(&mut driver, IoMode::Collective, None)
            .unwrap();
        assert_eq!(stats.committed, 2);
        assert_eq!(stats.replay.replayed, 2);
        let all = to_ints(&driver.peek(&Selection::range(v, &[0], &[8])).unwrap());
        assert_eq!(all, vec![1, 2, 0, 0, 0, 3, 0, 0]);

        let after = recovery.inspect().unwrap();
        assert!(after.entries.is_empty());
        assert_eq!(after.header.num_entries, 0);
    }

    #[test]
    fn test_recover_ignores_uncommitted_tail() {
        let (dir, mut driver, _) = crashed();
        let recovery = LogRecovery::for_catalog(dir.path(), &driver).unwrap();
        let mut data = std::fs::OpenOptions::new()
            .append(true)
            .open(recovery.reader.paths().data())
            .unwrap();
        data.write_all(&[0xAB; 6]).unwrap();
        drop(data);

        let stats = recovery
            .recover(&mut driver, IoMode::Collective, Some(4))
            .unwrap();
        assert_eq!(stats.ignored_data_bytes, 6);
        assert_eq!(stats.committed, 2);
        assert!(stats.replay.largest_read <= 4);
    }

    #[test]
    fn test_recover_rejects_log_of_another_rank() {
        let (dir, driver, _) = crashed();
        let paths = LogPaths::for_catalog(dir.path(), &driver).unwrap();
        let recovery = LogRecovery::new(paths);
        let mut other = driver.clone().with_rank(1, 2);
        let err = recovery
            .recover(&mut other, IoMode::Collective, None)
            .unwrap_err();
        assert!(matches!(err, LogError::BadLogFile(_)));
        assert!(other.writes().is_empty());
    }

    #[test]
    fn test_failed_recovery_leaves_log_intact() {
        let (dir, mut driver, v) = crashed();
        driver.fail_writes_to(v);
        let recovery = LogRecovery::for_catalog(dir.path(), &driver).unwrap();
        assert!(recovery
            .recover(&mut driver, IoMode::Collective, None)
            .is_err());
        assert_eq!(recovery.inspect().unwrap().entries.len(), 2);
    }

    #[test]
    fn test_discard() {
        let (dir, driver, _) = crashed();
        let recovery = LogRecovery::for_catalog(dir.path(), &driver).unwrap();
        recovery.discard().unwrap();
        assert!(!recovery.exists());
        assert!(!LogPaths::for_catalog(dir.path(), &driver).unwrap().exists());
    }

    #[test]
    fn test_buffered_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let mut driver = MemoryDriver::new(dir.path().join("out.nc"));
        let x = driver.define_dimension("x", Some(8)).unwrap();
        let v = driver.define_variable("v", ElementType::Int, &[x]).unwrap();
        driver.enddef().unwrap();

        // the first payload fills the buffer and is written through
        let config = LogConfig::for_testing(dir.path()).with_data_buffer_size(8);
        let mut log = DeferredLog::new(config.clone());
        log.note_variable_ndims(1).unwrap();
        log.initialize(&driver).unwrap();
        let a = ints(&[1, 2]);
        let b = ints(&[3]);
        log.append_write(
            &driver,
            &driver,
            &WriteCall::new(Selection::range(v, &[0], &[2]), ElementType::Int, &a),
        )
        .unwrap();
        log.append_write(
            &driver,
            &driver,
            &WriteCall::new(Selection::range(v, &[4], &[1]), ElementType::Int, &b),
        )
        .unwrap();
        // dropped without a sync, as a crash would leave it
        drop(log);

        let recovery = LogRecovery::for_config(&config, &driver).unwrap();
        let found = recovery.inspect().unwrap();
        assert_eq!(found.header.num_entries, 2);
        assert_eq!(found.entries.len(), 1);
        assert_eq!(found.lost_entries, 1);

        let stats = recovery
            .recover(&mut driver, IoMode::Collective, None)
            .unwrap();
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.lost, 1);
        let all = to_ints(&driver.peek(&Selection::range(v, &[0], &[8])).unwrap());
        assert_eq!(all, vec![1, 2, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_entry_with_wrong_payload_size_is_corrupt() {
        let (dir, driver, _) = crashed();
        let recovery = LogRecovery::for_catalog(dir.path(), &driver).unwrap();
        let paths = recovery.reader.paths().clone();
        let mut meta = MetaLog::open(paths.meta()).unwrap();
        let found = recovery.inspect().unwrap();
        let mut entry = found.entries[0].clone();
        entry.data_len = 4;
        let mut bytes = vec![0u8; entry.encoded_len()];
        entry.encode_into(&mut bytes);
        meta.write_at(found.header.entry_begin, &bytes).unwrap();

        assert!(matches!(recovery.inspect(), Err(LogError::CorruptLog(_))));
    }
}
