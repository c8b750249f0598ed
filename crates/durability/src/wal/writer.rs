//! Log writer.
//!
//! Appends one data-log payload and one metadata entry per intercepted
//! write. The in-memory mirror of the metadata log is authoritative while
//! the dataset is open; the on-disk copy exists for crash recovery and is
//! updated in commit order:
//!
//! 1. payload appended to the data log
//! 2. metadata entry written at its offset
//! 3. header `num_entries` incremented
//!
//! A crash before step 3 leaves the entry uncounted, so replay never sees a
//! half-written write. With a data-log buffer, step 1 may only stage the
//! payload; recovery treats counted entries whose payload never reached the
//! disk as uncommitted.

use std::time::Instant;

use stagelog_core::{LogError, LogResult, Status, WriteCall};

use super::check;
use super::config::LogConfig;
use super::metrics::{nanos, LogMetrics};
use super::paths::LogPaths;
use crate::buffer::{GrowableBuffer, SizeLedger};
use crate::format::{
    entry_size, BlockLayout, DataLog, LogEntry, LogHeader, MetaLog, MAX_NDIMS_OFFSET, NUM_ENTRIES_OFFSET,
};

/// Result of a successful in-memory append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    /// Payload bytes logged
    pub data_len: u64,
    /// Outcome of updating the on-disk mirror (and verifying it, if enabled)
    ///
    /// A failure here does not undo the append: the entry will still be
    /// replayed from memory, only crash recovery is affected.
    pub mirror: Status,
}

/// Writer for one process's log pair.
#[derive(Debug)]
pub struct LogWriter {
    paths: LogPaths,
    meta_log: MetaLog,
    data_log: DataLog,
    /// Header plus entries, byte-for-byte as on disk
    meta: GrowableBuffer,
    ledger: SizeLedger,
    header: LogHeader,
    verify: bool,
}

impl LogWriter {
    /// Create the log pair and write an empty header.
    ///
    /// For a shared data log the file must already have been prepared by
    /// its owner; this process only takes its channel.
    pub fn create(
        paths: LogPaths,
        rank: u32,
        num_procs: u32,
        max_ndims: usize,
        config: &LogConfig,
    ) -> LogResult<Self> {
        paths.create_dir()?;
        let buffer_size = usize::try_from(config.data_buffer_size).map_err(|_| {
            LogError::InvalidArgument(format!(
                "data log buffer of {} bytes",
                config.data_buffer_size
            ))
        })?;

        let header = LogHeader::new(
            paths.dataset_path().to_string_lossy(),
            rank,
            num_procs,
            max_ndims,
        );
        let mut meta = GrowableBuffer::new()?;
        meta.append(&header.to_bytes())?;

        let mut meta_log = MetaLog::create(paths.meta(), config.overwrite)?;
        let data_log = match meta_log
            .write_at(0, meta.as_slice())
            .and_then(|_| Self::create_data_log(&paths, rank, num_procs, config))
        {
            Ok(log) => log.with_buffer(buffer_size),
            Err(e) => {
                let _ = std::fs::remove_file(paths.meta());
                return Err(e);
            }
        };

        let mut writer = LogWriter {
            paths,
            meta_log,
            data_log,
            meta,
            ledger: SizeLedger::new()?,
            header,
            verify: config.verify_on_write,
        };
        if writer.verify {
            check::verify_header(&mut writer.meta_log, &writer.header)?;
        }

        tracing::info!(
            meta = %writer.paths.meta().display(),
            data = %writer.paths.data().display(),
            entry_begin = writer.header.entry_begin,
            shared = writer.paths.is_shared(),
            buffer = buffer_size,
            "Created write-ahead log"
        );
        Ok(writer)
    }

    fn create_data_log(
        paths: &LogPaths,
        rank: u32,
        num_procs: u32,
        config: &LogConfig,
    ) -> LogResult<DataLog> {
        if paths.is_shared() {
            let layout = BlockLayout::shared(config.shared_block_size, rank, num_procs)?;
            DataLog::join_shared(paths.data(), layout)
        } else {
            DataLog::create(paths.data(), config.overwrite)
        }
    }

    /// Append one write call.
    ///
    /// Errors returned here leave the log exactly as it was.
    pub fn append(&mut self, call: &WriteCall<'_>, metrics: &mut LogMetrics) -> LogResult<Appended> {
        call.validate()?;
        let started = Instant::now();

        let data_len = call.data.len() as u64;
        let mark = self.meta.len();
        let span = self.meta.allocate(entry_size(call.selection.ndims()))?;
        if let Err(e) = self.ledger.append(data_len) {
            self.meta.reset(mark);
            return Err(e);
        }
        let data_off = match self.data_log.append(call.data) {
            Ok(off) => off,
            Err(e) => {
                self.ledger.pop();
                self.meta.reset(mark);
                return Err(e);
            }
        };

        // Commit in memory
        let entry = LogEntry::from_call(call, data_off);
        entry.encode_into(self.meta.bytes_mut(span));
        self.header.num_entries += 1;
        let counter = LogHeader::encode_u64(self.header.num_entries);
        let header_span = crate::buffer::Span {
            offset: NUM_ENTRIES_OFFSET,
            len: 8,
        };
        self.meta.bytes_mut(header_span).copy_from_slice(&counter);

        // Mirror to disk: entry first, counter last
        let entry_bytes = self.meta.bytes(span).to_vec();
        let mut mirror = self
            .meta_log
            .write_at(span.offset as u64, &entry_bytes)
            .and_then(|_| self.meta_log.write_at(NUM_ENTRIES_OFFSET as u64, &counter));
        if mirror.is_ok() && self.verify {
            mirror = check::verify_entry(
                &mut self.meta_log,
                span.offset as u64,
                &entry,
                self.data_log.payload_len(),
            )
            .and_then(|_| check::verify_header(&mut self.meta_log, &self.header));
        }
        if let Err(e) = &mirror {
            metrics.mirror_failures += 1;
            tracing::warn!(
                path = %self.paths.meta().display(),
                entry = self.header.num_entries - 1,
                error = %e,
                "Metadata log mirror write failed; entry kept in memory"
            );
        }

        metrics.data_bytes += data_len;
        metrics.meta_bytes += span.len as u64;
        metrics.entries_logged += 1;
        metrics.log_write_nanos += nanos(started.elapsed());

        tracing::debug!(
            var = call.selection.var.0,
            data_off,
            data_len,
            entries = self.header.num_entries,
            "Logged write"
        );
        Ok(Appended { data_len, mirror })
    }

    /// Raise the header's `max_ndims` and persist it in place.
    pub fn set_max_ndims(&mut self, max_ndims: usize) -> LogResult<()> {
        self.header.max_ndims = max_ndims as u64;
        let bytes = LogHeader::encode_u64(self.header.max_ndims);
        let span = crate::buffer::Span {
            offset: MAX_NDIMS_OFFSET,
            len: 8,
        };
        self.meta.bytes_mut(span).copy_from_slice(&bytes);
        self.meta_log.write_at(MAX_NDIMS_OFFSET as u64, &bytes)
    }

    /// Offsets of every entry in the mirror, in log order.
    pub fn entry_offsets(&self) -> LogResult<Vec<usize>> {
        let bytes = self.meta.as_slice();
        let mut offsets = Vec::with_capacity(self.ledger.count());
        let mut pos = self.header.entry_begin as usize;
        while offsets.len() < self.header.num_entries as usize {
            offsets.push(pos);
            pos += LogEntry::peek_size(&bytes[pos.min(bytes.len())..])?;
        }
        Ok(offsets)
    }

    /// Decode the entry at a mirror offset.
    pub fn entry_at(&self, offset: usize) -> LogResult<LogEntry> {
        LogEntry::decode(&self.meta.as_slice()[offset..]).map(|(entry, _)| entry)
    }

    /// Pieces the replay needs at once.
    pub(crate) fn replay_parts(&mut self) -> (&[u8], &SizeLedger, &mut DataLog) {
        (self.meta.as_slice(), &self.ledger, &mut self.data_log)
    }

    /// Empty the log after a flush.
    ///
    /// The on-disk counter is zeroed first: once that write lands, a crash
    /// can no longer replay anything twice.
    pub fn reset(&mut self) -> LogResult<()> {
        self.header.num_entries = 0;
        let zero = LogHeader::encode_u64(0);
        let span = crate::buffer::Span {
            offset: NUM_ENTRIES_OFFSET,
            len: 8,
        };
        self.meta.bytes_mut(span).copy_from_slice(&zero);
        self.meta.reset(self.header.entry_begin as usize);
        self.ledger.reset();

        self.meta_log.write_at(NUM_ENTRIES_OFFSET as u64, &zero)?;
        self.meta_log.truncate(self.header.entry_begin)?;
        self.data_log.reset()
    }

    /// Flush both files to stable storage.
    pub fn sync(&mut self) -> LogResult<()> {
        self.meta_log.sync()?;
        self.data_log.sync()
    }

    /// Close the files, removing them if `delete` is set.
    pub fn close(mut self, delete: bool) -> LogResult<()> {
        let synced = self.sync();
        let LogWriter { paths, .. } = self;
        if delete {
            paths.remove()?;
            tracing::info!(meta = %paths.meta().display(), "Removed write-ahead log");
        } else if synced.is_ok() {
            tracing::info!(meta = %paths.meta().display(), "Closed write-ahead log, files kept");
        }
        synced
    }

    /// In-memory header.
    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// Committed entries.
    pub fn num_entries(&self) -> usize {
        self.header.num_entries as usize
    }

    /// Per-entry payload sizes.
    pub fn ledger(&self) -> &SizeLedger {
        &self.ledger
    }

    /// The metadata mirror, header included.
    pub fn mirror(&self) -> &[u8] {
        self.meta.as_slice()
    }

    /// Data log size including its prefix.
    pub fn data_log_size(&self) -> u64 {
        self.data_log.size()
    }

    /// Payload bytes waiting to be replayed.
    pub fn pending_bytes(&self) -> u64 {
        self.data_log.payload_len()
    }

    /// File locations.
    pub fn paths(&self) -> &LogPaths {
        &self.paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ints;
    use stagelog_core::{ElementType, Selection, VarId};
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn make_writer(verify: bool) -> (TempDir, LogWriter) {
        let dir = tempdir().unwrap();
        let paths = LogPaths::derive(dir.path(), Path::new("/data/out.nc"), 1, 0).unwrap();
        let config = LogConfig::for_testing(dir.path()).with_verify_on_write(verify);
        let writer = LogWriter::create(paths, 0, 1, 1, &config).unwrap();
        (dir, writer)
    }

    #[test]
    fn test_new_log_is_empty() {
        let (_dir, writer) = make_writer(true);
        assert_eq!(writer.num_entries(), 0);
        assert_eq!(writer.data_log_size(), 8);
        assert_eq!(writer.mirror().len() as u64, writer.header().entry_begin);
        let on_disk = std::fs::read(writer.paths().meta()).unwrap();
        assert_eq!(on_disk, writer.mirror());
    }

    #[test]
    fn test_single_range_write() {
        let (_dir, mut writer) = make_writer(true);
        let mut metrics = LogMetrics::default();
        let data = ints(&[7, 7, 7]);
        let start = [2u64];
        let count = [3u64];
        let call = WriteCall::new(
            Selection::range(VarId(0), &start, &count),
            ElementType::Int,
            &data,
        );

        let appended = writer.append(&call, &mut metrics).unwrap();
        assert_eq!(appended.data_len, 12);
        assert_eq!(appended.mirror, Ok(()));
        assert_eq!(writer.num_entries(), 1);
        assert_eq!(writer.data_log_size(), 8 + 12);
        assert_eq!(writer.ledger().as_slice(), &[12]);

        let offsets = writer.entry_offsets().unwrap();
        let entry = writer.entry_at(offsets[0]).unwrap();
        assert_eq!(entry.data_len, 12);
        assert_eq!(entry.data_off, 0);
        assert_eq!(entry.start.as_slice(), &[2]);
        assert_eq!(entry.count.as_slice(), &[3]);

        let on_disk = std::fs::read(writer.paths().meta()).unwrap();
        assert_eq!(on_disk, writer.mirror());
        let header = LogHeader::from_bytes(&on_disk).unwrap();
        assert_eq!(header.num_entries, 1);

        assert_eq!(metrics.entries_logged, 1);
        assert_eq!(metrics.data_bytes, 12);
        assert_eq!(metrics.meta_bytes, entry_size(1) as u64);
    }

    #[test]
    fn test_data_offsets_accumulate() {
        let (_dir, mut writer) = make_writer(false);
        let mut metrics = LogMetrics::default();
        for (i, n) in [1u64, 4, 2].iter().enumerate() {
            let data = vec![i as u8; (*n * 4) as usize];
            let start = [0u64];
            let count = [*n];
            let call = WriteCall::new(
                Selection::range(VarId(0), &start, &count),
                ElementType::Float,
                &data,
            );
            writer.append(&call, &mut metrics).unwrap();
        }
        let offs: Vec<u64> = writer
            .entry_offsets()
            .unwrap()
            .into_iter()
            .map(|o| writer.entry_at(o).unwrap().data_off)
            .collect();
        assert_eq!(offs, vec![0, 4, 20]);
        assert_eq!(writer.pending_bytes(), 28);
    }

    #[test]
    fn test_invalid_call_leaves_log_untouched() {
        let (_dir, mut writer) = make_writer(false);
        let mut metrics = LogMetrics::default();
        let data = [0u8; 5];
        let start = [0u64];
        let count = [2u64];
        let call = WriteCall::new(
            Selection::range(VarId(0), &start, &count),
            ElementType::Int,
            &data,
        );
        assert!(writer.append(&call, &mut metrics).is_err());
        assert_eq!(writer.num_entries(), 0);
        assert_eq!(writer.data_log_size(), 8);
        assert_eq!(writer.mirror().len() as u64, writer.header().entry_begin);
    }

    #[test]
    fn test_reset_empties_everything() {
        let (_dir, mut writer) = make_writer(true);
        let mut metrics = LogMetrics::default();
        let data = ints(&[1, 2]);
        let start = [0u64, 0];
        let count = [1u64, 2];
        let call = WriteCall::new(
            Selection::range(VarId(1), &start, &count),
            ElementType::Int,
            &data,
        );
        writer.append(&call, &mut metrics).unwrap();
        writer.reset().unwrap();

        assert_eq!(writer.num_entries(), 0);
        assert_eq!(writer.ledger().count(), 0);
        assert_eq!(writer.data_log_size(), 8);
        assert_eq!(std::fs::metadata(writer.paths().data()).unwrap().len(), 8);
        let on_disk = std::fs::read(writer.paths().meta()).unwrap();
        assert_eq!(LogHeader::from_bytes(&on_disk).unwrap().num_entries, 0);
        assert_eq!(on_disk, writer.mirror());

        // log is reusable after reset
        writer.append(&call, &mut metrics).unwrap();
        assert_eq!(writer.entry_at(writer.entry_offsets().unwrap()[0]).unwrap().data_off, 0);
    }

    #[test]
    fn test_set_max_ndims_persists() {
        let (_dir, mut writer) = make_writer(false);
        writer.set_max_ndims(4).unwrap();
        let on_disk = std::fs::read(writer.paths().meta()).unwrap();
        assert_eq!(LogHeader::from_bytes(&on_disk).unwrap().max_ndims, 4);
        assert_eq!(writer.header().max_ndims, 4);
    }

    #[test]
    fn test_existing_log_rejected_without_overwrite() {
        let (dir, writer) = make_writer(false);
        let paths = writer.paths().clone();
        writer.close(false).unwrap();
        let config = LogConfig::for_testing(dir.path());
        assert!(LogWriter::create(paths.clone(), 0, 1, 1, &config).is_err());
        let config = config.with_overwrite(true);
        assert!(LogWriter::create(paths, 0, 1, 1, &config).is_ok());
    }

    #[test]
    fn test_close_deletes_files() {
        let (_dir, writer) = make_writer(false);
        let paths = writer.paths().clone();
        writer.close(true).unwrap();
        assert!(!paths.exists());
    }
}
