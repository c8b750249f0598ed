//! Deferred write-ahead log
//!
//! [`DeferredLog`] is the per-process log context. It owns the log files,
//! the metadata index, the pending-request table and the counters, and
//! exposes the operations the dataset layer needs: append (blocking and
//! deferred), flush, wait, cancel and close.
//!
//! # Flush discipline
//!
//! Appends never flush. A flush calls the base driver collectively, so it
//! only happens on operations every process performs together: explicit
//! flush, sync, redefinition, read, wait, close.

pub mod check;
pub mod config;
pub mod flush;
pub mod index;
pub mod metrics;
pub mod paths;
pub mod requests;
pub mod writer;

use std::time::Instant;

use stagelog_core::{
    BaseDriver, DatasetCatalog, IoMode, LogError, LogResult, RequestId, Selection, Status,
    WriteCall,
};

pub use config::{LogConfig, LogConfigError};
pub use flush::{flush_budget, FlushStats, ReplaySource, Replayer};
pub use index::{IndexEntry, MetadataIndex};
pub use metrics::LogMetrics;
pub use paths::LogPaths;
pub use requests::{PendingRequest, RequestTracker};
pub use writer::{Appended, LogWriter};

use crate::format::{DataLog, LogEntry};
use metrics::nanos;

/// Entries of the in-memory mirror, as seen by the replayer.
struct MirrorSource<'a> {
    mirror: &'a [u8],
    offsets: &'a [usize],
    sizes: &'a [u64],
    index: &'a MetadataIndex,
}

impl ReplaySource for MirrorSource<'_> {
    fn len(&self) -> usize {
        self.offsets.len()
    }

    fn size(&self, i: usize) -> u64 {
        self.sizes[i]
    }

    fn is_valid(&self, i: usize) -> bool {
        self.index.is_valid(i)
    }

    fn entry(&self, i: usize) -> LogResult<LogEntry> {
        LogEntry::decode(&self.mirror[self.offsets[i]..]).map(|(entry, _)| entry)
    }
}

/// Furthest record index a selection reaches, if its outermost dimension is
/// the record dimension.
fn record_reach<C: DatasetCatalog + ?Sized>(
    catalog: &C,
    selection: &Selection<'_>,
) -> LogResult<Option<u64>> {
    let Some(record_dim) = catalog.record_dimension() else {
        return Ok(None);
    };
    if selection.ndims() == 0 || selection.count[0] == 0 {
        return Ok(None);
    }
    let dims = catalog.variable_dimensions(selection.var)?;
    if dims.first() != Some(&record_dim) {
        return Ok(None);
    }
    selection.end(0).map(Some)
}

/// Per-process deferred write log.
#[derive(Debug)]
pub struct DeferredLog {
    config: LogConfig,
    writer: Option<LogWriter>,
    index: MetadataIndex,
    requests: RequestTracker,
    metrics: LogMetrics,
    /// Set for the duration of a flush
    flushing: bool,
    /// Set when a flush could not reset the log
    poisoned: bool,
    max_ndims: usize,
    record_extent: u64,
}

impl DeferredLog {
    /// Create a log context; files are created by [`DeferredLog::initialize`].
    pub fn new(config: LogConfig) -> Self {
        DeferredLog {
            config,
            writer: None,
            index: MetadataIndex::new(),
            requests: RequestTracker::new(),
            metrics: LogMetrics::default(),
            flushing: false,
            poisoned: false,
            max_ndims: 0,
            record_extent: 0,
        }
    }

    /// Create the log files for the dataset. Does nothing if already done.
    ///
    /// Collective in shared-log mode: rank 0 creates the shared data log
    /// and every process waits on the catalog's barrier before joining it.
    pub fn initialize<C: DatasetCatalog + ?Sized>(&mut self, catalog: &C) -> LogResult<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        self.config.validate()?;
        let paths = LogPaths::for_config(&self.config, catalog)?;
        if paths.is_shared() {
            let prepared = if paths.owns_data() {
                paths
                    .create_dir()
                    .and_then(|_| DataLog::prepare_shared(paths.data(), self.config.overwrite))
            } else {
                Ok(())
            };
            // entered even on failure so the other processes are released
            catalog.barrier()?;
            prepared?;
        }
        self.writer = Some(LogWriter::create(
            paths,
            catalog.rank(),
            catalog.num_procs(),
            self.max_ndims,
            &self.config,
        )?);
        Ok(())
    }

    /// Account for a variable of `ndims` dimensions.
    ///
    /// The header's `max_ndims` is rewritten on disk when it grows.
    pub fn note_variable_ndims(&mut self, ndims: usize) -> LogResult<()> {
        if ndims <= self.max_ndims {
            return Ok(());
        }
        self.max_ndims = ndims;
        match self.writer.as_mut() {
            Some(writer) => writer.set_max_ndims(ndims),
            None => Ok(()),
        }
    }

    fn append_one<D, C>(
        &mut self,
        driver: &D,
        catalog: &C,
        call: &WriteCall<'_>,
    ) -> LogResult<(u64, Status)>
    where
        D: BaseDriver + ?Sized,
        C: DatasetCatalog + ?Sized,
    {
        if self.poisoned {
            return Err(LogError::CorruptLog(
                "log could not be reset after a flush; no further writes are accepted".into(),
            ));
        }
        if self.writer.is_none() {
            return Err(LogError::NotInitialized);
        }

        let ndims = driver.inquire_variable(call.selection.var)?;
        if ndims != call.selection.ndims() {
            return Err(LogError::InvalidArgument(format!(
                "{} has {} dimensions, write addresses {}",
                call.selection.var,
                ndims,
                call.selection.ndims()
            )));
        }
        let reach = record_reach(catalog, &call.selection)?;
        // datasets opened for writing never went through definition
        self.note_variable_ndims(ndims)?;

        let writer = self.writer.as_mut().ok_or(LogError::NotInitialized)?;
        let appended = writer.append(call, &mut self.metrics)?;
        self.index.push();
        if let Some(reach) = reach {
            self.record_extent = self.record_extent.max(reach);
        }
        Ok((appended.data_len, appended.mirror))
    }

    /// Log a blocking write; returns the payload bytes logged.
    ///
    /// A failure to mirror the entry on disk is returned as an error even
    /// though the entry stays in memory and will be replayed.
    pub fn append_write<D, C>(&mut self, driver: &D, catalog: &C, call: &WriteCall<'_>) -> LogResult<u64>
    where
        D: BaseDriver + ?Sized,
        C: DatasetCatalog + ?Sized,
    {
        let (len, mirror) = self.append_one(driver, catalog, call)?;
        mirror?;
        Ok(len)
    }

    /// Log a deferred write of one or more ranges; returns its request id.
    ///
    /// Either every range is logged or none is. Mirror failures are carried
    /// in the request's status.
    pub fn append_deferred<D, C>(
        &mut self,
        driver: &D,
        catalog: &C,
        calls: &[WriteCall<'_>],
    ) -> LogResult<RequestId>
    where
        D: BaseDriver + ?Sized,
        C: DatasetCatalog + ?Sized,
    {
        let first = self.index.len();
        let mut mirror: Status = Ok(());
        for call in calls {
            match self.append_one(driver, catalog, call) {
                Ok((_, status)) => {
                    if mirror.is_ok() {
                        mirror = status;
                    }
                }
                Err(e) => {
                    self.index.invalidate(first..self.index.len());
                    return Err(e);
                }
            }
        }

        let span = first..self.index.len();
        let id = self.requests.begin(span.clone());
        self.index.link(span, id);
        self.requests.note(id, &mirror);
        Ok(RequestId::Log(id))
    }

    /// Complete a deferred write, flushing if it has not been replayed.
    ///
    /// Returns the request's outcome and recycles its id. Collective when a
    /// flush is needed.
    pub fn resolve<D: BaseDriver + ?Sized>(&mut self, id: u32, driver: &mut D, mode: IoMode) -> Status {
        if !self.requests.is_ready(id)? {
            if let Err(e) = self.flush(driver, mode) {
                if e.is_fatal() {
                    return Err(e);
                }
            }
            if !self.requests.is_ready(id)? {
                return Err(LogError::InvalidArgument(format!(
                    "{} cannot complete while a flush is in progress",
                    RequestId::Log(id)
                )));
            }
        }
        self.requests.take(id)?.status
    }

    /// Cancel a deferred write.
    ///
    /// Refused with `AlreadyCompleted` once the write has been replayed.
    pub fn cancel(&mut self, id: u32) -> Status {
        let result = self.requests.cancel(id, &mut self.index);
        if result.is_ok() {
            tracing::debug!(request = id, "Cancelled deferred write");
        }
        result
    }

    /// Replay every logged entry into the base driver and empty the log.
    ///
    /// Collective. A flush with nothing logged is a no-op, and so is a
    /// flush requested while one is running.
    pub fn flush<D: BaseDriver + ?Sized>(&mut self, driver: &mut D, mode: IoMode) -> LogResult<FlushStats> {
        if self.flushing {
            tracing::debug!("Flush requested during a flush; ignored");
            return Ok(FlushStats::default());
        }
        if self.poisoned {
            return Err(LogError::CorruptLog(
                "log could not be reset after an earlier flush".into(),
            ));
        }
        let Some(writer) = self.writer.as_mut() else {
            return Ok(FlushStats::default());
        };
        if writer.num_entries() == 0 {
            return Ok(FlushStats::default());
        }

        self.flushing = true;
        let started = Instant::now();
        let limit = self.config.flush_limit();
        let (stats, status) = replay(writer, &self.index, &mut self.requests, driver, mode, limit);

        // Reset runs whatever the replay outcome.
        self.index.reset();
        self.requests.mark_all_ready();
        let reset = writer.reset();
        self.flushing = false;

        self.metrics.flushes += 1;
        self.metrics.entries_replayed += stats.replayed as u64;
        self.metrics.entries_skipped += stats.skipped as u64;
        self.metrics.entries_split += stats.split as u64;
        self.metrics.peak_flush_buffer = self.metrics.peak_flush_buffer.max(stats.budget);
        self.metrics.flush_read_nanos += stats.read_nanos;
        self.metrics.flush_replay_nanos += stats.replay_nanos;
        self.metrics.flush_total_nanos += nanos(started.elapsed());

        if let Err(e) = reset {
            self.poisoned = true;
            tracing::warn!(error = %e, "Failed to reset log after flush");
            return Err(LogError::CorruptLog(format!(
                "log reset failed after flush: {}",
                e
            )));
        }

        tracing::info!(
            entries = stats.entries,
            replayed = stats.replayed,
            skipped = stats.skipped,
            split = stats.split,
            batches = stats.batches,
            budget = stats.budget,
            ok = status.is_ok(),
            "Flushed write-ahead log"
        );
        status.map(|_| stats)
    }

    /// Flush, close the files and remove them if configured.
    ///
    /// Files are kept when the final flush fails, so the log can be recovered.
    pub fn close<D: BaseDriver + ?Sized>(mut self, driver: &mut D, mode: IoMode) -> LogResult<()> {
        let flushed = self.flush(driver, mode).map(|_| ());
        let closed = match self.writer.take() {
            Some(writer) => {
                let delete = self.config.delete_on_close && flushed.is_ok();
                if self.config.delete_on_close && !delete {
                    tracing::warn!(
                        meta = %writer.paths().meta().display(),
                        "Keeping write-ahead log after failed flush"
                    );
                }
                writer.close(delete)
            }
            None => Ok(()),
        };
        flushed.and(closed)
    }

    /// Close the files without flushing, keeping them for recovery.
    pub fn abandon(mut self) -> LogResult<()> {
        match self.writer.take() {
            Some(writer) => {
                let entries = writer.num_entries();
                writer.close(false)?;
                if entries > 0 {
                    tracing::warn!(entries, "Abandoned write-ahead log with unreplayed entries");
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Whether the log files exist.
    pub fn is_initialized(&self) -> bool {
        self.writer.is_some()
    }

    /// Whether a flush is running.
    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Ids of outstanding deferred writes.
    pub fn outstanding_requests(&self) -> Vec<u32> {
        self.requests.ids()
    }

    /// Number of outstanding deferred writes.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Payload bytes waiting to be replayed.
    pub fn pending_bytes(&self) -> u64 {
        self.writer.as_ref().map_or(0, |w| w.pending_bytes())
    }

    /// Entries waiting to be replayed, cancelled ones included.
    pub fn num_entries(&self) -> usize {
        self.writer.as_ref().map_or(0, |w| w.num_entries())
    }

    /// Highest record index + 1 reached by any logged write.
    pub fn record_extent(&self) -> u64 {
        self.record_extent
    }

    /// Highest dimensionality seen.
    pub fn max_ndims(&self) -> usize {
        self.max_ndims
    }

    /// Snapshot of the counters.
    pub fn metrics(&self) -> LogMetrics {
        self.metrics.clone()
    }

    /// Effective configuration.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// The writer, once initialized.
    pub fn writer(&self) -> Option<&LogWriter> {
        self.writer.as_ref()
    }
}

/// Replay the writer's entries, recording outcomes in the request table.
fn replay<D: BaseDriver + ?Sized>(
    writer: &mut LogWriter,
    index: &MetadataIndex,
    requests: &mut RequestTracker,
    driver: &mut D,
    mode: IoMode,
    limit: Option<u64>,
) -> (FlushStats, Status) {
    let mut fail_all = |e: LogError| {
        let failed: Status = Err(e);
        for i in 0..index.len() {
            if let (true, Some(id)) = (index.is_valid(i), index.request_of(i)) {
                requests.record(id, &failed);
            }
        }
        (FlushStats::default(), failed)
    };

    let offsets = match writer.entry_offsets() {
        Ok(offsets) => offsets,
        Err(e) => return fail_all(e),
    };
    if offsets.len() != index.len() || offsets.len() != writer.ledger().count() {
        return fail_all(LogError::CorruptLog(format!(
            "log holds {} entries, index {}, ledger {}",
            offsets.len(),
            index.len(),
            writer.ledger().count()
        )));
    }

    let budget = flush_budget(limit, writer.pending_bytes());
    let mut replayer = match Replayer::new(driver, mode, budget) {
        Ok(replayer) => replayer,
        Err(e) => return fail_all(e),
    };

    let (mirror, ledger, data) = writer.replay_parts();
    let source = MirrorSource {
        mirror,
        offsets: &offsets,
        sizes: ledger.as_slice(),
        index,
    };
    let status = replayer.run(&source, data, |i, status| {
        if let Some(id) = index.request_of(i) {
            requests.record(id, status);
        }
    });
    (replayer.into_stats(), status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ints, to_ints, DriverCall, MemoryDriver};
    use stagelog_core::{DatasetBackend, ElementType, VarId};
    use tempfile::{tempdir, TempDir};

    struct Setup {
        dir: TempDir,
        log: DeferredLog,
        driver: MemoryDriver,
        grid: VarId,
        series: VarId,
    }

    fn setup_with(config: impl FnOnce(LogConfig) -> LogConfig) -> Setup {
        let dir = tempdir().unwrap();
        let mut driver = MemoryDriver::new(dir.path().join("out.nc"));
        let time = driver.define_dimension("time", None).unwrap();
        let y = driver.define_dimension("y", Some(4)).unwrap();
        let x = driver.define_dimension("x", Some(4)).unwrap();
        let grid = driver
            .define_variable("grid", ElementType::Int, &[y, x])
            .unwrap();
        let series = driver
            .define_variable("series", ElementType::Int, &[time, x])
            .unwrap();
        driver.enddef().unwrap();

        let mut log = DeferredLog::new(config(LogConfig::for_testing(dir.path())));
        log.note_variable_ndims(2).unwrap();
        log.initialize(&driver).unwrap();
        Setup {
            dir,
            log,
            driver,
            grid,
            series,
        }
    }

    fn setup() -> Setup {
        setup_with(|c| c)
    }

    fn read(driver: &MemoryDriver, var: VarId, start: &[u64], count: &[u64]) -> Vec<i32> {
        to_ints(&driver.peek(&Selection::range(var, start, count)).unwrap())
    }

    #[test]
    fn test_blocking_write_replayed_on_flush() {
        let mut s = setup();
        let data = ints(&[7, 7, 7]);
        let call = WriteCall::new(
            Selection::range(s.grid, &[2, 0], &[1, 3]),
            ElementType::Int,
            &data,
        );
        assert_eq!(s.log.append_write(&s.driver, &s.driver, &call).unwrap(), 12);
        assert_eq!(s.log.num_entries(), 1);
        assert_eq!(s.log.pending_bytes(), 12);
        assert!(s.driver.writes().is_empty());

        let stats = s.log.flush(&mut s.driver, IoMode::Collective).unwrap();
        assert_eq!(stats.replayed, 1);
        assert_eq!(read(&s.driver, s.grid, &[2, 0], &[1, 4]), vec![7, 7, 7, 0]);
        assert_eq!(s.log.num_entries(), 0);
        assert_eq!(s.log.pending_bytes(), 0);
        assert_eq!(s.log.writer().unwrap().data_log_size(), 8);
    }

    #[test]
    fn test_append_before_initialize() {
        let dir = tempdir().unwrap();
        let mut driver = MemoryDriver::new("/data/a.nc");
        let x = driver.define_dimension("x", Some(2)).unwrap();
        let v = driver.define_variable("v", ElementType::Int, &[x]).unwrap();
        let mut log = DeferredLog::new(LogConfig::for_testing(dir.path()));
        let data = ints(&[1]);
        let call = WriteCall::new(Selection::range(v, &[0], &[1]), ElementType::Int, &data);
        assert_eq!(
            log.append_write(&driver, &driver, &call),
            Err(LogError::NotInitialized)
        );
        assert!(log.flush(&mut driver, IoMode::Collective).unwrap() == FlushStats::default());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut s = setup();
        let data = ints(&[1]);
        let call = WriteCall::new(Selection::range(s.grid, &[0], &[1]), ElementType::Int, &data);
        assert!(matches!(
            s.log.append_write(&s.driver, &s.driver, &call),
            Err(LogError::InvalidArgument(_))
        ));
        assert_eq!(s.log.num_entries(), 0);
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let mut s = setup();
        let stats = s.log.flush(&mut s.driver, IoMode::Collective).unwrap();
        assert_eq!(stats, FlushStats::default());
        assert_eq!(s.driver.calls(), &[DriverCall::Enddef]);
        assert_eq!(s.log.metrics().flushes, 0);
    }

    #[test]
    fn test_flush_twice() {
        let mut s = setup();
        let data = ints(&[1, 2]);
        let call = WriteCall::new(
            Selection::range(s.grid, &[0, 0], &[1, 2]),
            ElementType::Int,
            &data,
        );
        s.log.append_write(&s.driver, &s.driver, &call).unwrap();
        s.log.flush(&mut s.driver, IoMode::Collective).unwrap();
        let calls = s.driver.calls().len();
        s.log.flush(&mut s.driver, IoMode::Collective).unwrap();
        assert_eq!(s.driver.calls().len(), calls);
    }

    #[test]
    fn test_deferred_write_resolved_by_wait() {
        let mut s = setup();
        let data = ints(&[4, 5]);
        let call = WriteCall::new(
            Selection::range(s.grid, &[1, 1], &[1, 2]),
            ElementType::Int,
            &data,
        );
        let id = s.log.append_deferred(&s.driver, &s.driver, &[call]).unwrap();
        let RequestId::Log(id) = id else {
            panic!("expected a log request id");
        };
        assert_eq!(s.log.pending_requests(), 1);

        assert!(s.log.resolve(id, &mut s.driver, IoMode::Collective).is_ok());
        assert_eq!(read(&s.driver, s.grid, &[1, 0], &[1, 4]), vec![0, 4, 5, 0]);
        assert_eq!(s.log.pending_requests(), 0);
        assert!(matches!(
            s.log.resolve(id, &mut s.driver, IoMode::Collective),
            Err(LogError::InvalidRequestId(_))
        ));
    }

    #[test]
    fn test_cancelled_write_never_reaches_driver() {
        let mut s = setup();
        let a = ints(&[1]);
        let b = ints(&[2, 3]);
        let keep = WriteCall::new(Selection::range(s.grid, &[0, 0], &[1, 1]), ElementType::Int, &a);
        let drop_ = WriteCall::new(Selection::range(s.grid, &[0, 1], &[1, 2]), ElementType::Int, &b);
        s.log.append_write(&s.driver, &s.driver, &keep).unwrap();
        let RequestId::Log(id) = s.log.append_deferred(&s.driver, &s.driver, &[drop_]).unwrap() else {
            panic!("expected a log request id");
        };

        assert!(s.log.cancel(id).is_ok());
        assert_eq!(s.log.pending_requests(), 0);
        let stats = s.log.flush(&mut s.driver, IoMode::Collective).unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(s.driver.writes().len(), 1);
        assert_eq!(read(&s.driver, s.grid, &[0, 0], &[1, 4]), vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_cancel_after_flush_reports_completion() {
        let mut s = setup();
        let data = ints(&[9]);
        let call = WriteCall::new(Selection::range(s.grid, &[3, 3], &[1, 1]), ElementType::Int, &data);
        let RequestId::Log(id) = s.log.append_deferred(&s.driver, &s.driver, &[call]).unwrap() else {
            panic!("expected a log request id");
        };
        s.log.flush(&mut s.driver, IoMode::Collective).unwrap();

        assert_eq!(s.log.cancel(id), Err(LogError::AlreadyCompleted(None)));
        assert!(s.log.outstanding_requests().is_empty());
        assert_eq!(read(&s.driver, s.grid, &[3, 3], &[1, 1]), vec![9]);
    }

    #[test]
    fn test_multi_range_request_cancelled_as_a_whole() {
        let mut s = setup();
        let a = ints(&[1, 1]);
        let b = ints(&[2, 2]);
        let calls = [
            WriteCall::new(Selection::range(s.grid, &[0, 0], &[1, 2]), ElementType::Int, &a),
            WriteCall::new(Selection::range(s.grid, &[2, 0], &[1, 2]), ElementType::Int, &b),
        ];
        let RequestId::Log(id) = s.log.append_deferred(&s.driver, &s.driver, &calls).unwrap() else {
            panic!("expected a log request id");
        };
        assert_eq!(s.log.num_entries(), 2);
        s.log.cancel(id).unwrap();
        let stats = s.log.flush(&mut s.driver, IoMode::Collective).unwrap();
        assert_eq!(stats.skipped, 2);
        assert!(s.driver.writes().is_empty());
    }

    #[test]
    fn test_failed_replay_reported_and_log_reset() {
        let mut s = setup();
        s.driver.fail_writes_to(s.grid);
        let a = ints(&[1]);
        let b = ints(&[2]);
        let bad = WriteCall::new(Selection::range(s.grid, &[0, 0], &[1, 1]), ElementType::Int, &a);
        let good = WriteCall::new(Selection::range(s.series, &[0, 0], &[1, 1]), ElementType::Int, &b);
        let RequestId::Log(bad_id) = s.log.append_deferred(&s.driver, &s.driver, &[bad]).unwrap() else {
            panic!("expected a log request id");
        };
        let RequestId::Log(good_id) = s.log.append_deferred(&s.driver, &s.driver, &[good]).unwrap() else {
            panic!("expected a log request id");
        };

        assert!(s.log.flush(&mut s.driver, IoMode::Collective).is_err());
        assert_eq!(s.log.num_entries(), 0);
        assert!(s.log.resolve(bad_id, &mut s.driver, IoMode::Collective).is_err());
        assert!(s.log.resolve(good_id, &mut s.driver, IoMode::Collective).is_ok());
        assert_eq!(read(&s.driver, s.series, &[0, 0], &[1, 1]), vec![2]);
    }

    #[test]
    fn test_small_flush_buffer_splits() {
        let mut s = setup_with(|c| c.with_flush_buffer_size(16));
        let values: Vec<i32> = (0..16).collect();
        let data = ints(&values);
        let call = WriteCall::new(
            Selection::range(s.grid, &[0, 0], &[4, 4]),
            ElementType::Int,
            &data,
        );
        s.log.append_write(&s.driver, &s.driver, &call).unwrap();
        let stats = s.log.flush(&mut s.driver, IoMode::Collective).unwrap();
        assert_eq!(stats.split, 1);
        assert_eq!(stats.split_pieces, 4);
        assert!(stats.largest_read <= 16);
        assert_eq!(read(&s.driver, s.grid, &[0, 0], &[4, 4]), values);
        assert_eq!(s.log.metrics().peak_flush_buffer, 16);
    }

    #[test]
    fn test_record_extent_tracks_logged_writes() {
        let mut s = setup();
        let data = ints(&[1, 2]);
        let call = WriteCall::new(
            Selection::strided(s.series, &[1, 0], &[2, 1], &[3, 1]),
            ElementType::Int,
            &data,
        );
        s.log.append_write(&s.driver, &s.driver, &call).unwrap();
        assert_eq!(s.log.record_extent(), 5);
        assert_eq!(s.driver.num_records(), 0);
        s.log.flush(&mut s.driver, IoMode::Collective).unwrap();
        assert_eq!(s.driver.num_records(), 5);
    }

    #[test]
    fn test_record_extent_overflow_rejected() {
        let mut s = setup();
        let data = ints(&[1, 2]);
        let call = WriteCall::new(
            Selection::strided(s.series, &[u64::MAX - 2, 0], &[2, 1], &[4, 1]),
            ElementType::Int,
            &data,
        );
        assert!(matches!(
            s.log.append_write(&s.driver, &s.driver, &call),
            Err(LogError::InvalidArgument(_))
        ));
        assert_eq!(s.log.num_entries(), 0);
        assert_eq!(s.log.record_extent(), 0);
    }

    #[test]
    fn test_flush_uses_requested_mode() {
        let mut s = setup();
        let data = ints(&[1]);
        let call = WriteCall::new(Selection::range(s.grid, &[0, 0], &[1, 1]), ElementType::Int, &data);
        s.log.append_write(&s.driver, &s.driver, &call).unwrap();
        s.log.flush(&mut s.driver, IoMode::Independent).unwrap();
        assert!(s
            .driver
            .calls()
            .iter()
            .any(|c| matches!(c, DriverCall::Wait(_, IoMode::Independent))));
    }

    fn shared_process(dir: &std::path::Path, rank: u32) -> (MemoryDriver, VarId) {
        let mut driver = MemoryDriver::new(dir.join("out.nc")).with_rank(rank, 2);
        let x = driver.define_dimension("x", Some(8)).unwrap();
        let v = driver.define_variable("v", ElementType::Int, &[x]).unwrap();
        driver.enddef().unwrap();
        (driver, v)
    }

    #[test]
    fn test_shared_data_log_replays_per_process() {
        let dir = tempdir().unwrap();
        let config = LogConfig::for_testing(dir.path())
            .with_shared_log(true)
            .with_shared_block_size(16)
            .with_data_buffer_size(64);

        let mut procs = Vec::new();
        for rank in 0..2 {
            let (driver, v) = shared_process(dir.path(), rank);
            let mut log = DeferredLog::new(config.clone());
            log.note_variable_ndims(1).unwrap();
            log.initialize(&driver).unwrap();
            procs.push((log, driver, v));
        }
        let data_files = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().map_or(false, |x| x == "data"))
            .count();
        assert_eq!(data_files, 1);

        let rows = [vec![1, 2, 3, 4, 5], vec![7, 8, 9]];
        for (rank, (log, driver, v)) in procs.iter_mut().enumerate() {
            let values = &rows[rank];
            let data = ints(values);
            let count = [values.len() as u64];
            let start = [rank as u64];
            let call = WriteCall::new(Selection::range(*v, &start, &count), ElementType::Int, &data);
            log.append_write(driver, driver, &call).unwrap();
        }
        for (log, driver, _) in procs.iter_mut() {
            log.flush(driver, IoMode::Collective).unwrap();
        }
        assert_eq!(read(&procs[0].1, procs[0].2, &[0], &[8]), vec![1, 2, 3, 4, 5, 0, 0, 0]);
        assert_eq!(read(&procs[1].1, procs[1].2, &[0], &[8]), vec![0, 7, 8, 9, 0, 0, 0, 0]);

        let shared = procs[0].0.writer().unwrap().paths().data().to_path_buf();
        let (owner, other) = (procs.remove(0), procs.remove(0));
        let (log, mut driver, _) = other;
        log.close(&mut driver, IoMode::Collective).unwrap();
        assert!(shared.exists());
        let (log, mut driver, _) = owner;
        log.close(&mut driver, IoMode::Collective).unwrap();
        assert!(!shared.exists());
    }

    #[test]
    fn test_close_removes_files() {
        let mut s = setup();
        let paths = s.log.writer().unwrap().paths().clone();
        let data = ints(&[1]);
        let call = WriteCall::new(Selection::range(s.grid, &[0, 0], &[1, 1]), ElementType::Int, &data);
        s.log.append_write(&s.driver, &s.driver, &call).unwrap();
        s.log.close(&mut s.driver, IoMode::Collective).unwrap();
        assert!(!paths.exists());
        assert_eq!(read(&s.driver, s.grid, &[0, 0], &[1, 1]), vec![1]);
    }

    #[test]
    fn test_close_keeps_files_after_failed_flush() {
        let mut s = setup();
        let paths = s.log.writer().unwrap().paths().clone();
        s.driver.fail_writes_to(s.grid);
        let data = ints(&[1]);
        let call = WriteCall::new(Selection::range(s.grid, &[0, 0], &[1, 1]), ElementType::Int, &data);
        s.log.append_write(&s.driver, &s.driver, &call).unwrap();
        assert!(s.log.close(&mut s.driver, IoMode::Collective).is_err());
        assert!(paths.exists());
    }

    #[test]
    fn test_close_keeps_files_when_configured() {
        let mut s = setup_with(|c| c.with_delete_on_close(false));
        let paths = s.log.writer().unwrap().paths().clone();
        s.log.close(&mut s.driver, IoMode::Collective).unwrap();
        assert!(paths.exists());
        assert!(paths.meta().starts_with(s.dir.path()));
    }

    #[test]
    fn test_abandon_leaves_entries_on_disk() {
        let mut s = setup();
        let paths = s.log.writer().unwrap().paths().clone();
        let data = ints(&[3, 4]);
        let call = WriteCall::new(Selection::range(s.grid, &[1, 0], &[1, 2]), ElementType::Int, &data);
        s.log.append_write(&s.driver, &s.driver, &call).unwrap();
        s.log.abandon().unwrap();
        assert!(paths.exists());
        assert!(s.driver.writes().is_empty());
    }

    #[test]
    fn test_max_ndims_rewritten_in_header() {
        let mut s = setup();
        s.log.note_variable_ndims(5).unwrap();
        assert_eq!(s.log.max_ndims(), 5);
        assert_eq!(s.log.writer().unwrap().header().max_ndims, 5);
        s.log.note_variable_ndims(3).unwrap();
        assert_eq!(s.log.max_ndims(), 5);
    }
}
