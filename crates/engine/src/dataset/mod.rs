//! Logged dataset
//!
//! [`LoggedDataset`] wraps a [`DatasetBackend`] and routes every variable
//! write through a [`DeferredLog`]. Writes return as soon as they are
//! logged; the log is replayed into the backend on flush, sync, redef,
//! read, wait and close.
//!
//! # Example
//!
//! ```ignore
//! use stagelog_engine::LoggedDataset;
//!
//! let mut ds = LoggedDataset::create(backend, LogConfig::new().with_log_dir("/bb"))?;
//! let x = ds.define_dimension("x", Some(100))?;
//! let v = ds.define_variable("v", ElementType::Double, &[x])?;
//! ds.enddef()?;
//! ds.put(Selection::range(v, &[0], &[10]), ElementType::Double, &bytes)?;
//! let backend = ds.close()?;
//! ```
//!
//! # Collective operations
//!
//! Anything that may flush (flush, sync, redef, get, wait, close and the
//! mode switches) must be called by every process of the dataset in the
//! same order. Puts never flush.

mod builder;
mod requests;

pub use builder::DatasetBuilder;

use stagelog_core::{
    DatasetBackend, DimId, ElementType, IoMode, LogError, LogResult, RequestId, Selection, Status,
    VarId, WriteCall,
};
use stagelog_durability::{DeferredLog, FlushStats, LogConfig, LogMetrics, RecoveryStats};

/// Keep the first error seen.
fn keep_first(first: &mut Status, status: Status) {
    if first.is_ok() {
        *first = status;
    }
}

/// Split a multi-range payload into one write call per non-empty range.
fn split_ranges<'a>(
    var: VarId,
    starts: &[&'a [u64]],
    counts: &[&'a [u64]],
    elem: ElementType,
    data: &'a [u8],
) -> LogResult<Vec<WriteCall<'a>>> {
    if starts.len() != counts.len() {
        return Err(LogError::InvalidArgument(format!(
            "{} start vectors for {} count vectors",
            starts.len(),
            counts.len()
        )));
    }

    let mut calls = Vec::with_capacity(starts.len());
    let mut off = 0usize;
    for (&start, &count) in starts.iter().zip(counts.iter()) {
        let selection = Selection::range(var, start, count);
        selection.validate()?;
        let len = usize::try_from(selection.payload_len(elem)?).map_err(|_| {
            LogError::InvalidArgument(format!("range {:?} does not fit in memory", count))
        })?;
        if len == 0 {
            continue;
        }
        let end = off.checked_add(len);
        let piece = end.and_then(|end| data.get(off..end)).ok_or_else(|| {
            LogError::InvalidArgument(format!(
                "ranges need more than the {} bytes supplied",
                data.len()
            ))
        })?;
        calls.push(WriteCall::new(selection, elem, piece));
        off += len;
    }
    if off != data.len() {
        return Err(LogError::InvalidArgument(format!(
            "ranges cover {} bytes, {} supplied",
            off,
            data.len()
        )));
    }
    Ok(calls)
}

/// A dataset whose writes are staged in a per-process log.
pub struct LoggedDataset<B: DatasetBackend> {
    backend: B,
    log: DeferredLog,
    mode: IoMode,
    define_mode: bool,
    writable: bool,
    recovered: Option<RecoveryStats>,
}

impl<B: DatasetBackend> LoggedDataset<B> {
    /// Wrap a freshly created dataset, still in define mode.
    ///
    /// The log files are created at the first [`LoggedDataset::enddef`].
    pub fn create(backend: B, config: LogConfig) -> LogResult<Self> {
        config.validate()?;
        tracing::info!(
            path = %backend.path().display(),
            log_dir = %config.log_dir.display(),
            "Created logged dataset"
        );
        Ok(LoggedDataset {
            backend,
            log: DeferredLog::new(config),
            mode: IoMode::Collective,
            define_mode: true,
            writable: true,
            recovered: None,
        })
    }

    /// Wrap an existing dataset in data mode.
    ///
    /// A writable dataset gets its log files immediately; a read-only one
    /// never logs.
    pub fn open(backend: B, config: LogConfig, writable: bool) -> LogResult<Self> {
        config.validate()?;
        let mut log = DeferredLog::new(config);
        if writable {
            log.initialize(&backend)?;
        }
        tracing::info!(
            path = %backend.path().display(),
            writable,
            "Opened logged dataset"
        );
        Ok(LoggedDataset {
            backend,
            log,
            mode: IoMode::Collective,
            define_mode: false,
            writable,
            recovered: None,
        })
    }

    fn require_data_mode(&self) -> LogResult<()> {
        if self.define_mode {
            Err(LogError::InDefineMode)
        } else {
            Ok(())
        }
    }

    fn require_writable(&self) -> LogResult<()> {
        self.require_data_mode()?;
        if self.writable {
            Ok(())
        } else {
            Err(LogError::InvalidArgument("dataset is open read-only".into()))
        }
    }

    // ========================================================================
    // Definition
    // ========================================================================

    /// Define a dimension; `None` makes it the record dimension.
    pub fn define_dimension(&mut self, name: &str, len: Option<u64>) -> LogResult<DimId> {
        if !self.define_mode {
            return Err(LogError::NotInDefineMode);
        }
        self.backend.define_dimension(name, len)
    }

    /// Define a variable.
    pub fn define_variable(&mut self, name: &str, elem: ElementType, dims: &[DimId]) -> LogResult<VarId> {
        if !self.define_mode {
            return Err(LogError::NotInDefineMode);
        }
        let var = self.backend.define_variable(name, elem, dims)?;
        self.log.note_variable_ndims(dims.len())?;
        Ok(var)
    }

    /// Find a variable by name.
    pub fn variable(&self, name: &str) -> Option<VarId> {
        self.backend.lookup_variable(name)
    }

    /// Leave define mode, creating the log files on the first call.
    pub fn enddef(&mut self) -> LogResult<()> {
        if !self.define_mode {
            return Err(LogError::NotInDefineMode);
        }
        self.backend.enddef()?;
        self.define_mode = false;
        if self.writable {
            self.log.initialize(&self.backend)?;
        }
        Ok(())
    }

    /// Re-enter define mode. Collective; flushes the log first.
    pub fn redef(&mut self) -> LogResult<()> {
        self.require_data_mode()?;
        self.flush()?;
        self.backend.redef()?;
        self.define_mode = true;
        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Log a blocking write; returns the payload bytes logged.
    pub fn put(&mut self, selection: Selection<'_>, elem: ElementType, data: &[u8]) -> LogResult<u64> {
        self.require_writable()?;
        let call = WriteCall::new(selection, elem, data);
        self.log.append_write(&self.backend, &self.backend, &call)
    }

    /// Log a write of one element.
    pub fn put_var1(&mut self, var: VarId, index: &[u64], elem: ElementType, data: &[u8]) -> LogResult<u64> {
        let count = vec![1u64; index.len()];
        self.put(Selection::range(var, index, &count), elem, data)
    }

    /// Log a write of a whole variable.
    ///
    /// A record variable covers every record written so far, logged or not.
    pub fn put_var(&mut self, var: VarId, elem: ElementType, data: &[u8]) -> LogResult<u64> {
        let count = self.whole_extent(var)?;
        let start = vec![0u64; count.len()];
        self.put(Selection::range(var, &start, &count), elem, data)
    }

    /// Log a blocking write of several ranges sharing one payload.
    ///
    /// The payload holds the ranges back to back. Ranges are logged one by
    /// one; an error leaves the ranges before it logged.
    pub fn put_varn(
        &mut self,
        var: VarId,
        starts: &[&[u64]],
        counts: &[&[u64]],
        elem: ElementType,
        data: &[u8],
    ) -> LogResult<u64> {
        self.require_writable()?;
        let calls = split_ranges(var, starts, counts, elem, data)?;
        let mut total = 0;
        for call in &calls {
            total += self.log.append_write(&self.backend, &self.backend, call)?;
        }
        Ok(total)
    }

    /// Log a deferred write; complete it with [`LoggedDataset::wait`].
    pub fn iput(&mut self, selection: Selection<'_>, elem: ElementType, data: &[u8]) -> LogResult<RequestId> {
        self.require_writable()?;
        let call = WriteCall::new(selection, elem, data);
        self.log.append_deferred(&self.backend, &self.backend, &[call])
    }

    /// Log a deferred write of several ranges as a single request.
    pub fn iput_varn(
        &mut self,
        var: VarId,
        starts: &[&[u64]],
        counts: &[&[u64]],
        elem: ElementType,
        data: &[u8],
    ) -> LogResult<RequestId> {
        self.require_writable()?;
        let calls = split_ranges(var, starts, counts, elem, data)?;
        self.log.append_deferred(&self.backend, &self.backend, &calls)
    }

    /// Log a buffered write.
    ///
    /// The payload is copied into the log, so buffered and deferred writes
    /// behave the same.
    pub fn bput(&mut self, selection: Selection<'_>, elem: ElementType, data: &[u8]) -> LogResult<RequestId> {
        self.iput(selection, elem, data)
    }

    fn whole_extent(&self, var: VarId) -> LogResult<Vec<u64>> {
        let record = self.backend.record_dimension();
        self.backend
            .variable_dimensions(var)?
            .into_iter()
            .map(|dim| {
                if Some(dim) == record {
                    Ok(self.num_records())
                } else {
                    self.backend.dimension_len(dim)
                }
            })
            .collect()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read a selection. Flushes first unless `flush_on_read` is off.
    pub fn get(&mut self, selection: Selection<'_>, elem: ElementType) -> LogResult<Vec<u8>> {
        self.require_data_mode()?;
        if self.log.config().flush_on_read {
            self.flush()?;
        }
        self.backend.read(&selection, elem, self.mode)
    }

    /// Start a deferred read; its data is available from
    /// [`LoggedDataset::take_read`] once waited on.
    pub fn iget(&mut self, selection: Selection<'_>, elem: ElementType) -> LogResult<RequestId> {
        self.require_data_mode()?;
        Ok(RequestId::Driver(self.backend.iread(&selection, elem)?))
    }

    /// Data of a completed deferred read.
    pub fn take_read(&mut self, id: RequestId) -> Option<Vec<u8>> {
        match id {
            RequestId::Driver(id) => self.backend.take_read(id),
            RequestId::Log(_) => None,
        }
    }

    // ========================================================================
    // Flushing and modes
    // ========================================================================

    /// Replay the log into the backend. Collective.
    pub fn flush(&mut self) -> LogResult<FlushStats> {
        self.log.flush(&mut self.backend, self.mode)
    }

    /// Flush (unless `flush_on_sync` is off) and sync the backend.
    pub fn sync(&mut self) -> LogResult<()> {
        self.require_data_mode()?;
        let mut first: Status = Ok(());
        if self.log.config().flush_on_sync {
            keep_first(&mut first, self.flush().map(|_| ()));
        }
        keep_first(&mut first, self.backend.sync());
        first
    }

    /// Switch to independent data mode.
    ///
    /// Entries already logged are flushed collectively first. A failed
    /// replay is returned after the mode has been switched.
    pub fn begin_indep_data(&mut self) -> LogResult<()> {
        self.require_data_mode()?;
        if self.mode == IoMode::Independent {
            return Err(LogError::InvalidArgument(
                "already in independent data mode".into(),
            ));
        }
        // the flush resets the log even when a replay fails, so the switch
        // goes ahead and the replay error is reported after it
        let flushed = self.flush().map(|_| ());
        self.backend.begin_independent()?;
        self.mode = IoMode::Independent;
        flushed
    }

    /// Switch back to collective data mode.
    ///
    /// Entries logged in independent mode are flushed independently first.
    /// A failed replay is returned after the mode has been switched.
    pub fn end_indep_data(&mut self) -> LogResult<()> {
        self.require_data_mode()?;
        if self.mode == IoMode::Collective {
            return Err(LogError::InvalidArgument(
                "not in independent data mode".into(),
            ));
        }
        // the flush resets the log even when a replay fails, so the switch
        // goes ahead and the replay error is reported after it
        let flushed = self.flush().map(|_| ());
        self.backend.end_independent()?;
        self.mode = IoMode::Collective;
        flushed
    }

    // ========================================================================
    // Inquiry
    // ========================================================================

    /// Payload bytes logged and not yet replayed.
    pub fn pending_put_bytes(&self) -> u64 {
        self.log.pending_bytes()
    }

    /// Outstanding deferred writes.
    pub fn pending_requests(&self) -> usize {
        self.log.pending_requests()
    }

    /// Outstanding deferred reads.
    pub fn pending_gets(&self) -> usize {
        self.backend.pending_requests().len()
    }

    /// Number of records, counting records only written to the log.
    pub fn num_records(&self) -> u64 {
        self.backend.num_records().max(self.log.record_extent())
    }

    /// Effective log settings as hint key/value pairs.
    pub fn export_hints(&self) -> Vec<(String, String)> {
        self.log.config().export_hints()
    }

    /// Snapshot of the log counters.
    pub fn metrics(&self) -> LogMetrics {
        self.log.metrics()
    }

    /// Log settings.
    pub fn config(&self) -> &LogConfig {
        self.log.config()
    }

    /// Current data mode.
    pub fn io_mode(&self) -> IoMode {
        self.mode
    }

    /// Whether the dataset is in define mode.
    pub fn is_define_mode(&self) -> bool {
        self.define_mode
    }

    /// Whether writes are accepted.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Outcome of replaying a leftover log when the dataset was opened.
    pub fn recovered(&self) -> Option<&RecoveryStats> {
        self.recovered.as_ref()
    }

    /// The per-process log.
    pub fn log(&self) -> &DeferredLog {
        &self.log
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the wrapped backend; writes made through it bypass
    /// the log.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Flush, close the log and the backend; returns the backend.
    ///
    /// Collective. Every step runs even if an earlier one failed; the first
    /// error is returned. Log files are kept when the final flush fails.
    pub fn close(mut self) -> LogResult<B> {
        let mut first: Status = Ok(());
        if self.define_mode {
            keep_first(&mut first, self.enddef());
        }

        let LoggedDataset {
            mut backend,
            log,
            mode,
            ..
        } = self;
        let metrics = log.metrics();
        keep_first(&mut first, log.close(&mut backend, mode));
        keep_first(&mut first, backend.close());

        tracing::info!(
            path = %backend.path().display(),
            entries = metrics.entries_logged,
            data_bytes = metrics.data_bytes,
            flushes = metrics.flushes,
            ok = first.is_ok(),
            "Closed logged dataset"
        );
        first.map(|_| backend)
    }

    /// Close without replaying the log, keeping its files for recovery, and
    /// abort the backend.
    pub fn abort(self) -> LogResult<B> {
        let LoggedDataset {
            mut backend, log, ..
        } = self;
        let mut first: Status = Ok(());
        keep_first(&mut first, log.abandon());
        keep_first(&mut first, backend.abort());
        first.map(|_| backend)
    }
}
