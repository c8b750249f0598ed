//! Contracts between the log and the world around it
//!
//! The log needs exactly two collaborators:
//! - [`BaseDriver`]: the storage driver that performs the real writes
//! - [`DatasetCatalog`]: the dataset's schema and process-wide properties
//!
//! Nothing else of the surrounding dataset library is visible to the log.
//! [`DatasetBackend`] bundles both with the operations the dataset facade
//! forwards without logging.

use std::path::Path;

use crate::error::{LogError, LogResult, Status};
use crate::types::{DimId, ElementType, IoMode, VarId, WriteKind};

/// The hyperslab a call addresses within one variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection<'a> {
    /// Target variable
    pub var: VarId,
    /// First index along each dimension
    pub start: &'a [u64],
    /// Number of elements along each dimension
    pub count: &'a [u64],
    /// Step along each dimension; `None` means contiguous
    pub stride: Option<&'a [u64]>,
}

impl<'a> Selection<'a> {
    /// Contiguous range selection.
    pub fn range(var: VarId, start: &'a [u64], count: &'a [u64]) -> Self {
        Selection {
            var,
            start,
            count,
            stride: None,
        }
    }

    /// Strided selection.
    pub fn strided(var: VarId, start: &'a [u64], count: &'a [u64], stride: &'a [u64]) -> Self {
        Selection {
            var,
            start,
            count,
            stride: Some(stride),
        }
    }

    /// Number of dimensions addressed.
    pub fn ndims(&self) -> usize {
        self.start.len()
    }

    /// Total number of elements selected.
    ///
    /// Fails with [`LogError::InvalidArgument`] if the product of the counts
    /// does not fit in 64 bits.
    pub fn element_count(&self) -> LogResult<u64> {
        self.count
            .iter()
            .try_fold(1u64, |n, &c| n.checked_mul(c))
            .ok_or_else(|| {
                LogError::InvalidArgument(format!("element count {:?} overflows", self.count))
            })
    }

    /// Bytes needed for the selection at `elem` per element.
    pub fn payload_len(&self, elem: ElementType) -> LogResult<u64> {
        self.element_count()?
            .checked_mul(elem.size() as u64)
            .ok_or_else(|| {
                LogError::InvalidArgument(format!(
                    "payload of {:?} {} elements overflows",
                    self.count, elem
                ))
            })
    }

    /// One past the last index touched along dimension `d`, or `start[d]`
    /// when nothing is selected along it.
    pub fn end(&self, d: usize) -> LogResult<u64> {
        let start = self.start[d];
        let count = self.count[d];
        if count == 0 {
            return Ok(start);
        }
        let step = self.stride.map_or(1, |s| s[d]);
        (count - 1)
            .checked_mul(step)
            .and_then(|span| start.checked_add(span))
            .and_then(|last| last.checked_add(1))
            .ok_or_else(|| {
                LogError::InvalidArgument(format!(
                    "selection along dimension {} overflows: start {}, count {}, stride {}",
                    d, start, count, step
                ))
            })
    }

    /// Write kind a log entry for this selection carries.
    pub fn kind(&self) -> WriteKind {
        if self.stride.is_some() {
            WriteKind::Strided
        } else {
            WriteKind::Range
        }
    }

    /// Check that start/count/stride agree on dimensionality.
    pub fn validate(&self) -> LogResult<()> {
        if self.count.len() != self.start.len() {
            return Err(LogError::InvalidArgument(format!(
                "start has {} dimensions but count has {}",
                self.start.len(),
                self.count.len()
            )));
        }
        if let Some(stride) = self.stride {
            if stride.len() != self.start.len() {
                return Err(LogError::InvalidArgument(format!(
                    "start has {} dimensions but stride has {}",
                    self.start.len(),
                    stride.len()
                )));
            }
            if stride.iter().any(|&s| s == 0) {
                return Err(LogError::InvalidArgument("stride must be positive".into()));
            }
        }
        for d in 0..self.ndims() {
            self.end(d)?;
        }
        self.element_count()?;
        Ok(())
    }
}

/// A write call as issued to the base driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCall<'a> {
    /// Where the data goes
    pub selection: Selection<'a>,
    /// Element type of `data`
    pub elem: ElementType,
    /// Packed elements in row-major order
    pub data: &'a [u8],
}

impl<'a> WriteCall<'a> {
    /// Create a write call.
    pub fn new(selection: Selection<'a>, elem: ElementType, data: &'a [u8]) -> Self {
        WriteCall {
            selection,
            elem,
            data,
        }
    }

    /// Payload size implied by the selection and element type.
    pub fn expected_len(&self) -> LogResult<u64> {
        self.selection.payload_len(self.elem)
    }

    /// Validate dimensionality and payload length.
    pub fn validate(&self) -> LogResult<()> {
        self.selection.validate()?;
        let expected = self.expected_len()?;
        if self.data.len() as u64 != expected {
            return Err(LogError::InvalidArgument(format!(
                "payload is {} bytes but selection of {:?} {} elements needs {}",
                self.data.len(),
                self.selection.count,
                self.elem,
                expected
            )));
        }
        Ok(())
    }
}

/// Storage driver the log replays into.
///
/// Collective calls (`write` and `wait` in [`IoMode::Collective`]) must be
/// entered by every process of the dataset in the same order.
pub trait BaseDriver {
    /// Number of dimensions of a variable.
    fn inquire_variable(&self, var: VarId) -> LogResult<usize>;

    /// Blocking write.
    fn write(&mut self, call: &WriteCall<'_>, mode: IoMode) -> LogResult<()>;

    /// Non-blocking write; the data is copied before returning.
    ///
    /// Returns the driver's request id.
    fn iwrite(&mut self, call: &WriteCall<'_>) -> LogResult<u64>;

    /// Complete the given requests, returning one status per id.
    ///
    /// An `Err` return means the wait itself failed; per-request failures
    /// are reported through the returned statuses.
    fn wait(&mut self, ids: &[u64], mode: IoMode) -> LogResult<Vec<Status>>;
}

/// Schema and process-wide properties of the dataset being logged.
pub trait DatasetCatalog {
    /// Path of the dataset file.
    fn path(&self) -> &Path;

    /// Numeric handle of the open dataset.
    fn handle(&self) -> i32;

    /// Rank of this process.
    fn rank(&self) -> u32;

    /// Number of processes sharing the dataset.
    fn num_procs(&self) -> u32;

    /// Define a dimension; `None` length makes it the record dimension.
    fn define_dimension(&mut self, name: &str, len: Option<u64>) -> LogResult<DimId>;

    /// Define a variable over previously defined dimensions.
    fn define_variable(&mut self, name: &str, elem: ElementType, dims: &[DimId])
        -> LogResult<VarId>;

    /// Find a variable by name.
    fn lookup_variable(&self, name: &str) -> Option<VarId>;

    /// Dimensions of a variable, outermost first.
    fn variable_dimensions(&self, var: VarId) -> LogResult<Vec<DimId>>;

    /// Current length of a dimension; for the record dimension, the number
    /// of records written so far.
    fn dimension_len(&self, dim: DimId) -> LogResult<u64>;

    /// The growable dimension, if one is defined.
    fn record_dimension(&self) -> Option<DimId>;

    /// Block until every process of the dataset has reached this point.
    ///
    /// Only needed when processes share one data log; a single-process
    /// catalog can rely on the default.
    fn barrier(&self) -> LogResult<()> {
        Ok(())
    }
}

/// The full dataset surface a logging layer sits on top of.
///
/// The log itself only needs [`BaseDriver`] and [`DatasetCatalog`]; the rest
/// is forwarded by the dataset facade (reads, mode switches, sync, close).
pub trait DatasetBackend: BaseDriver + DatasetCatalog {
    /// Blocking read of a selection.
    fn read(&mut self, selection: &Selection<'_>, elem: ElementType, mode: IoMode)
        -> LogResult<Vec<u8>>;

    /// Non-blocking read; data is available through [`DatasetBackend::take_read`]
    /// once the request has been waited on.
    fn iread(&mut self, selection: &Selection<'_>, elem: ElementType) -> LogResult<u64>;

    /// Data of a completed non-blocking read.
    fn take_read(&mut self, id: u64) -> Option<Vec<u8>>;

    /// Cancel driver requests, returning one status per id.
    fn cancel(&mut self, ids: &[u64]) -> LogResult<Vec<Status>>;

    /// Ids of driver requests not yet waited on.
    fn pending_requests(&self) -> Vec<u64>;

    /// Leave define mode.
    fn enddef(&mut self) -> LogResult<()>;

    /// Re-enter define mode.
    fn redef(&mut self) -> LogResult<()>;

    /// Make written data visible to other processes.
    fn sync(&mut self) -> LogResult<()>;

    /// Switch to independent data mode.
    fn begin_independent(&mut self) -> LogResult<()>;

    /// Switch back to collective data mode.
    fn end_independent(&mut self) -> LogResult<()>;

    /// Current length of the record dimension.
    fn num_records(&self) -> u64;

    /// Close the dataset.
    fn close(&mut self) -> LogResult<()>;

    /// Close the dataset without completing pending work.
    fn abort(&mut self) -> LogResult<()>;
}
