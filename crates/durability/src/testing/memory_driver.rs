//! In-memory dataset used as base driver in tests

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use stagelog_core::{
    BaseDriver, DatasetBackend, DatasetCatalog, DimId, ElementType, IoMode, LogError, LogResult,
    Selection, Status, VarId, WriteCall,
};

/// Error code reported for injected write failures.
pub const INJECTED_FAILURE: i32 = -1000;

const EINVALCOORDS: i32 = -40;
const ENOTVAR: i32 = -49;
const EBADTYPE: i32 = -45;
const EBADID: i32 = -33;

/// Shape and payload of a write the driver received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    /// Target variable
    pub var: VarId,
    /// Start indices
    pub start: Vec<u64>,
    /// Counts
    pub count: Vec<u64>,
    /// Strides, for strided writes
    pub stride: Option<Vec<u64>>,
    /// Payload bytes
    pub len: usize,
}

impl RecordedWrite {
    fn from_call(call: &WriteCall<'_>) -> Self {
        RecordedWrite {
            var: call.selection.var,
            start: call.selection.start.to_vec(),
            count: call.selection.count.to_vec(),
            stride: call.selection.stride.map(<[u64]>::to_vec),
            len: call.data.len(),
        }
    }
}

/// Calls received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    /// Blocking write
    Write(RecordedWrite, IoMode),
    /// Non-blocking write and the id handed out
    IWrite(u64, RecordedWrite),
    /// Wait on the listed ids
    Wait(Vec<u64>, IoMode),
    /// Blocking read of a variable
    Read(VarId),
    /// Non-blocking read and the id handed out
    IRead(u64, VarId),
    /// Cancellation of the listed ids
    Cancel(Vec<u64>),
    /// Define mode left
    Enddef,
    /// Define mode re-entered
    Redef,
    /// Sync
    Sync,
    /// Switch to independent mode
    BeginIndependent,
    /// Switch to collective mode
    EndIndependent,
    /// Close
    Close,
    /// Abort
    Abort,
}

#[derive(Debug, Clone)]
struct Dimension {
    name: String,
    /// `None` for the record dimension
    len: Option<u64>,
}

#[derive(Debug, Clone)]
struct Variable {
    name: String,
    elem: ElementType,
    dims: Vec<DimId>,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct OwnedSelection {
    var: VarId,
    start: Vec<u64>,
    count: Vec<u64>,
    stride: Option<Vec<u64>>,
}

impl OwnedSelection {
    fn from_selection(selection: &Selection<'_>) -> Self {
        OwnedSelection {
            var: selection.var,
            start: selection.start.to_vec(),
            count: selection.count.to_vec(),
            stride: selection.stride.map(<[u64]>::to_vec),
        }
    }

    fn as_selection(&self) -> Selection<'_> {
        Selection {
            var: self.var,
            start: &self.start,
            count: &self.count,
            stride: self.stride.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
enum Pending {
    Write {
        selection: OwnedSelection,
        elem: ElementType,
        data: Vec<u8>,
    },
    Read {
        selection: OwnedSelection,
        elem: ElementType,
    },
}

/// A dataset held entirely in memory.
///
/// Variables are stored row-major; the record dimension, when present, must
/// be a variable's outermost dimension and grows as records are written.
/// Non-blocking writes are applied when waited on, in the order they were
/// issued.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    path: PathBuf,
    handle: i32,
    rank: u32,
    num_procs: u32,
    define_mode: bool,
    dims: Vec<Dimension>,
    vars: Vec<Variable>,
    num_records: u64,
    next_request: u64,
    pending: BTreeMap<u64, Pending>,
    completed_reads: BTreeMap<u64, Vec<u8>>,
    failing: HashSet<VarId>,
    calls: Vec<DriverCall>,
}

impl MemoryDriver {
    /// Empty dataset at `path`, in define mode, rank 0 of 1.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MemoryDriver {
            path: path.into(),
            handle: 0,
            rank: 0,
            num_procs: 1,
            define_mode: true,
            dims: Vec::new(),
            vars: Vec::new(),
            num_records: 0,
            next_request: 1,
            pending: BTreeMap::new(),
            completed_reads: BTreeMap::new(),
            failing: HashSet::new(),
            calls: Vec::new(),
        }
    }

    /// Set the dataset handle.
    pub fn with_handle(mut self, handle: i32) -> Self {
        self.handle = handle;
        self
    }

    /// Set this process's rank and the process count.
    pub fn with_rank(mut self, rank: u32, num_procs: u32) -> Self {
        self.rank = rank;
        self.num_procs = num_procs;
        self
    }

    /// Make every write to `var` fail with [`INJECTED_FAILURE`].
    pub fn fail_writes_to(&mut self, var: VarId) {
        self.failing.insert(var);
    }

    /// Stop injecting failures.
    pub fn clear_failures(&mut self) {
        self.failing.clear();
    }

    /// Calls received so far.
    pub fn calls(&self) -> &[DriverCall] {
        &self.calls
    }

    /// Forget the recorded calls.
    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Blocking and non-blocking writes received so far.
    pub fn writes(&self) -> Vec<&RecordedWrite> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                DriverCall::Write(w, _) | DriverCall::IWrite(_, w) => Some(w),
                _ => None,
            })
            .collect()
    }

    /// Whether the dataset is in define mode.
    pub fn in_define_mode(&self) -> bool {
        self.define_mode
    }

    /// Whole contents of `var`.
    pub fn contents(&self, var: VarId) -> LogResult<&[u8]> {
        Ok(&self.variable(var)?.data)
    }

    /// Read a selection without recording the call.
    pub fn peek(&self, selection: &Selection<'_>) -> LogResult<Vec<u8>> {
        selection.validate()?;
        let var = self.variable(selection.var)?;
        let size = var.elem.size();
        let offsets = self.element_offsets(selection, false)?;
        let mut out = Vec::with_capacity(offsets.len() * size);
        for off in offsets {
            out.extend_from_slice(&var.data[off..off + size]);
        }
        Ok(out)
    }

    fn variable(&self, var: VarId) -> LogResult<&Variable> {
        self.vars.get(var.0 as usize).ok_or_else(|| LogError::Driver {
            code: ENOTVAR,
            message: format!("{} not defined", var),
        })
    }

    fn is_record(&self, dim: DimId) -> bool {
        self.dims
            .get(dim.0 as usize)
            .map_or(false, |d| d.len.is_none())
    }

    fn shape(&self, var: &Variable, records: u64) -> Vec<u64> {
        var.dims
            .iter()
            .map(|d| self.dims[d.0 as usize].len.unwrap_or(records))
            .collect()
    }

    fn record_len(&self, var: &Variable) -> usize {
        let inner: u64 = self.shape(var, 1).iter().product();
        inner as usize * var.elem.size()
    }

    fn grow_records(&mut self, records: u64) {
        if records <= self.num_records {
            return;
        }
        for i in 0..self.vars.len() {
            let var = &self.vars[i];
            if var.dims.first().map_or(false, |d| self.is_record(*d)) {
                let len = self.record_len(var) * records as usize;
                self.vars[i].data.resize(len, 0);
            }
        }
        self.num_records = records;
    }

    /// Byte offsets of every element a selection addresses, in row-major
    /// order. With `grow`, record indices past the current end are allowed.
    fn element_offsets(&self, selection: &Selection<'_>, grow: bool) -> LogResult<Vec<usize>> {
        let var = self.variable(selection.var)?;
        if selection.ndims() != var.dims.len() {
            return Err(LogError::InvalidArgument(format!(
                "{} has {} dimensions, selection {}",
                selection.var,
                var.dims.len(),
                selection.ndims()
            )));
        }
        let total = selection.element_count()?;
        if total == 0 {
            return Ok(Vec::new());
        }

        let reach = self.reach(selection)?;
        let records = match var.dims.first() {
            Some(d) if grow && self.is_record(*d) => reach[0].max(self.num_records),
            _ => self.num_records,
        };
        let shape = self.shape(var, records);
        for (d, (&last, &len)) in reach.iter().zip(shape.iter()).enumerate() {
            if last > len {
                return Err(LogError::Driver {
                    code: EINVALCOORDS,
                    message: format!(
                        "{} dimension {} reaches index {} of {}",
                        selection.var,
                        d,
                        last - 1,
                        len
                    ),
                });
            }
        }

        let size = var.elem.size();
        let mut pitch = vec![size; shape.len()];
        for d in (0..shape.len().saturating_sub(1)).rev() {
            pitch[d] = pitch[d + 1] * shape[d + 1] as usize;
        }

        let ndims = selection.ndims();
        let mut idx = vec![0u64; ndims];
        let mut offsets = Vec::with_capacity(total as usize);
        loop {
            let mut off = 0usize;
            for d in 0..ndims {
                let step = selection.stride.map_or(1, |s| s[d]);
                off += (selection.start[d] + idx[d] * step) as usize * pitch[d];
            }
            offsets.push(off);

            let mut d = ndims;
            loop {
                if d == 0 {
                    return Ok(offsets);
                }
                d -= 1;
                idx[d] += 1;
                if idx[d] < selection.count[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
    }

    /// One past the last index touched along each dimension.
    fn reach(&self, selection: &Selection<'_>) -> LogResult<Vec<u64>> {
        (0..selection.ndims()).map(|d| selection.end(d)).collect()
    }

    fn apply_write(&mut self, call: &WriteCall<'_>) -> LogResult<()> {
        if self.define_mode {
            return Err(LogError::InDefineMode);
        }
        call.validate()?;
        let var = call.selection.var;
        let elem = self.variable(var)?.elem;
        if elem.size() != call.elem.size() {
            return Err(LogError::Driver {
                code: EBADTYPE,
                message: format!("{} holds {}, write supplies {}", var, elem, call.elem),
            });
        }
        if self.failing.contains(&var) {
            return Err(LogError::Driver {
                code: INJECTED_FAILURE,
                message: format!("injected write failure on {}", var),
            });
        }

        let offsets = self.element_offsets(&call.selection, true)?;
        if let Some(first) = self.variable(var)?.dims.first() {
            if self.is_record(*first) && !offsets.is_empty() {
                let reach = self.reach(&call.selection)?[0];
                self.grow_records(reach);
            }
        }
        let size = elem.size();
        let data = &mut self.vars[var.0 as usize].data;
        for (k, off) in offsets.into_iter().enumerate() {
            data[off..off + size].copy_from_slice(&call.data[k * size..(k + 1) * size]);
        }
        Ok(())
    }

    fn complete(&mut self, id: u64) -> Status {
        match self.pending.remove(&id) {
            Some(Pending::Write {
                selection,
                elem,
                data,
            }) => {
                let call = WriteCall::new(selection.as_selection(), elem, &data);
                self.apply_write(&call)
            }
            Some(Pending::Read { selection, elem }) => {
                let bytes = self.checked_read(&selection.as_selection(), elem)?;
                self.completed_reads.insert(id, bytes);
                Ok(())
            }
            None => Err(LogError::Driver {
                code: EBADID,
                message: format!("no pending request {}", id),
            }),
        }
    }

    fn checked_read(&self, selection: &Selection<'_>, elem: ElementType) -> LogResult<Vec<u8>> {
        if self.define_mode {
            return Err(LogError::InDefineMode);
        }
        let stored = self.variable(selection.var)?.elem;
        if stored.size() != elem.size() {
            return Err(LogError::Driver {
                code: EBADTYPE,
                message: format!("{} holds {}, read expects {}", selection.var, stored, elem),
            });
        }
        self.peek(selection)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        id
    }
}

impl BaseDriver for MemoryDriver {
    fn inquire_variable(&self, var: VarId) -> LogResult<usize> {
        Ok(self.variable(var)?.dims.len())
    }

    fn write(&mut self, call: &WriteCall<'_>, mode: IoMode) -> LogResult<()> {
        self.calls
            .push(DriverCall::Write(RecordedWrite::from_call(call), mode));
        self.apply_write(call)
    }

    fn iwrite(&mut self, call: &WriteCall<'_>) -> LogResult<u64> {
        if self.define_mode {
            return Err(LogError::InDefineMode);
        }
        call.validate()?;
        self.variable(call.selection.var)?;
        let id = self.next_id();
        self.calls
            .push(DriverCall::IWrite(id, RecordedWrite::from_call(call)));
        self.pending.insert(
            id,
            Pending::Write {
                selection: OwnedSelection::from_selection(&call.selection),
                elem: call.elem,
                data: call.data.to_vec(),
            },
        );
        Ok(id)
    }

    fn wait(&mut self, ids: &[u64], mode: IoMode) -> LogResult<Vec<Status>> {
        self.calls.push(DriverCall::Wait(ids.to_vec(), mode));
        let mut order: Vec<usize> = (0..ids.len()).collect();
        order.sort_by_key(|&i| ids[i]);
        let mut statuses: Vec<Status> = vec![Ok(()); ids.len()];
        for i in order {
            statuses[i] = self.complete(ids[i]);
        }
        Ok(statuses)
    }
}

impl DatasetCatalog for MemoryDriver {
    fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> i32 {
        self.handle
    }

    fn rank(&self) -> u32 {
        self.rank
    }

    fn num_procs(&self) -> u32 {
        self.num_procs
    }

    fn define_dimension(&mut self, name: &str, len: Option<u64>) -> LogResult<DimId> {
        if !self.define_mode {
            return Err(LogError::NotInDefineMode);
        }
        if self.dims.iter().any(|d| d.name == name) {
            return Err(LogError::InvalidArgument(format!(
                "dimension {} already defined",
                name
            )));
        }
        if len.is_none() && self.record_dimension().is_some() {
            return Err(LogError::InvalidArgument(
                "only one record dimension is allowed".into(),
            ));
        }
        self.dims.push(Dimension {
            name: name.to_string(),
            len,
        });
        Ok(DimId(self.dims.len() as u32 - 1))
    }

    fn define_variable(&mut self, name: &str, elem: ElementType, dims: &[DimId]) -> LogResult<VarId> {
        if !self.define_mode {
            return Err(LogError::NotInDefineMode);
        }
        if self.lookup_variable(name).is_some() {
            return Err(LogError::InvalidArgument(format!(
                "variable {} already defined",
                name
            )));
        }
        for (i, dim) in dims.iter().enumerate() {
            if dim.0 as usize >= self.dims.len() {
                return Err(LogError::InvalidArgument(format!(
                    "dimension {} not defined",
                    dim.0
                )));
            }
            if i > 0 && self.is_record(*dim) {
                return Err(LogError::InvalidArgument(
                    "the record dimension must be outermost".into(),
                ));
            }
        }

        let mut var = Variable {
            name: name.to_string(),
            elem,
            dims: dims.to_vec(),
            data: Vec::new(),
        };
        let len = if dims.first().map_or(false, |d| self.is_record(*d)) {
            self.record_len(&var) * self.num_records as usize
        } else {
            self.shape(&var, 0).iter().product::<u64>() as usize * elem.size()
        };
        var.data = vec![0u8; len];
        self.vars.push(var);
        Ok(VarId(self.vars.len() as u32 - 1))
    }

    fn lookup_variable(&self, name: &str) -> Option<VarId> {
        self.vars
            .iter()
            .position(|v| v.name == name)
            .map(|i| VarId(i as u32))
    }

    fn variable_dimensions(&self, var: VarId) -> LogResult<Vec<DimId>> {
        Ok(self.variable(var)?.dims.clone())
    }

    fn dimension_len(&self, dim: DimId) -> LogResult<u64> {
        let d = self.dims.get(dim.0 as usize).ok_or_else(|| {
            LogError::InvalidArgument(format!("dimension {} not defined", dim.0))
        })?;
        Ok(d.len.unwrap_or(self.num_records))
    }

    fn record_dimension(&self) -> Option<DimId> {
        self.dims
            .iter()
            .position(|d| d.len.is_none())
            .map(|i| DimId(i as u32))
    }
}

impl DatasetBackend for MemoryDriver {
    fn read(&mut self, selection: &Selection<'_>, elem: ElementType, _mode: IoMode) -> LogResult<Vec<u8>> {
        self.calls.push(DriverCall::Read(selection.var));
        self.checked_read(selection, elem)
    }

    fn iread(&mut self, selection: &Selection<'_>, elem: ElementType) -> LogResult<u64> {
        if self.define_mode {
            return Err(LogError::InDefineMode);
        }
        selection.validate()?;
        self.variable(selection.var)?;
        let id = self.next_id();
        self.calls.push(DriverCall::IRead(id, selection.var));
        self.pending.insert(
            id,
            Pending::Read {
                selection: OwnedSelection::from_selection(selection),
                elem,
            },
        );
        Ok(id)
    }

    fn take_read(&mut self, id: u64) -> Option<Vec<u8>> {
        self.completed_reads.remove(&id)
    }

    fn cancel(&mut self, ids: &[u64]) -> LogResult<Vec<Status>> {
        self.calls.push(DriverCall::Cancel(ids.to_vec()));
        Ok(ids
            .iter()
            .map(|id| match self.pending.remove(id) {
                Some(_) => Ok(()),
                None => Err(LogError::Driver {
                    code: EBADID,
                    message: format!("no pending request {}", id),
                }),
            })
            .collect())
    }

    fn pending_requests(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }

    fn enddef(&mut self) -> LogResult<()> {
        if !self.define_mode {
            return Err(LogError::NotInDefineMode);
        }
        self.calls.push(DriverCall::Enddef);
        self.define_mode = false;
        Ok(())
    }

    fn redef(&mut self) -> LogResult<()> {
        if self.define_mode {
            return Err(LogError::InDefineMode);
        }
        self.calls.push(DriverCall::Redef);
        self.define_mode = true;
        Ok(())
    }

    fn sync(&mut self) -> LogResult<()> {
        self.calls.push(DriverCall::Sync);
        Ok(())
    }

    fn begin_independent(&mut self) -> LogResult<()> {
        self.calls.push(DriverCall::BeginIndependent);
        Ok(())
    }

    fn end_independent(&mut self) -> LogResult<()> {
        self.calls.push(DriverCall::EndIndependent);
        Ok(())
    }

    fn num_records(&self) -> u64 {
        self.num_records
    }

    fn close(&mut self) -> LogResult<()> {
        self.calls.push(DriverCall::Close);
        self.pending.clear();
        Ok(())
    }

    fn abort(&mut self) -> LogResult<()> {
        self.calls.push(DriverCall::Abort);
        self.pending.clear();
        Ok(())
    }
}
