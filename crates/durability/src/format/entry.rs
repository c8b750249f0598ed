//! Metadata log entry.
//!
//! # Layout
//!
//! ```text
//! offset  size  field
//!      0     8  entry size (this entry, in bytes)
//!      8     4  write kind tag
//!     12     4  element type tag
//!     16     4  variable id
//!     20     4  ndims (d)
//!     24     8  data_off (relative to the first payload byte)
//!     32     8  data_len
//!     40   8*d  start
//!  40+8d   8*d  count
//! 40+16d   8*d  stride (zero unless the kind is strided)
//! ```

use byteorder::{ByteOrder, NativeEndian};
use smallvec::SmallVec;
use stagelog_core::{ElementType, LogError, LogResult, Selection, VarId, WriteCall, WriteKind};

/// Size of an entry without its index arrays.
pub const ENTRY_FIXED_SIZE: usize = 40;

/// Per-dimension index array.
pub type Dims = SmallVec<[u64; 4]>;

/// Encoded size of an entry with `ndims` dimensions.
pub fn entry_size(ndims: usize) -> usize {
    ENTRY_FIXED_SIZE + 3 * ndims * 8
}

/// One logged write call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// How the write addresses the variable
    pub kind: WriteKind,
    /// Element type of the payload
    pub elem: ElementType,
    /// Target variable
    pub var: VarId,
    /// Payload offset, relative to the first payload byte of the data log
    pub data_off: u64,
    /// Payload length
    pub data_len: u64,
    /// First index per dimension
    pub start: Dims,
    /// Extent per dimension
    pub count: Dims,
    /// Step per dimension; all zero unless `kind` is strided
    pub stride: Dims,
}

impl LogEntry {
    /// Describe `call` as an entry whose payload lives at `data_off`.
    pub fn from_call(call: &WriteCall<'_>, data_off: u64) -> Self {
        let sel = &call.selection;
        let stride = match sel.stride {
            Some(s) => Dims::from_slice(s),
            None => Dims::from_elem(0, sel.ndims()),
        };
        LogEntry {
            kind: sel.kind(),
            elem: call.elem,
            var: sel.var,
            data_off,
            data_len: call.data.len() as u64,
            start: Dims::from_slice(sel.start),
            count: Dims::from_slice(sel.count),
            stride,
        }
    }

    /// Number of dimensions.
    pub fn ndims(&self) -> usize {
        self.start.len()
    }

    /// Encoded size of this entry.
    pub fn encoded_len(&self) -> usize {
        entry_size(self.ndims())
    }

    /// The selection this entry replays.
    pub fn selection(&self) -> Selection<'_> {
        Selection {
            var: self.var,
            start: self.start.as_slice(),
            count: self.count.as_slice(),
            stride: if self.kind.has_stride() {
                Some(self.stride.as_slice())
            } else {
                None
            },
        }
    }

    /// Serialize into `out`, which must be exactly [`LogEntry::encoded_len`] bytes.
    pub fn encode_into(&self, out: &mut [u8]) {
        let d = self.ndims();
        debug_assert_eq!(out.len(), entry_size(d));
        NativeEndian::write_u64(&mut out[0..], entry_size(d) as u64);
        NativeEndian::write_u32(&mut out[8..], self.kind.log_tag());
        NativeEndian::write_u32(&mut out[12..], self.elem.log_tag());
        NativeEndian::write_u32(&mut out[16..], self.var.0);
        NativeEndian::write_u32(&mut out[20..], d as u32);
        NativeEndian::write_u64(&mut out[24..], self.data_off);
        NativeEndian::write_u64(&mut out[32..], self.data_len);

        let arrays = [&self.start, &self.count, &self.stride];
        for (a, values) in arrays.iter().enumerate() {
            let base = ENTRY_FIXED_SIZE + a * d * 8;
            NativeEndian::write_u64_into(values, &mut out[base..base + d * 8]);
        }
    }

    /// Serialize into a fresh vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.encoded_len()];
        self.encode_into(&mut out);
        out
    }

    /// Read the entry size field without decoding the rest.
    pub fn peek_size(bytes: &[u8]) -> LogResult<usize> {
        if bytes.len() < 8 {
            return Err(LogError::CorruptLog("truncated metadata entry".into()));
        }
        Ok(NativeEndian::read_u64(bytes) as usize)
    }

    /// Deserialize the entry at the start of `bytes`.
    ///
    /// Returns the entry and the number of bytes it occupies.
    pub fn decode(bytes: &[u8]) -> LogResult<(Self, usize)> {
        if bytes.len() < ENTRY_FIXED_SIZE {
            return Err(LogError::CorruptLog(format!(
                "metadata entry needs {} bytes, {} remain",
                ENTRY_FIXED_SIZE,
                bytes.len()
            )));
        }

        let esize = NativeEndian::read_u64(&bytes[0..]) as usize;
        let d = NativeEndian::read_u32(&bytes[20..]) as usize;
        if esize != entry_size(d) {
            return Err(LogError::CorruptLog(format!(
                "entry size {} does not match {} dimensions",
                esize, d
            )));
        }
        if bytes.len() < esize {
            return Err(LogError::CorruptLog(format!(
                "metadata entry of {} bytes is truncated to {}",
                esize,
                bytes.len()
            )));
        }

        let kind_tag = NativeEndian::read_u32(&bytes[8..]);
        let kind = WriteKind::from_log_tag(kind_tag)
            .ok_or_else(|| LogError::CorruptLog(format!("unknown write kind {}", kind_tag)))?;
        let elem_tag = NativeEndian::read_u32(&bytes[12..]);
        let elem = ElementType::from_log_tag(elem_tag)
            .ok_or_else(|| LogError::CorruptLog(format!("unknown element type {}", elem_tag)))?;

        let read_dims = |a: usize| -> Dims {
            let base = ENTRY_FIXED_SIZE + a * d * 8;
            bytes[base..base + d * 8]
                .chunks_exact(8)
                .map(NativeEndian::read_u64)
                .collect()
        };

        let entry = LogEntry {
            kind,
            elem,
            var: VarId(NativeEndian::read_u32(&bytes[16..])),
            data_off: NativeEndian::read_u64(&bytes[24..]),
            data_len: NativeEndian::read_u64(&bytes[32..]),
            start: read_dims(0),
            count: read_dims(1),
            stride: read_dims(2),
        };
        Ok((entry, esize))
    }
}
