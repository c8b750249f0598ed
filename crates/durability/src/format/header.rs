//! Metadata log header.
//!
//! # Layout
//!
//! ```text
//! offset  size  field
//!      0     8  magic "STAGELOG"
//!      8     8  dataset format tag
//!     16     4  big-endian flag
//!     20     4  external-representation flag
//!     24     8  process count
//!     32     8  rank of the writing process
//!     40     8  entry_begin (offset of the first entry)
//!     48     8  max_ndims
//!     56     8  num_entries (commit counter)
//!     64     4  dataset path length
//!     68     n  dataset path, zero padded to a multiple of 4
//! ```

use byteorder::{ByteOrder, NativeEndian};
use stagelog_core::{LogError, LogResult};

/// Magic bytes opening the metadata log.
pub const LOG_MAGIC: [u8; 8] = *b"STAGELOG";

/// Magic bytes opening the data log.
pub const DATA_LOG_MAGIC: [u8; 8] = *b"STAGEDAT";

/// Tag of the dataset file format the log replays into.
pub const FORMAT_TAG: [u8; 8] = *b"CDF0\0\0\0\0";

/// Size of the header without the dataset path.
pub const HEADER_FIXED_SIZE: usize = 68;

const FORMAT_OFFSET: usize = 8;
const BIG_ENDIAN_OFFSET: usize = 16;
const EXTERNAL_OFFSET: usize = 20;
const NUM_PROCS_OFFSET: usize = 24;
const RANK_OFFSET: usize = 32;
const ENTRY_BEGIN_OFFSET: usize = 40;
/// Offset of the `max_ndims` field.
pub const MAX_NDIMS_OFFSET: usize = 48;
/// Offset of the `num_entries` field.
pub const NUM_ENTRIES_OFFSET: usize = 56;
const PATH_LEN_OFFSET: usize = 64;

/// Round up to the next multiple of 4.
fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Metadata log header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHeader {
    /// Magic bytes
    pub magic: [u8; 8],
    /// Dataset format tag
    pub format: [u8; 8],
    /// Whether integers were written big-endian
    pub big_endian: bool,
    /// Whether payloads use the external (portable) representation
    pub external: bool,
    /// Number of processes sharing the dataset
    pub num_procs: u64,
    /// Rank of the writing process
    pub rank: u64,
    /// Offset of the first metadata entry
    pub entry_begin: u64,
    /// Highest dimensionality of any variable
    pub max_ndims: u64,
    /// Committed entries
    pub num_entries: u64,
    /// Absolute path of the dataset
    pub dataset_path: String,
}

impl LogHeader {
    /// Create a header for a fresh, empty log.
    pub fn new(dataset_path: impl Into<String>, rank: u32, num_procs: u32, max_ndims: usize) -> Self {
        let dataset_path = dataset_path.into();
        let entry_begin = align4(HEADER_FIXED_SIZE + dataset_path.len()) as u64;
        LogHeader {
            magic: LOG_MAGIC,
            format: FORMAT_TAG,
            big_endian: cfg!(target_endian = "big"),
            external: false,
            num_procs: num_procs as u64,
            rank: rank as u64,
            entry_begin,
            max_ndims: max_ndims as u64,
            num_entries: 0,
            dataset_path,
        }
    }

    /// Encoded size, which is also `entry_begin` for a header built by [`LogHeader::new`].
    pub fn encoded_len(&self) -> usize {
        align4(HEADER_FIXED_SIZE + self.dataset_path.len())
    }

    /// Serialize the header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.encoded_len()];
        bytes[0..8].copy_from_slice(&self.magic);
        bytes[FORMAT_OFFSET..FORMAT_OFFSET + 8].copy_from_slice(&self.format);
        NativeEndian::write_u32(&mut bytes[BIG_ENDIAN_OFFSET..], self.big_endian as u32);
        NativeEndian::write_u32(&mut bytes[EXTERNAL_OFFSET..], self.external as u32);
        NativeEndian::write_u64(&mut bytes[NUM_PROCS_OFFSET..], self.num_procs);
        NativeEndian::write_u64(&mut bytes[RANK_OFFSET..], self.rank);
        NativeEndian::write_u64(&mut bytes[ENTRY_BEGIN_OFFSET..], self.entry_begin);
        NativeEndian::write_u64(&mut bytes[MAX_NDIMS_OFFSET..], self.max_ndims);
        NativeEndian::write_u64(&mut bytes[NUM_ENTRIES_OFFSET..], self.num_entries);
        NativeEndian::write_u32(&mut bytes[PATH_LEN_OFFSET..], self.dataset_path.len() as u32);
        let path = self.dataset_path.as_bytes();
        bytes[HEADER_FIXED_SIZE..HEADER_FIXED_SIZE + path.len()].copy_from_slice(path);
        bytes
    }

    /// Deserialize a header from the start of a metadata log.
    pub fn from_bytes(bytes: &[u8]) -> LogResult<Self> {
        if bytes.len() < HEADER_FIXED_SIZE {
            return Err(LogError::BadLogFile(format!(
                "metadata log is {} bytes, shorter than its {}-byte header",
                bytes.len(),
                HEADER_FIXED_SIZE
            )));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        if magic != LOG_MAGIC {
            return Err(LogError::BadLogFile("metadata log magic mismatch".into()));
        }
        let mut format = [0u8; 8];
        format.copy_from_slice(&bytes[FORMAT_OFFSET..FORMAT_OFFSET + 8]);

        let big_endian = match NativeEndian::read_u32(&bytes[BIG_ENDIAN_OFFSET..]) {
            0 => false,
            1 => true,
            _ => {
                return Err(LogError::BadLogFile(
                    "metadata log was written with a foreign byte order".into(),
                ))
            }
        };

        let path_len = NativeEndian::read_u32(&bytes[PATH_LEN_OFFSET..]) as usize;
        let path_end = HEADER_FIXED_SIZE + path_len;
        if bytes.len() < path_end {
            return Err(LogError::BadLogFile(format!(
                "dataset path of {} bytes runs past the end of the metadata log",
                path_len
            )));
        }
        let dataset_path = std::str::from_utf8(&bytes[HEADER_FIXED_SIZE..path_end])
            .map_err(|_| LogError::BadLogFile("dataset path is not valid UTF-8".into()))?
            .to_string();

        Ok(LogHeader {
            magic,
            format,
            big_endian,
            external: NativeEndian::read_u32(&bytes[EXTERNAL_OFFSET..]) != 0,
            num_procs: NativeEndian::read_u64(&bytes[NUM_PROCS_OFFSET..]),
            rank: NativeEndian::read_u64(&bytes[RANK_OFFSET..]),
            entry_begin: NativeEndian::read_u64(&bytes[ENTRY_BEGIN_OFFSET..]),
            max_ndims: NativeEndian::read_u64(&bytes[MAX_NDIMS_OFFSET..]),
            num_entries: NativeEndian::read_u64(&bytes[NUM_ENTRIES_OFFSET..]),
            dataset_path,
        })
    }

    /// Encode a single u64 field for an in-place rewrite.
    pub fn encode_u64(value: u64) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        NativeEndian::write_u64(&mut bytes, value);
        bytes
    }

    /// Whether the header was written on a host with our byte order.
    pub fn matches_host_endianness(&self) -> bool {
        self.big_endian == cfg!(target_endian = "big")
    }
}
