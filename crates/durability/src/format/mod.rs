//! On-disk log formats
//!
//! Each process owns two files:
//!
//! ```text
//! metadata log                          data log
//! ┌──────────────────────────────┐      ┌──────────────────────┐
//! │ Header (entry_begin bytes)   │      │ Magic (8 bytes)      │
//! ├──────────────────────────────┤      ├──────────────────────┤
//! │ Entry 0                      │ ───> │ Payload 0            │
//! ├──────────────────────────────┤      ├──────────────────────┤
//! │ Entry 1                      │ ───> │ Payload 1            │
//! ├──────────────────────────────┤      ├──────────────────────┤
//! │ ...                          │      │ ...                  │
//! └──────────────────────────────┘      └──────────────────────┘
//! ```
//!
//! Integers are stored in the byte order of the writing host; the header
//! records which one that was. The metadata log is mirrored in memory and
//! only read back for verification and crash recovery.

pub mod entry;
pub mod files;
pub mod header;

pub use entry::{entry_size, Dims, LogEntry, ENTRY_FIXED_SIZE};
pub use files::{BlockLayout, DataLog, MetaLog};
pub use header::{
    LogHeader, DATA_LOG_MAGIC, FORMAT_TAG, HEADER_FIXED_SIZE, LOG_MAGIC, MAX_NDIMS_OFFSET,
    NUM_ENTRIES_OFFSET,
};
