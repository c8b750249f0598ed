//! Log file handles.
//!
//! [`MetaLog`] is written at known offsets (header fields and entries are
//! rewritten in place); [`DataLog`] is append-only during logging and read
//! sequentially during replay.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use stagelog_core::{LogError, LogResult};

use super::header::DATA_LOG_MAGIC;

/// Open a log file for read/write, refusing to clobber unless `overwrite`.
fn create_file(path: &Path, overwrite: bool) -> LogResult<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    options.open(path).map_err(|e| {
        if e.kind() == ErrorKind::AlreadyExists {
            LogError::BadLogFile(format!(
                "log file {} already exists and overwrite is disabled",
                path.display()
            ))
        } else {
            LogError::Io(format!("cannot create {}: {}", path.display(), e))
        }
    })
}

/// Write all of `bytes`, reporting how far a short write got.
fn write_fully(file: &mut File, bytes: &[u8]) -> LogResult<()> {
    let mut written = 0;
    while written < bytes.len() {
        match file.write(&bytes[written..]) {
            Ok(0) => {
                return Err(LogError::IncompleteWrite {
                    expected: bytes.len() as u64,
                    written: written as u64,
                })
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Fill all of `buf`, reporting how far a short read got.
fn read_fully(file: &mut File, buf: &mut [u8]) -> LogResult<()> {
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..]) {
            Ok(0) => {
                return Err(LogError::IncompleteRead {
                    expected: buf.len() as u64,
                    read: read as u64,
                })
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Metadata log file.
#[derive(Debug)]
pub struct MetaLog {
    file: File,
    path: PathBuf,
}

impl MetaLog {
    /// Create an empty metadata log.
    pub fn create(path: &Path, overwrite: bool) -> LogResult<Self> {
        Ok(MetaLog {
            file: create_file(path, overwrite)?,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing metadata log.
    pub fn open(path: &Path) -> LogResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| LogError::BadLogFile(format!("cannot open {}: {}", path.display(), e)))?;
        Ok(MetaLog {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Write `bytes` at `offset`.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> LogResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        write_fully(&mut self.file, bytes)
    }

    /// Read `len` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> LogResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        read_fully(&mut self.file, &mut buf)?;
        Ok(buf)
    }

    /// Read the whole file.
    pub fn read_all(&mut self) -> LogResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Cut the file to `len` bytes.
    pub fn truncate(&mut self, len: u64) -> LogResult<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Current file size.
    pub fn size(&self) -> LogResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Flush file contents to stable storage.
    pub fn sync(&mut self) -> LogResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Where a data log's logical bytes live in the physical file.
///
/// A private log maps them one to one. A shared log is one file for every
/// process of the dataset: logical block `i` of channel `c` lives at
/// physical block `i * channels + c`, so the channels interleave without
/// coordinating their appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLayout {
    /// One file per process.
    Private,
    /// One file shared by `channels` processes.
    Shared {
        /// Bytes per block
        block_size: u64,
        /// This process's slot
        channel: u64,
        /// Number of processes sharing the file
        channels: u64,
    },
}

impl BlockLayout {
    /// Layout of `channel` in a file shared by `channels` processes.
    pub fn shared(block_size: u64, channel: u32, channels: u32) -> LogResult<Self> {
        if block_size == 0 {
            return Err(LogError::InvalidArgument(
                "shared log block size must be positive".into(),
            ));
        }
        if channel >= channels {
            return Err(LogError::InvalidArgument(format!(
                "channel {} of a log shared by {} processes",
                channel, channels
            )));
        }
        Ok(BlockLayout::Shared {
            block_size,
            channel: channel as u64,
            channels: channels as u64,
        })
    }

    /// Whether other processes write to the same file.
    pub fn is_shared(&self) -> bool {
        matches!(self, BlockLayout::Shared { .. })
    }

    /// Physical `(offset, len)` extents covering logical `[offset, offset + len)`.
    pub fn extents(&self, offset: u64, len: u64) -> Vec<(u64, u64)> {
        match *self {
            BlockLayout::Private => vec![(offset, len)],
            BlockLayout::Shared {
                block_size,
                channel,
                channels,
            } => {
                let mut out = Vec::new();
                let mut off = offset;
                let mut left = len;
                while left > 0 {
                    let block = off / block_size;
                    let within = off % block_size;
                    let n = (block_size - within).min(left);
                    out.push(((block * channels + channel) * block_size + within, n));
                    off += n;
                    left -= n;
                }
                out
            }
        }
    }

    /// Logical bytes of this channel inside a file of `physical` bytes.
    ///
    /// Holes in the channel's blocks below the end of the file count too.
    pub fn logical_len(&self, physical: u64) -> u64 {
        match *self {
            BlockLayout::Private => physical,
            BlockLayout::Shared {
                block_size,
                channel,
                channels,
            } => {
                let stripe = block_size * channels;
                let rem = physical % stripe;
                (physical / stripe) * block_size
                    + rem.saturating_sub(channel * block_size).min(block_size)
            }
        }
    }
}

/// Data log file.
///
/// Offsets handed out by [`DataLog::append`] are relative to the first
/// payload byte, just past the magic prefix. Positions are logical: the
/// [`BlockLayout`] decides where they land in the file.
///
/// With a staging buffer, appends smaller than the buffer are held in
/// memory and written out together when the buffer fills, before any read
/// and on [`DataLog::sync`].
#[derive(Debug)]
pub struct DataLog {
    file: File,
    path: PathBuf,
    layout: BlockLayout,
    /// Logical size including staged bytes
    size: u64,
    /// Logical bytes on disk
    written: u64,
    pending: Vec<u8>,
    buffer_size: usize,
    /// Logical read position
    cursor: u64,
}

impl DataLog {
    /// Size of the magic prefix.
    pub const PREFIX_LEN: u64 = DATA_LOG_MAGIC.len() as u64;

    fn with_file(file: File, path: &Path, layout: BlockLayout, size: u64) -> Self {
        DataLog {
            file,
            path: path.to_path_buf(),
            layout,
            size,
            written: size,
            pending: Vec::new(),
            buffer_size: 0,
            cursor: Self::PREFIX_LEN,
        }
    }

    fn open_file(path: &Path) -> LogResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| LogError::BadLogFile(format!("cannot open {}: {}", path.display(), e)))
    }

    /// Create a private data log holding only its magic prefix.
    pub fn create(path: &Path, overwrite: bool) -> LogResult<Self> {
        let mut file = create_file(path, overwrite)?;
        write_fully(&mut file, &DATA_LOG_MAGIC)?;
        Ok(Self::with_file(file, path, BlockLayout::Private, Self::PREFIX_LEN))
    }

    /// Create the empty file a shared data log lives in.
    ///
    /// Done by one process before the others [join](DataLog::join_shared).
    pub fn prepare_shared(path: &Path, overwrite: bool) -> LogResult<()> {
        create_file(path, overwrite).map(|_| ())
    }

    /// Take this process's channel of a prepared shared data log.
    pub fn join_shared(path: &Path, layout: BlockLayout) -> LogResult<Self> {
        let file = Self::open_file(path)?;
        let mut log = Self::with_file(file, path, layout, 0);
        log.write_logical(0, &DATA_LOG_MAGIC)?;
        log.size = Self::PREFIX_LEN;
        log.written = Self::PREFIX_LEN;
        Ok(log)
    }

    /// Open an existing private data log and check its magic prefix.
    pub fn open(path: &Path) -> LogResult<Self> {
        Self::open_with(path, BlockLayout::Private)
    }

    /// Open an existing data log with the given layout and check this
    /// channel's magic prefix.
    pub fn open_with(path: &Path, layout: BlockLayout) -> LogResult<Self> {
        let file = Self::open_file(path)?;
        let physical = file.metadata()?.len();
        let mut log = Self::with_file(file, path, layout, layout.logical_len(physical));
        let mut magic = [0u8; 8];
        if log.size < Self::PREFIX_LEN || log.read_logical(0, &mut magic).is_err() {
            return Err(LogError::BadLogFile(format!(
                "{} is too short for a data log",
                path.display()
            )));
        }
        if magic != DATA_LOG_MAGIC {
            return Err(LogError::BadLogFile(format!(
                "{} is not a data log (magic mismatch)",
                path.display()
            )));
        }
        Ok(log)
    }

    /// Stage appends smaller than `size` bytes in memory; 0 writes through.
    pub fn with_buffer(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Layout of the file.
    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    fn write_logical(&mut self, offset: u64, bytes: &[u8]) -> LogResult<()> {
        let mut done = 0usize;
        for (pos, len) in self.layout.extents(offset, bytes.len() as u64) {
            let len = len as usize;
            self.file.seek(SeekFrom::Start(pos))?;
            write_fully(&mut self.file, &bytes[done..done + len]).map_err(|e| match e {
                LogError::IncompleteWrite { written, .. } => LogError::IncompleteWrite {
                    expected: bytes.len() as u64,
                    written: done as u64 + written,
                },
                other => other,
            })?;
            done += len;
        }
        Ok(())
    }

    fn read_logical(&mut self, offset: u64, buf: &mut [u8]) -> LogResult<()> {
        let expected = buf.len() as u64;
        let mut done = 0usize;
        for (pos, len) in self.layout.extents(offset, expected) {
            let len = len as usize;
            self.file.seek(SeekFrom::Start(pos))?;
            read_fully(&mut self.file, &mut buf[done..done + len]).map_err(|e| match e {
                LogError::IncompleteRead { read, .. } => LogError::IncompleteRead {
                    expected,
                    read: done as u64 + read,
                },
                other => other,
            })?;
            done += len;
        }
        Ok(())
    }

    /// Write `bytes` at the end of what is on disk.
    ///
    /// On failure a private file is cut back to its previous size.
    fn write_tail(&mut self, bytes: &[u8]) -> LogResult<()> {
        if let Err(e) = self.write_logical(self.written, bytes) {
            if !self.layout.is_shared() {
                if let Err(cleanup) = self.file.set_len(self.written) {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %cleanup,
                        "Failed to cut data log back after a failed write"
                    );
                }
            }
            return Err(e);
        }
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Write staged appends to disk. Staged bytes are kept on failure.
    fn drain(&mut self) -> LogResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let result = self.write_tail(&pending);
        self.pending = pending;
        if result.is_ok() {
            tracing::trace!(bytes = self.pending.len(), "Drained data log buffer");
            self.pending.clear();
        }
        result
    }

    /// Append a payload, returning its offset.
    ///
    /// All-or-nothing: on failure the offset bookkeeping is unchanged.
    /// A staged payload only reaches the file on the next drain.
    pub fn append(&mut self, bytes: &[u8]) -> LogResult<u64> {
        let offset = self.payload_len();
        if self.buffer_size > 0 {
            if self.pending.len() + bytes.len() > self.buffer_size {
                self.drain()?;
            }
            if bytes.len() < self.buffer_size {
                self.pending.extend_from_slice(bytes);
                self.size += bytes.len() as u64;
                return Ok(offset);
            }
        }
        self.write_tail(bytes)?;
        self.size = self.written;
        Ok(offset)
    }

    /// Logical size including the prefix and staged bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Payload bytes currently logged.
    pub fn payload_len(&self) -> u64 {
        self.size - Self::PREFIX_LEN
    }

    /// Payload bytes staged in memory.
    pub fn buffered_len(&self) -> u64 {
        self.pending.len() as u64
    }

    /// Position the read cursor at the first payload byte.
    pub fn rewind(&mut self) -> LogResult<()> {
        self.drain()?;
        self.cursor = Self::PREFIX_LEN;
        Ok(())
    }

    /// Read the next `buf.len()` payload bytes.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> LogResult<()> {
        let at = self.cursor;
        let n = self.read_bounded(at, buf)?;
        self.cursor += n;
        Ok(())
    }

    /// Read `len` bytes at payload offset `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> LogResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let at = offset
            .checked_add(Self::PREFIX_LEN)
            .ok_or_else(|| LogError::InvalidArgument(format!("payload offset {}", offset)))?;
        self.read_bounded(at, &mut buf)?;
        Ok(buf)
    }

    /// Fill `buf` from logical position `at`, failing with the bytes
    /// available when the log ends first.
    fn read_bounded(&mut self, at: u64, buf: &mut [u8]) -> LogResult<u64> {
        self.drain()?;
        let want = buf.len() as u64;
        let avail = self.written.saturating_sub(at).min(want);
        self.read_logical(at, &mut buf[..avail as usize])?;
        if avail < want {
            return Err(LogError::IncompleteRead {
                expected: want,
                read: avail,
            });
        }
        Ok(want)
    }

    /// Move the read cursor forward without reading.
    pub fn skip(&mut self, len: u64) -> LogResult<()> {
        self.cursor = self
            .cursor
            .checked_add(len)
            .ok_or_else(|| LogError::CorruptLog(format!("cannot skip {} bytes", len)))?;
        Ok(())
    }

    /// Drop every payload, leaving only the prefix.
    ///
    /// A shared file keeps its length; the channel's blocks are reused.
    pub fn reset(&mut self) -> LogResult<()> {
        self.pending.clear();
        if !self.layout.is_shared() {
            self.file.set_len(Self::PREFIX_LEN)?;
        }
        self.size = Self::PREFIX_LEN;
        self.written = Self::PREFIX_LEN;
        self.cursor = Self::PREFIX_LEN;
        Ok(())
    }

    /// Write out staged appends and flush file contents to stable storage.
    pub fn sync(&mut self) -> LogResult<()> {
        self.drain()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
