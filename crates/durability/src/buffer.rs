//! Growable byte arena and size ledger
//!
//! Both structures grow geometrically and hand out indices, never references,
//! so a later allocation that moves the backing storage cannot invalidate a
//! caller's handle. Growth is fallible: a failed reservation leaves the
//! previous contents untouched and reports [`LogError::OutOfMemory`].

use stagelog_core::{LogError, LogResult};

/// Initial capacity of the metadata mirror.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Initial capacity of the size ledger (entries).
pub const DEFAULT_LEDGER_CAPACITY: usize = 32;

/// Capacity multiplier applied when an allocation does not fit.
pub const GROWTH_FACTOR: usize = 20;

/// Smallest capacity reachable from `current` by repeated multiplication
/// that holds `needed`.
fn grown_capacity(current: usize, needed: usize, factor: usize) -> Option<usize> {
    let mut cap = current.max(1);
    while cap < needed {
        cap = cap.checked_mul(factor)?;
    }
    Some(cap)
}

/// Location of an allocation inside a [`GrowableBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Byte offset from the start of the buffer
    pub offset: usize,
    /// Length in bytes
    pub len: usize,
}

impl Span {
    /// One past the last byte.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Append-only byte arena.
#[derive(Debug)]
pub struct GrowableBuffer {
    data: Vec<u8>,
    capacity: usize,
    factor: usize,
}

impl GrowableBuffer {
    /// Create a buffer with the default capacity and growth factor.
    pub fn new() -> LogResult<Self> {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY, GROWTH_FACTOR)
    }

    /// Create a buffer with an explicit initial capacity and growth factor.
    pub fn with_capacity(capacity: usize, factor: usize) -> LogResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|e| {
            LogError::OutOfMemory(format!("metadata buffer of {} bytes: {}", capacity, e))
        })?;
        Ok(GrowableBuffer {
            data,
            capacity,
            factor: factor.max(2),
        })
    }

    /// Reserve `n` zeroed bytes at the end of the buffer.
    pub fn allocate(&mut self, n: usize) -> LogResult<Span> {
        let offset = self.data.len();
        let needed = offset
            .checked_add(n)
            .ok_or_else(|| LogError::OutOfMemory("metadata buffer size overflow".into()))?;

        if needed > self.capacity {
            let cap = grown_capacity(self.capacity, needed, self.factor).ok_or_else(|| {
                LogError::OutOfMemory(format!("cannot grow metadata buffer to {} bytes", needed))
            })?;
            self.data
                .try_reserve_exact(cap - offset)
                .map_err(|e| {
                    LogError::OutOfMemory(format!("metadata buffer of {} bytes: {}", cap, e))
                })?;
            self.capacity = cap;
        }

        self.data.resize(needed, 0);
        Ok(Span { offset, len: n })
    }

    /// Allocate and fill from `bytes`.
    pub fn append(&mut self, bytes: &[u8]) -> LogResult<Span> {
        let span = self.allocate(bytes.len())?;
        self.bytes_mut(span).copy_from_slice(bytes);
        Ok(span)
    }

    /// Contents of an allocation.
    pub fn bytes(&self, span: Span) -> &[u8] {
        &self.data[span.offset..span.end()]
    }

    /// Mutable contents of an allocation.
    pub fn bytes_mut(&mut self, span: Span) -> &mut [u8] {
        &mut self.data[span.offset..span.end()]
    }

    /// Everything allocated so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Drop everything past `mark`; capacity is kept.
    pub fn reset(&mut self, mark: usize) {
        self.data.truncate(mark);
    }

    /// Bytes in use.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes available before the next growth.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Append-only array of per-entry payload sizes.
#[derive(Debug)]
pub struct SizeLedger {
    sizes: Vec<u64>,
    capacity: usize,
    factor: usize,
}

impl SizeLedger {
    /// Create a ledger with the default capacity and growth factor.
    pub fn new() -> LogResult<Self> {
        Self::with_capacity(DEFAULT_LEDGER_CAPACITY, GROWTH_FACTOR)
    }

    /// Create a ledger with an explicit initial capacity and growth factor.
    pub fn with_capacity(capacity: usize, factor: usize) -> LogResult<Self> {
        let mut sizes = Vec::new();
        sizes.try_reserve_exact(capacity).map_err(|e| {
            LogError::OutOfMemory(format!("size ledger of {} entries: {}", capacity, e))
        })?;
        Ok(SizeLedger {
            sizes,
            capacity,
            factor: factor.max(2),
        })
    }

    /// Record the payload size of the next entry.
    pub fn append(&mut self, size: u64) -> LogResult<()> {
        let needed = self.sizes.len() + 1;
        if needed > self.capacity {
            let cap = grown_capacity(self.capacity, needed, self.factor).ok_or_else(|| {
                LogError::OutOfMemory(format!("cannot grow size ledger to {} entries", needed))
            })?;
            self.sizes
                .try_reserve_exact(cap - self.sizes.len())
                .map_err(|e| {
                    LogError::OutOfMemory(format!("size ledger of {} entries: {}", cap, e))
                })?;
            self.capacity = cap;
        }
        self.sizes.push(size);
        Ok(())
    }

    /// Drop the most recent size (undo of a failed append).
    pub fn pop(&mut self) -> Option<u64> {
        self.sizes.pop()
    }

    /// Payload size of entry `i`.
    pub fn size(&self, i: usize) -> u64 {
        self.sizes[i]
    }

    /// Number of recorded entries.
    pub fn count(&self) -> usize {
        self.sizes.len()
    }

    /// Sum of all recorded sizes.
    pub fn total(&self) -> u64 {
        self.sizes.iter().sum()
    }

    /// All recorded sizes in log order.
    pub fn as_slice(&self) -> &[u64] {
        &self.sizes
    }

    /// Forget every entry; capacity is kept.
    pub fn reset(&mut self) {
        self.sizes.clear();
    }

    /// Entries that fit before the next growth.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
