//! Metadata index
//!
//! One slot per logged entry, in log order, recording whether the entry is
//! still to be replayed and which deferred request (if any) owns it.

use std::ops::Range;

/// Index slot of one metadata entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// `false` once the owning request was cancelled
    pub valid: bool,
    /// Deferred request owning the entry; `None` for blocking writes
    pub request: Option<u32>,
}

/// Per-entry validity and request linkage.
#[derive(Debug, Default)]
pub struct MetadataIndex {
    entries: Vec<IndexEntry>,
}

impl MetadataIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a valid entry with no owner; returns its position.
    pub fn push(&mut self) -> usize {
        self.entries.push(IndexEntry {
            valid: true,
            request: None,
        });
        self.entries.len() - 1
    }

    /// Attach a request to a span of entries.
    pub fn link(&mut self, span: Range<usize>, request: u32) {
        for entry in &mut self.entries[span] {
            entry.request = Some(request);
        }
    }

    /// Mark a span of entries as cancelled.
    pub fn invalidate(&mut self, span: Range<usize>) {
        for entry in &mut self.entries[span] {
            entry.valid = false;
        }
    }

    /// Drop the last entry (undo of a failed append).
    pub fn pop(&mut self) {
        self.entries.pop();
    }

    /// Whether entry `i` will be replayed.
    pub fn is_valid(&self, i: usize) -> bool {
        self.entries[i].valid
    }

    /// Request owning entry `i`.
    pub fn request_of(&self, i: usize) -> Option<u32> {
        self.entries[i].request
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries still to be replayed.
    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }

    /// Forget every entry.
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_link_invalidate() {
        let mut index = MetadataIndex::new();
        for _ in 0..4 {
            index.push();
        }
        index.link(1..3, 9);
        index.invalidate(1..3);

        assert!(index.is_valid(0));
        assert!(!index.is_valid(1));
        assert!(!index.is_valid(2));
        assert!(index.is_valid(3));
        assert_eq!(index.request_of(0), None);
        assert_eq!(index.request_of(2), Some(9));
        assert_eq!(index.valid_count(), 2);
    }

    #[test]
    fn test_reset() {
        let mut index = MetadataIndex::new();
        index.push();
        index.push();
        index.pop();
        assert_eq!(index.len(), 1);
        index.reset();
        assert!(index.is_empty());
    }
}
