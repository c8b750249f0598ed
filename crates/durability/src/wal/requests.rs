//! Pending deferred-write requests
//!
//! A deferred write returns a request id instead of completing. The id maps
//! to the span of metadata entries the call appended; it becomes `ready` once
//! a flush has replayed those entries and stays in the table until the
//! caller waits on it or cancels it. Ids are recycled through a free list so
//! the id space stays dense.

use std::ops::Range;

use stagelog_core::{LogError, LogResult, RequestId, Status};

use super::index::MetadataIndex;

/// Bookkeeping for one deferred write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Entries appended by the call, in log order
    pub entries: Range<usize>,
    /// Whether the entries have been replayed
    pub ready: bool,
    /// First error reported for any entry of the span
    pub status: Status,
}

/// Table of outstanding deferred writes.
#[derive(Debug, Default)]
pub struct RequestTracker {
    slots: Vec<Option<PendingRequest>>,
    free: Vec<u32>,
}

impl RequestTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a deferred write spanning `entries`.
    ///
    /// A call that appended nothing is complete immediately.
    pub fn begin(&mut self, entries: Range<usize>) -> u32 {
        let ready = entries.is_empty();
        let request = PendingRequest {
            entries,
            ready,
            status: Ok(()),
        };
        match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(request);
                id
            }
            None => {
                self.slots.push(Some(request));
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Look up an outstanding request.
    pub fn get(&self, id: u32) -> Option<&PendingRequest> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    /// Whether the request has been replayed.
    pub fn is_ready(&self, id: u32) -> LogResult<bool> {
        self.get(id)
            .map(|r| r.ready)
            .ok_or(LogError::InvalidRequestId(RequestId::Log(id)))
    }

    /// Record the outcome of one replayed entry; the first error sticks.
    pub fn record(&mut self, id: u32, status: &Status) {
        if let Some(Some(request)) = self.slots.get_mut(id as usize) {
            request.ready = true;
            if request.status.is_ok() {
                if let Err(e) = status {
                    request.status = Err(e.clone());
                }
            }
        }
    }

    /// Attach an error to a request without completing it.
    pub fn note(&mut self, id: u32, status: &Status) {
        if let Some(Some(request)) = self.slots.get_mut(id as usize) {
            if request.status.is_ok() {
                if let Err(e) = status {
                    request.status = Err(e.clone());
                }
            }
        }
    }

    /// Mark every outstanding request replayed.
    ///
    /// Called at the end of a flush: the log is empty afterwards, so nothing
    /// still pending can ever be replayed.
    pub fn mark_all_ready(&mut self) {
        for request in self.slots.iter_mut().flatten() {
            request.ready = true;
        }
    }

    /// Remove a request and recycle its id.
    pub fn take(&mut self, id: u32) -> LogResult<PendingRequest> {
        let request = self
            .slots
            .get_mut(id as usize)
            .and_then(|s| s.take())
            .ok_or(LogError::InvalidRequestId(RequestId::Log(id)))?;
        self.free.push(id);
        Ok(request)
    }

    /// Cancel a request.
    ///
    /// Before replay its entries are invalidated so the flush skips them.
    /// After replay the cancel is refused with `AlreadyCompleted`, carrying
    /// the real outcome. The id is consumed either way.
    pub fn cancel(&mut self, id: u32, index: &mut MetadataIndex) -> Status {
        let request = self.take(id)?;
        if request.ready {
            return Err(LogError::already_completed(&request.status));
        }
        index.invalidate(request.entries);
        Ok(())
    }

    /// Ids of every outstanding request, ascending.
    pub fn ids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Whether no request is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(n: usize) -> MetadataIndex {
        let mut index = MetadataIndex::new();
        for _ in 0..n {
            index.push();
        }
        index
    }

    #[test]
    fn test_ids_are_recycled() {
        let mut tracker = RequestTracker::new();
        let a = tracker.begin(0..1);
        let b = tracker.begin(1..2);
        assert_eq!((a, b), (0, 1));

        tracker.take(a).unwrap();
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.begin(2..3), 0);
        assert_eq!(tracker.begin(3..4), 2);
    }

    #[test]
    fn test_empty_span_is_ready() {
        let mut tracker = RequestTracker::new();
        let id = tracker.begin(4..4);
        assert!(tracker.is_ready(id).unwrap());
        assert_eq!(tracker.take(id).unwrap().status, Ok(()));
    }

    #[test]
    fn test_record_keeps_first_error() {
        let mut tracker = RequestTracker::new();
        let id = tracker.begin(0..3);
        tracker.record(id, &Ok(()));
        tracker.record(
            id,
            &Err(LogError::Driver {
                code: 1,
                message: "first".into(),
            }),
        );
        tracker.record(
            id,
            &Err(LogError::Driver {
                code: 2,
                message: "second".into(),
            }),
        );
        let request = tracker.take(id).unwrap();
        assert!(request.ready);
        assert!(matches!(request.status, Err(LogError::Driver { code: 1, .. })));
    }

    #[test]
    fn test_cancel_before_replay_invalidates_span() {
        let mut index = index_with(3);
        let mut tracker = RequestTracker::new();
        let id = tracker.begin(1..3);
        index.link(1..3, id);

        assert_eq!(tracker.cancel(id, &mut index), Ok(()));
        assert!(index.is_valid(0));
        assert!(!index.is_valid(1));
        assert!(!index.is_valid(2));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_cancel_after_replay_is_already_completed() {
        let mut index = index_with(1);
        let mut tracker = RequestTracker::new();
        let id = tracker.begin(0..1);
        tracker.mark_all_ready();

        assert_eq!(
            tracker.cancel(id, &mut index),
            Err(LogError::AlreadyCompleted(None))
        );
        assert!(index.is_valid(0));
        assert!(tracker.get(id).is_none());
    }

    #[test]
    fn test_unknown_ids_rejected() {
        let mut tracker = RequestTracker::new();
        let mut index = MetadataIndex::new();
        assert_eq!(
            tracker.take(5),
            Err(LogError::InvalidRequestId(RequestId::Log(5)))
        );
        assert!(tracker.is_ready(0).is_err());
        let id = tracker.begin(0..0);
        tracker.take(id).unwrap();
        assert_eq!(
            tracker.cancel(id, &mut index),
            Err(LogError::InvalidRequestId(RequestId::Log(id)))
        );
    }

    #[test]
    fn test_ids_lists_outstanding() {
        let mut tracker = RequestTracker::new();
        let a = tracker.begin(0..1);
        let b = tracker.begin(1..2);
        let c = tracker.begin(2..3);
        tracker.take(b).unwrap();
        assert_eq!(tracker.ids(), vec![a, c]);
    }
}
