//! Waiting on and cancelling requests
//!
//! Log request ids (deferred writes) and driver request ids (deferred reads)
//! can be mixed freely in one call. Log ids are resolved against the log,
//! driver ids are forwarded to the backend, and statuses come back in the
//! order the ids were given.

use stagelog_core::{DatasetBackend, LogError, LogResult, RequestId, Status, WaitScope};

use super::{keep_first, LoggedDataset};

fn missing_status(id: u64) -> Status {
    Err(LogError::Driver {
        code: -1,
        message: format!("backend returned no status for request {}", id),
    })
}

fn driver_ids(ids: &[RequestId]) -> Vec<u64> {
    ids.iter()
        .filter_map(|id| match id {
            RequestId::Driver(id) => Some(*id),
            RequestId::Log(_) => None,
        })
        .collect()
}

impl<B: DatasetBackend> LoggedDataset<B> {
    /// Wait for requests. Collective when a flush is needed.
    ///
    /// Reads are only completed after the log has been flushed, so they see
    /// every write logged before them.
    pub fn wait(&mut self, ids: &[RequestId]) -> LogResult<Vec<Status>> {
        let driver = driver_ids(ids);
        let mut driver_statuses = if driver.is_empty() {
            Vec::new().into_iter()
        } else {
            if let Err(e) = self.flush() {
                // per-request outcomes are in the request table
                if e.is_fatal() {
                    return Err(e);
                }
            }
            self.backend.wait(&driver, self.mode)?.into_iter()
        };

        let statuses = ids
            .iter()
            .map(|id| match *id {
                RequestId::Log(id) => self.log.resolve(id, &mut self.backend, self.mode),
                RequestId::Driver(id) => driver_statuses.next().unwrap_or_else(|| missing_status(id)),
            })
            .collect();
        Ok(statuses)
    }

    /// Wait for every outstanding request in `scope`; returns the first error.
    ///
    /// Collective: flushes for any scope that includes writes, even when
    /// this process has none outstanding.
    pub fn wait_all(&mut self, scope: WaitScope) -> Status {
        let mut ids = Vec::new();
        if scope != WaitScope::Gets {
            if let Err(e) = self.flush() {
                if e.is_fatal() {
                    return Err(e);
                }
            }
            ids.extend(self.log.outstanding_requests().into_iter().map(RequestId::Log));
        }
        if scope != WaitScope::Puts {
            ids.extend(self.backend.pending_requests().into_iter().map(RequestId::Driver));
        }

        let mut first: Status = Ok(());
        for status in self.wait(&ids)? {
            keep_first(&mut first, status);
        }
        first
    }

    /// Cancel requests.
    ///
    /// A deferred write that has already been replayed is not cancelled;
    /// its status is `AlreadyCompleted` carrying the real outcome. Every id
    /// is consumed either way.
    pub fn cancel(&mut self, ids: &[RequestId]) -> LogResult<Vec<Status>> {
        let driver = driver_ids(ids);
        let mut driver_statuses = if driver.is_empty() {
            Vec::new().into_iter()
        } else {
            self.backend.cancel(&driver)?.into_iter()
        };

        let statuses = ids
            .iter()
            .map(|id| match *id {
                RequestId::Log(id) => self.log.cancel(id),
                RequestId::Driver(id) => driver_statuses.next().unwrap_or_else(|| missing_status(id)),
            })
            .collect();
        Ok(statuses)
    }

    /// Cancel every outstanding request in `scope`.
    ///
    /// Writes already replayed are dropped silently; other failures are
    /// returned, first error wins.
    pub fn cancel_all(&mut self, scope: WaitScope) -> Status {
        let mut ids = Vec::new();
        if scope != WaitScope::Gets {
            ids.extend(self.log.outstanding_requests().into_iter().map(RequestId::Log));
        }
        if scope != WaitScope::Puts {
            ids.extend(self.backend.pending_requests().into_iter().map(RequestId::Driver));
        }

        let mut first: Status = Ok(());
        for status in self.cancel(&ids)? {
            match status {
                Err(LogError::AlreadyCompleted(_)) => {}
                other => keep_first(&mut first, other),
            }
        }
        if !ids.is_empty() {
            tracing::debug!(requests = ids.len(), ?scope, "Cancelled outstanding requests");
        }
        first
    }
}
