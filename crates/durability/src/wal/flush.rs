//! Flush/replay engine
//!
//! Drains logged entries into the base driver in log order, holding at most
//! one budget's worth of payload in memory:
//!
//! - consecutive valid entries are packed into a batch while their payloads
//!   fit the budget, read from the data log in one go, issued as
//!   non-blocking writes and waited on together
//! - cancelled entries are skipped by seeking past their payload, after
//!   reading whatever the current batch has accumulated
//! - an entry larger than the whole budget is halved along its first
//!   dimension with extent > 1, recursively, and each piece is issued as a
//!   blocking write
//!
//! Every base-driver call made here is collective when the mode is
//! collective, so all processes must flush together.

use std::time::Instant;

use stagelog_core::{BaseDriver, IoMode, LogError, LogResult, Selection, Status, WriteCall};

use super::metrics::nanos;
use crate::format::{DataLog, Dims, LogEntry};

/// Replay budget for a flush.
///
/// The whole data log when unbounded, otherwise the smaller of the limit and
/// the data log.
pub fn flush_budget(limit: Option<u64>, payload_len: u64) -> u64 {
    match limit {
        Some(limit) if limit < payload_len => limit,
        _ => payload_len,
    }
}

/// Outcome counters of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Entries in the log when the flush started
    pub entries: usize,
    /// Entries issued to the base driver (split entries count once)
    pub replayed: usize,
    /// Cancelled entries skipped
    pub skipped: usize,
    /// Entries that had to be split
    pub split: usize,
    /// Blocking writes issued for split entries
    pub split_pieces: usize,
    /// Batches issued
    pub batches: usize,
    /// Replay buffer size
    pub budget: u64,
    /// Largest single read from the data log
    pub largest_read: u64,
    /// Nanoseconds spent reading the data log
    pub read_nanos: u64,
    /// Nanoseconds spent in base driver calls
    pub replay_nanos: u64,
}

/// Entries a replay walks, in log order.
pub trait ReplaySource {
    /// Number of entries.
    fn len(&self) -> usize;

    /// Payload size of entry `i`.
    fn size(&self, i: usize) -> u64;

    /// Whether entry `i` is to be replayed.
    fn is_valid(&self, i: usize) -> bool;

    /// Decode entry `i`.
    fn entry(&self, i: usize) -> LogResult<LogEntry>;
}

impl ReplaySource for [LogEntry] {
    fn len(&self) -> usize {
        <[LogEntry]>::len(self)
    }

    fn size(&self, i: usize) -> u64 {
        self[i].data_len
    }

    fn is_valid(&self, _i: usize) -> bool {
        true
    }

    fn entry(&self, i: usize) -> LogResult<LogEntry> {
        Ok(self[i].clone())
    }
}

fn fold(first: &mut Status, status: &Status) {
    if first.is_ok() {
        if let Err(e) = status {
            *first = Err(e.clone());
        }
    }
}

/// One replay pass over a data log.
pub struct Replayer<'d, D: BaseDriver + ?Sized> {
    driver: &'d mut D,
    mode: IoMode,
    budget: u64,
    buf: Vec<u8>,
    stats: FlushStats,
}

impl<'d, D: BaseDriver + ?Sized> Replayer<'d, D> {
    /// Prepare a replay with a buffer of `budget` bytes.
    pub fn new(driver: &'d mut D, mode: IoMode, budget: u64) -> LogResult<Self> {
        let size = usize::try_from(budget)
            .map_err(|_| LogError::OutOfMemory(format!("flush buffer of {} bytes", budget)))?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|e| LogError::OutOfMemory(format!("flush buffer of {} bytes: {}", budget, e)))?;
        Ok(Replayer {
            driver,
            mode,
            budget,
            buf,
            stats: FlushStats {
                budget,
                ..FlushStats::default()
            },
        })
    }

    /// Counters gathered so far.
    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    /// Consume the replayer, returning its counters.
    pub fn into_stats(self) -> FlushStats {
        self.stats
    }

    /// Replay every entry of `source`.
    ///
    /// `on_status` is called once per valid entry with its outcome. Errors
    /// do not stop the walk; the first one is returned. Only a data log
    /// that can no longer be read ends the walk early, with every remaining
    /// valid entry reported failed.
    pub fn run<S, F>(&mut self, source: &S, data: &mut DataLog, mut on_status: F) -> Status
    where
        S: ReplaySource + ?Sized,
        F: FnMut(usize, &Status),
    {
        let n = source.len();
        self.stats.entries = n;
        let mut first: Status = Ok(());

        let mut lb = 0;
        let walked = data.rewind().and_then(|_| {
            while lb < n {
                let ub = self.fill_batch(source, data, lb)?;
                if ub == lb {
                    let status = self.replay_oversized(source, data, lb)?;
                    on_status(lb, &status);
                    fold(&mut first, &status);
                    lb += 1;
                } else {
                    let status = self.issue_batch(source, lb, ub, &mut on_status);
                    fold(&mut first, &status);
                    lb = ub;
                }
            }
            Ok(())
        });

        if let Err(e) = walked {
            tracing::warn!(error = %e, at = lb, "Data log unreadable, abandoning replay");
            let failed: Status = Err(e);
            for i in lb..n {
                if source.is_valid(i) {
                    on_status(i, &failed);
                }
            }
            fold(&mut first, &failed);
        }
        first
    }

    /// Append the next `len` bytes of the data log to the buffer.
    fn read_into(&mut self, data: &mut DataLog, len: u64) -> LogResult<()> {
        if len == 0 {
            return Ok(());
        }
        let started = Instant::now();
        let begin = self.buf.len();
        self.buf.resize(begin + len as usize, 0);
        let result = data.read_exact(&mut self.buf[begin..]);
        self.stats.read_nanos += nanos(started.elapsed());
        self.stats.largest_read = self.stats.largest_read.max(len);
        result
    }

    /// Pack entries from `lb` into the buffer; returns one past the last
    /// entry of the batch. Returns `lb` when entry `lb` alone exceeds the
    /// budget.
    fn fill_batch<S: ReplaySource + ?Sized>(
        &mut self,
        source: &S,
        data: &mut DataLog,
        lb: usize,
    ) -> LogResult<usize> {
        self.buf.clear();
        let mut used = 0u64;
        let mut read = 0u64;
        let mut ub = lb;

        while ub < source.len() {
            let size = source.size(ub);
            if source.is_valid(ub) {
                match used.checked_add(size) {
                    Some(next) if next <= self.budget => used = next,
                    _ => break,
                }
            } else {
                if read < used {
                    self.read_into(data, used - read)?;
                    read = used;
                }
                data.skip(size)?;
                self.stats.skipped += 1;
                tracing::debug!(entry = ub, bytes = size, "Skipping cancelled entry");
            }
            ub += 1;
        }

        if read < used {
            self.read_into(data, used - read)?;
        }
        Ok(ub)
    }

    /// Issue the valid entries of `[lb, ub)` from the buffer and wait for them.
    fn issue_batch<S, F>(&mut self, source: &S, lb: usize, ub: usize, on_status: &mut F) -> Status
    where
        S: ReplaySource + ?Sized,
        F: FnMut(usize, &Status),
    {
        let mut first: Status = Ok(());
        let mut issued: Vec<(usize, u64)> = Vec::new();
        let mut off = 0usize;
        let started = Instant::now();

        for i in lb..ub {
            if !source.is_valid(i) {
                continue;
            }
            let size = source.size(i) as usize;
            let piece = off..off + size;
            off += size;

            let status = match source.entry(i) {
                Ok(entry) if entry.data_len as usize != size => Err(LogError::CorruptLog(format!(
                    "entry {} records {} payload bytes, ledger has {}",
                    i, entry.data_len, size
                ))),
                Ok(entry) => {
                    let call = WriteCall::new(entry.selection(), entry.elem, &self.buf[piece]);
                    match self.driver.iwrite(&call) {
                        Ok(id) => {
                            issued.push((i, id));
                            continue;
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            };
            on_status(i, &status);
            fold(&mut first, &status);
        }

        // Waited on even when empty: the wait is collective.
        let ids: Vec<u64> = issued.iter().map(|(_, id)| *id).collect();
        match self.driver.wait(&ids, self.mode) {
            Ok(statuses) if statuses.len() == ids.len() => {
                for ((i, _), status) in issued.iter().zip(statuses.iter()) {
                    on_status(*i, status);
                    fold(&mut first, status);
                }
            }
            Ok(statuses) => {
                let failed: Status = Err(LogError::Driver {
                    code: -1,
                    message: format!(
                        "wait returned {} statuses for {} requests",
                        statuses.len(),
                        ids.len()
                    ),
                });
                for (i, _) in &issued {
                    on_status(*i, &failed);
                }
                fold(&mut first, &failed);
            }
            Err(e) => {
                let failed: Status = Err(e);
                for (i, _) in &issued {
                    on_status(*i, &failed);
                }
                fold(&mut first, &failed);
            }
        }

        self.stats.replayed += issued.len();
        self.stats.batches += 1;
        self.stats.replay_nanos += nanos(started.elapsed());
        tracing::debug!(
            first = lb,
            end = ub,
            issued = issued.len(),
            bytes = off,
            "Replayed batch"
        );
        first
    }

    /// Replay entry `i`, whose payload exceeds the budget, in pieces.
    fn replay_oversized<S: ReplaySource + ?Sized>(
        &mut self,
        source: &S,
        data: &mut DataLog,
        i: usize,
    ) -> LogResult<Status> {
        let size = source.size(i);
        let entry = match source.entry(i) {
            Ok(entry) => entry,
            Err(e) => {
                data.skip(size)?;
                return Ok(Err(e));
            }
        };

        self.stats.split += 1;
        self.stats.replayed += 1;
        tracing::debug!(
            entry = i,
            bytes = size,
            budget = self.budget,
            "Splitting entry larger than the flush buffer"
        );
        let mut start = entry.start.clone();
        let mut count = entry.count.clone();
        self.write_split(&entry, &mut start, &mut count, size, data)
    }

    /// Write `len` payload bytes covering `start`/`count` of `entry`,
    /// halving until each piece fits the budget.
    ///
    /// The outer error means the data log failed; the inner status is the
    /// outcome of the writes.
    fn write_split(
        &mut self,
        entry: &LogEntry,
        start: &mut Dims,
        count: &mut Dims,
        len: u64,
        data: &mut DataLog,
    ) -> LogResult<Status> {
        if len <= self.budget {
            self.buf.clear();
            self.read_into(data, len)?;
            let selection = Selection {
                var: entry.var,
                start: start.as_slice(),
                count: count.as_slice(),
                stride: if entry.kind.has_stride() {
                    Some(entry.stride.as_slice())
                } else {
                    None
                },
            };
            let call = WriteCall::new(selection, entry.elem, &self.buf);
            let started = Instant::now();
            let status = self.driver.write(&call, self.mode);
            self.stats.replay_nanos += nanos(started.elapsed());
            self.stats.split_pieces += 1;
            return Ok(status);
        }

        let Some(dim) = count.iter().position(|&c| c > 1) else {
            data.skip(len)?;
            return Ok(Err(LogError::OutOfMemory(format!(
                "a single element of {} bytes exceeds the {}-byte flush buffer",
                len, self.budget
            ))));
        };

        let total = count[dim];
        let first_count = total / 2;
        let first_len = len / total * first_count;
        let step = if entry.kind.has_stride() {
            entry.stride[dim]
        } else {
            1
        };
        let origin = start[dim];
        let Some(second_origin) = first_count
            .checked_mul(step)
            .and_then(|span| origin.checked_add(span))
        else {
            data.skip(len)?;
            return Ok(Err(LogError::InvalidArgument(format!(
                "splitting dimension {} at {} with stride {} overflows",
                dim, origin, step
            ))));
        };

        count[dim] = first_count;
        let first = self.write_split(entry, start, count, first_len, data)?;

        start[dim] = second_origin;
        count[dim] = total - first_count;
        let second = self.write_split(entry, start, count, len - first_len, data)?;

        start[dim] = origin;
        count[dim] = total;
        Ok(first.and(second))
    }
}
