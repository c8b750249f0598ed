//! Log self-consistency checks
//!
//! With verify-on-write enabled, the writer re-reads what it just put on
//! disk and compares it with the in-memory mirror. Recovery uses the
//! dataset checks to refuse a log that belongs to another dataset or
//! process.

use std::path::Path;

use stagelog_core::{LogError, LogResult};

use crate::format::{LogEntry, LogHeader, MetaLog};

macro_rules! check_field {
    ($what:expr, $found:expr, $expected:expr) => {
        if $found != $expected {
            return Err(LogError::LogCheck(format!(
                "{}: found {:?}, expected {:?}",
                $what, $found, $expected
            )));
        }
    };
}

/// Compare a header read back from disk with the in-memory one.
pub fn compare_headers(found: &LogHeader, expected: &LogHeader) -> LogResult<()> {
    check_field!("header magic", found.magic, expected.magic);
    check_field!("format tag", found.format, expected.format);
    check_field!("endianness flag", found.big_endian, expected.big_endian);
    check_field!("external flag", found.external, expected.external);
    check_field!("process count", found.num_procs, expected.num_procs);
    check_field!("rank", found.rank, expected.rank);
    check_field!("entry_begin", found.entry_begin, expected.entry_begin);
    check_field!("max_ndims", found.max_ndims, expected.max_ndims);
    check_field!("num_entries", found.num_entries, expected.num_entries);
    check_field!("dataset path", found.dataset_path, expected.dataset_path);
    Ok(())
}

/// Re-read the on-disk header and compare it with `expected`.
pub fn verify_header(meta_log: &mut MetaLog, expected: &LogHeader) -> LogResult<()> {
    let bytes = meta_log.read_at(0, expected.encoded_len())?;
    let found = LogHeader::from_bytes(&bytes)
        .map_err(|e| LogError::LogCheck(format!("header unreadable: {}", e)))?;
    compare_headers(&found, expected)
}

/// Re-read the entry at `offset` and compare it with `expected`.
///
/// `payload_len` is the data log's payload size right after the append, so
/// the entry must describe the last `data_len` bytes of it.
pub fn verify_entry(
    meta_log: &mut MetaLog,
    offset: u64,
    expected: &LogEntry,
    payload_len: u64,
) -> LogResult<()> {
    let bytes = meta_log.read_at(offset, expected.encoded_len())?;
    let (found, _) = LogEntry::decode(&bytes)
        .map_err(|e| LogError::LogCheck(format!("entry unreadable: {}", e)))?;

    check_field!("entry ndims", found.ndims(), expected.ndims());
    check_field!("write kind", found.kind, expected.kind);
    check_field!("element type", found.elem, expected.elem);
    check_field!("variable", found.var, expected.var);
    check_field!("data_len", found.data_len, expected.data_len);
    check_field!(
        "data_off",
        found.data_off,
        payload_len.saturating_sub(found.data_len)
    );
    check_field!("start", found.start, expected.start);
    check_field!("count", found.count, expected.count);
    if expected.kind.has_stride() {
        check_field!("stride", found.stride, expected.stride);
    }
    Ok(())
}

/// Check that a log found on disk belongs to this dataset and process.
pub fn check_ownership(
    header: &LogHeader,
    dataset_path: &Path,
    rank: u32,
    num_procs: u32,
) -> LogResult<()> {
    if !header.matches_host_endianness() {
        return Err(LogError::BadLogFile(
            "log was written on a host with a different byte order".into(),
        ));
    }
    if header.dataset_path != dataset_path.to_string_lossy() {
        return Err(LogError::BadLogFile(format!(
            "log belongs to {}, not {}",
            header.dataset_path,
            dataset_path.display()
        )));
    }
    if header.rank != rank as u64 {
        return Err(LogError::BadLogFile(format!(
            "log was written by rank {}, not {}",
            header.rank, rank
        )));
    }
    if header.num_procs != num_procs as u64 {
        return Err(LogError::BadLogFile(format!(
            "log was written by {} processes, dataset has {}",
            header.num_procs, num_procs
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagelog_core::{ElementType, Selection, VarId, WriteCall};
    use tempfile::tempdir;

    fn entry(off: u64) -> LogEntry {
        let start = [0u64, 4];
        let count = [1u64, 2];
        let data = [0u8; 16];
        let call = WriteCall::new(
            Selection::range(VarId(3), &start, &count),
            ElementType::Double,
            &data,
        );
        LogEntry::from_call(&call, off)
    }

    #[test]
    fn test_header_mismatch_is_reported() {
        let expected = LogHeader::new("/d.nc", 0, 4, 2);
        let mut found = expected.clone();
        assert!(compare_headers(&found, &expected).is_ok());
        found.num_entries = 3;
        let err = compare_headers(&found, &expected).unwrap_err();
        assert!(matches!(err, LogError::LogCheck(ref m) if m.contains("num_entries")));
    }

    #[test]
    fn test_verify_header_on_disk() {
        let dir = tempdir().unwrap();
        let mut meta = MetaLog::create(&dir.path().join("x.meta"), false).unwrap();
        let header = LogHeader::new("/d.nc", 1, 2, 3);
        meta.write_at(0, &header.to_bytes()).unwrap();
        verify_header(&mut meta, &header).unwrap();

        let mut newer = header.clone();
        newer.max_ndims = 5;
        assert!(verify_header(&mut meta, &newer).is_err());
    }

    #[test]
    fn test_verify_entry_on_disk() {
        let dir = tempdir().unwrap();
        let mut meta = MetaLog::create(&dir.path().join("x.meta"), false).unwrap();
        let e = entry(8);
        meta.write_at(100, &e.to_bytes()).unwrap();
        verify_entry(&mut meta, 100, &e, 24).unwrap();

        // payload does not end where the entry says it does
        let err = verify_entry(&mut meta, 100, &e, 40).unwrap_err();
        assert!(matches!(err, LogError::LogCheck(ref m) if m.contains("data_off")));
    }

    #[test]
    fn test_ownership_checks() {
        let header = LogHeader::new("/d.nc", 2, 4, 1);
        assert!(check_ownership(&header, Path::new("/d.nc"), 2, 4).is_ok());
        assert!(matches!(
            check_ownership(&header, Path::new("/other.nc"), 2, 4),
            Err(LogError::BadLogFile(_))
        ));
        assert!(check_ownership(&header, Path::new("/d.nc"), 1, 4).is_err());
        assert!(check_ownership(&header, Path::new("/d.nc"), 2, 8).is_err());
    }
}
