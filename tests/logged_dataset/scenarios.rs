//! Worked examples of what the log holds before and after a flush.

use crate::common::*;
use crate::init_tracing;

#[test]
fn test_single_write_staged_then_replayed() {
    init_tracing!();
    let mut t = TestDataset::new(8);
    t.put(2, &[7, 7, 7]);

    let writer = t.ds.log().writer().unwrap();
    assert_eq!(writer.num_entries(), 1);
    assert_eq!(writer.data_log_size(), 8 + 12);
    let offsets = writer.entry_offsets().unwrap();
    let entry = writer.entry_at(offsets[0]).unwrap();
    assert_eq!(entry.data_len, 12);
    assert_eq!(entry.data_off, 0);
    assert_eq!(&entry.start[..], &[2]);
    assert_eq!(&entry.count[..], &[3]);
    assert_eq!(t.driver_writes(), 0);

    t.ds.flush().unwrap();

    let writes = t.ds.backend().writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].start, vec![2]);
    assert_eq!(writes[0].count, vec![3]);
    assert_eq!(writes[0].len, 12);
    assert_eq!(t.contents(), vec![0, 0, 7, 7, 7, 0, 0, 0]);

    let writer = t.ds.log().writer().unwrap();
    assert_eq!(writer.num_entries(), 0);
    assert_eq!(writer.data_log_size(), 8);
}

#[test]
fn test_cancelled_write_never_replayed() {
    init_tracing!();
    let mut t = TestDataset::new(8);
    t.put(0, &[1, 1]);
    let id = t.iput(4, &[2, 2]);
    assert!(t.ds.cancel(&[id]).unwrap()[0].is_ok());

    // the cancelled entry stays in the log until the flush walks past it
    let writer = t.ds.log().writer().unwrap();
    assert_eq!(writer.num_entries(), 2);
    assert_eq!(writer.ledger().count(), 2);

    let stats = t.ds.flush().unwrap();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.replayed, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(t.driver_writes(), 1);
    assert_eq!(t.contents(), vec![1, 1, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn test_later_write_wins() {
    let mut t = TestDataset::new(6);
    t.put(0, &[1, 1, 1, 1]);
    t.put(2, &[2, 2, 2, 2]);
    let id = t.iput(1, &[3]);
    assert_eq!(t.ds.wait(&[id]).unwrap(), vec![Ok(())]);
    assert_eq!(t.contents(), vec![1, 3, 2, 2, 2, 2]);
}

#[test]
fn test_failed_write_reported_on_its_request() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut backend = MemoryDriver::new(dir.path().join("fail.nc"));
    let x = backend.define_dimension("x", Some(4)).unwrap();
    let good_var = backend.define_variable("good", ElementType::Int, &[x]).unwrap();
    let bad_var = backend.define_variable("bad", ElementType::Int, &[x]).unwrap();
    backend.enddef().unwrap();
    backend.fail_writes_to(bad_var);
    let mut ds = LoggedDataset::open(backend, LogConfig::for_testing(dir.path()), true).unwrap();

    let data = ints(&[9, 9]);
    let bad = ds
        .iput(Selection::range(bad_var, &[0], &[2]), ElementType::Int, &data)
        .unwrap();
    let good = ds
        .iput(Selection::range(good_var, &[2], &[2]), ElementType::Int, &data)
        .unwrap();

    // the flush reports the failure but still replays everything else
    assert!(matches!(ds.flush(), Err(LogError::Driver { .. })));
    let statuses = ds.wait(&[good, bad]).unwrap();
    assert!(statuses[0].is_ok());
    assert!(matches!(statuses[1], Err(LogError::Driver { .. })));
    assert_eq!(
        to_ints(ds.backend().contents(good_var).unwrap()),
        vec![0, 0, 9, 9]
    );
    assert_eq!(ds.log().num_entries(), 0);
}
