//! Session lifecycle: flush points, close, abort and reopen.

use crate::common::*;
use crate::init_tracing;
use stagelog::{IoMode, LogPaths};

#[test]
fn test_every_flush_point_replays() {
    let mut t = TestDataset::new(8);

    t.put(0, &[1]);
    t.ds.sync().unwrap();
    assert_eq!(t.contents()[0], 1);

    t.put(1, &[2]);
    let read = t
        .ds
        .get(Selection::range(t.var, &[1], &[1]), ElementType::Int)
        .unwrap();
    assert_eq!(to_ints(&read), vec![2]);

    t.put(2, &[3]);
    t.ds.begin_indep_data().unwrap();
    assert_eq!(t.contents()[2], 3);

    t.put(3, &[4]);
    t.ds.end_indep_data().unwrap();
    assert_eq!(t.contents()[3], 4);

    t.put(4, &[5]);
    t.ds.redef().unwrap();
    assert_eq!(t.contents()[4], 5);
    t.ds.enddef().unwrap();

    assert_eq!(t.ds.metrics().flushes, 5);
    assert_eq!(t.ds.metrics().entries_replayed, 5);
}

#[test]
fn test_sync_without_flush_on_sync() {
    let mut t = TestDataset::with_config(4, |c| c.with_flush_on_sync(false));
    t.put(0, &[1]);
    t.ds.sync().unwrap();
    assert_eq!(t.contents(), vec![0, 0, 0, 0]);
    assert!(t
        .ds
        .backend()
        .calls()
        .iter()
        .any(|call| matches!(call, DriverCall::Sync)));
}

#[test]
fn test_close_replays_and_removes_log() {
    init_tracing!();
    let mut t = TestDataset::new(4);
    t.put(0, &[1, 2]);
    let id = t.iput(2, &[3, 4]);
    assert!(matches!(id, RequestId::Log(_)));
    let var = t.var;

    let TestDataset { ds, dir, .. } = t;
    let backend = ds.close().unwrap();
    assert_eq!(to_ints(backend.contents(var).unwrap()), vec![1, 2, 3, 4]);
    assert!(!LogPaths::for_catalog(dir.path(), &backend).unwrap().exists());
    assert!(matches!(backend.calls().last(), Some(DriverCall::Close)));
}

#[test]
fn test_abort_then_recover_on_open() {
    init_tracing!();
    let mut t = TestDataset::new(4);
    t.put(1, &[8, 8]);
    let var = t.var;
    let TestDataset { ds, dir, .. } = t;
    let backend = ds.abort().unwrap();
    assert_eq!(to_ints(backend.contents(var).unwrap()), vec![0, 0, 0, 0]);
    assert!(LogPaths::for_catalog(dir.path(), &backend).unwrap().exists());

    let ds = DatasetBuilder::new()
        .config(LogConfig::for_testing(dir.path()))
        .recover(true)
        .open(backend)
        .unwrap();
    let stats = ds.recovered().unwrap();
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.replay.replayed, 1);
    assert_eq!(to_ints(ds.backend().contents(var).unwrap()), vec![0, 8, 8, 0]);
    ds.close().unwrap();
}

#[test]
fn test_readonly_dataset_never_logs() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut backend = MemoryDriver::new(dir.path().join("ro.nc"));
    let x = backend.define_dimension("x", Some(2)).unwrap();
    let v = backend.define_variable("v", ElementType::Int, &[x]).unwrap();
    backend.enddef().unwrap();

    let mut ds = DatasetBuilder::new()
        .config(LogConfig::for_testing(dir.path()))
        .open_readonly(backend)
        .unwrap();
    assert!(!ds.is_writable());
    assert!(!ds.log().is_initialized());
    let data = ints(&[1, 1]);
    assert!(ds
        .put(Selection::range(v, &[0], &[2]), ElementType::Int, &data)
        .is_err());
    let read = ds.get(Selection::range(v, &[0], &[2]), ElementType::Int).unwrap();
    assert_eq!(to_ints(&read), vec![0, 0]);

    let backend = ds.close().unwrap();
    assert!(!LogPaths::for_catalog(dir.path(), &backend).unwrap().exists());
}

#[test]
fn test_wait_all_in_independent_mode() {
    let mut t = TestDataset::new(4);
    t.ds.begin_indep_data().unwrap();
    assert_eq!(t.ds.io_mode(), IoMode::Independent);
    t.iput(0, &[1]);
    t.iput(1, &[2]);
    assert_eq!(t.ds.pending_requests(), 2);
    assert_eq!(t.ds.pending_put_bytes(), 8);

    assert_eq!(t.ds.wait_all(WaitScope::All), Ok(()));
    assert_eq!(t.ds.pending_requests(), 0);
    assert_eq!(t.ds.pending_put_bytes(), 0);
    assert_eq!(t.contents(), vec![1, 2, 0, 0]);
    assert!(t
        .ds
        .backend()
        .calls()
        .iter()
        .any(|call| matches!(call, DriverCall::Wait(_, IoMode::Independent))));
}

#[test]
fn test_unknown_request_id() {
    let mut t = TestDataset::new(4);
    let statuses = t.ds.wait(&[RequestId::Log(3)]).unwrap();
    assert_eq!(statuses, vec![Err(LogError::InvalidRequestId(RequestId::Log(3)))]);
    let statuses = t.ds.cancel(&[RequestId::Log(3)]).unwrap();
    assert!(statuses[0].is_err());
}
