//! Shared test utilities for the integration suites.
//!
//! Import via `mod common;` from any test's main.rs.

#![allow(dead_code)]

pub use stagelog::testing::{ints, to_ints, DriverCall, MemoryDriver};
pub use stagelog::{
    DatasetBackend, DatasetBuilder, DatasetCatalog, ElementType, LogConfig, LogError,
    LoggedDataset, RequestId, Selection, VarId, WaitScope,
};
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

/// Route log output to the test harness for the rest of the test.
#[macro_export]
macro_rules! init_tracing {
    () => {
        let _tracing_guard = tracing::subscriber::set_default(
            tracing_subscriber::fmt::Subscriber::builder()
                .with_test_writer()
                .with_max_level(tracing::Level::DEBUG)
                .finish(),
        );
    };
}

// ============================================================================
// TestDataset
// ============================================================================

/// A logged dataset over the in-memory backend with one 1-D int variable.
pub struct TestDataset {
    pub ds: LoggedDataset<MemoryDriver>,
    pub var: VarId,
    pub dir: TempDir,
}

impl TestDataset {
    /// Dataset in data mode with a variable of `len` ints.
    pub fn new(len: u64) -> Self {
        Self::with_config(len, |c| c)
    }

    /// Same as [`TestDataset::new`] with an adjusted configuration.
    pub fn with_config(len: u64, adjust: impl FnOnce(LogConfig) -> LogConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let backend = MemoryDriver::new(dir.path().join("test.nc"));
        let config = adjust(LogConfig::for_testing(dir.path()));
        let mut ds = LoggedDataset::create(backend, config).unwrap();
        let x = ds.define_dimension("x", Some(len)).unwrap();
        let var = ds.define_variable("v", ElementType::Int, &[x]).unwrap();
        ds.enddef().unwrap();
        TestDataset { ds, var, dir }
    }

    /// Blocking write of `values` at `start`.
    pub fn put(&mut self, start: u64, values: &[i32]) {
        let data = ints(values);
        let begin = [start];
        let count = [values.len() as u64];
        self.ds
            .put(Selection::range(self.var, &begin, &count), ElementType::Int, &data)
            .unwrap();
    }

    /// Deferred write of `values` at `start`.
    pub fn iput(&mut self, start: u64, values: &[i32]) -> RequestId {
        let data = ints(values);
        let begin = [start];
        let count = [values.len() as u64];
        self.ds
            .iput(Selection::range(self.var, &begin, &count), ElementType::Int, &data)
            .unwrap()
    }

    /// Variable contents as the backend holds them.
    pub fn contents(&self) -> Vec<i32> {
        to_ints(self.ds.backend().contents(self.var).unwrap())
    }

    /// Write calls the backend has received.
    pub fn driver_writes(&self) -> usize {
        self.ds.backend().writes().len()
    }
}
