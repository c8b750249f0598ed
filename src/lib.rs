//! Stagelog - deferred write-ahead log for parallel datasets
//!
//! Stagelog stages variable writes in a per-process log on fast local
//! storage (a burst buffer) and replays them into the shared dataset at
//! collective flush points.
//!
//! # Quick Start
//!
//! ```ignore
//! use stagelog::{DatasetBuilder, ElementType, Selection};
//!
//! let mut ds = DatasetBuilder::new()
//!     .hint("nc_dw_dirname", "/local/bb")
//!     .create(backend)?;
//! let x = ds.define_dimension("x", Some(10))?;
//! let v = ds.define_variable("v", ElementType::Int, &[x])?;
//! ds.enddef()?;
//!
//! // Logged, not yet in the dataset
//! ds.put(Selection::range(v, &[2], &[3]), ElementType::Int, &bytes)?;
//!
//! // Replayed here
//! let backend = ds.close()?;
//! ```
//!
//! # Architecture
//!
//! - `stagelog-core`: identifiers, selections, errors, and the driver traits
//! - `stagelog-durability`: log files, metadata index, flush engine, recovery
//! - `stagelog-engine`: the dataset facade and request handling

pub use stagelog_core::*;
pub use stagelog_durability::{
    DeferredLog, FlushStats, LogConfig, LogConfigError, LogMetrics, LogPaths, LogRecovery,
    RecoveryStats,
};
pub use stagelog_engine::{DatasetBuilder, LoggedDataset};

/// In-memory backend for tests and experiments.
pub mod testing {
    pub use stagelog_durability::testing::*;
}
