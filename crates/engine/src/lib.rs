//! Dataset engine for Stagelog
//!
//! This crate ties the lower layers together:
//! - LoggedDataset: a dataset whose writes are staged in a deferred log
//! - Request demultiplexing between log requests and driver requests
//! - Collective flush points (sync, redef, reads, wait, mode switches, close)
//! - Recovery of a log left behind by an earlier session
//!
//! The engine is the only component that knows about:
//! - Define mode and data mode
//! - Independent and collective data mode
//! - When the log must be replayed

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dataset;

pub use dataset::{DatasetBuilder, LoggedDataset};
