//! Core types and traits for Stagelog
//!
//! This crate defines the vocabulary shared by the log and the dataset layer:
//! - VarId / DimId: catalog identifiers
//! - ElementType: closed set of element kinds, with the log-local tag mapping
//! - WriteKind: how a write addresses its variable (range, strided range, ...)
//! - IoMode: collective vs independent data mode
//! - RequestId: log-owned vs driver-owned request handles
//! - LogError: error taxonomy for every layer
//! - Traits: BaseDriver and DatasetCatalog, the only contracts the log needs,
//!   and DatasetBackend, the wider surface the dataset facade forwards to

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{LogError, LogResult, Status};
pub use traits::{BaseDriver, DatasetBackend, DatasetCatalog, Selection, WriteCall};
pub use types::{DimId, ElementType, IoMode, RequestId, VarId, WaitScope, WriteKind};
