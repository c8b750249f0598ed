//! Log file locations
//!
//! Each process writes its own pair of files into the log directory:
//!
//! ```text
//! <log_dir>/
//! ├── <dataset file name>_<handle>_<rank>.meta
//! └── <dataset file name>_<handle>_<rank>.data
//! ```
//!
//! Including the handle and rank keeps the names unique when several
//! processes, or several open datasets, share one log directory.
//!
//! In shared-log mode the metadata logs stay per process but every process
//! appends to one `<dataset file name>_<handle>.data`, owned by rank 0.

use std::path::{Path, PathBuf};

use stagelog_core::{DatasetCatalog, LogError, LogResult};

use super::config::LogConfig;

/// Make `path` absolute against the current directory without touching the
/// filesystem.
pub fn absolute_path(path: &Path) -> LogResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| LogError::Io(format!("cannot resolve current directory: {}", e)))?;
        Ok(cwd.join(path))
    }
}

/// Paths of one process's log pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    log_dir: PathBuf,
    dataset_path: PathBuf,
    meta: PathBuf,
    data: PathBuf,
    shared: bool,
    rank: u32,
}

impl LogPaths {
    /// Derive the log pair for a dataset.
    pub fn derive(
        log_dir: &Path,
        dataset_path: &Path,
        handle: i32,
        rank: u32,
    ) -> LogResult<Self> {
        Self::build(log_dir, dataset_path, handle, rank, false)
    }

    /// Derive the paths for a dataset whose processes share one data log.
    pub fn derive_shared(
        log_dir: &Path,
        dataset_path: &Path,
        handle: i32,
        rank: u32,
    ) -> LogResult<Self> {
        Self::build(log_dir, dataset_path, handle, rank, true)
    }

    fn build(
        log_dir: &Path,
        dataset_path: &Path,
        handle: i32,
        rank: u32,
        shared: bool,
    ) -> LogResult<Self> {
        let log_dir = absolute_path(log_dir)?;
        let dataset_path = absolute_path(dataset_path)?;
        let name = dataset_path
            .file_name()
            .ok_or_else(|| {
                LogError::InvalidArgument(format!(
                    "dataset path {} has no file name",
                    dataset_path.display()
                ))
            })?
            .to_string_lossy()
            .into_owned();

        let stem = format!("{}_{}_{}", name, handle, rank);
        let data = if shared {
            log_dir.join(format!("{}_{}.data", name, handle))
        } else {
            log_dir.join(format!("{}.data", stem))
        };
        Ok(LogPaths {
            meta: log_dir.join(format!("{}.meta", stem)),
            data,
            log_dir,
            dataset_path,
            shared,
            rank,
        })
    }

    /// Derive the log pair for the dataset a catalog describes.
    pub fn for_catalog<C: DatasetCatalog + ?Sized>(log_dir: &Path, catalog: &C) -> LogResult<Self> {
        Self::derive(log_dir, catalog.path(), catalog.handle(), catalog.rank())
    }

    /// Derive the paths `config` asks for.
    pub fn for_config<C: DatasetCatalog + ?Sized>(config: &LogConfig, catalog: &C) -> LogResult<Self> {
        if config.shared_log {
            Self::derive_shared(&config.log_dir, catalog.path(), catalog.handle(), catalog.rank())
        } else {
            Self::for_catalog(&config.log_dir, catalog)
        }
    }

    /// Whether the data log is shared by every process.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Whether this process creates and removes the data log.
    pub fn owns_data(&self) -> bool {
        !self.shared || self.rank == 0
    }

    /// Directory holding the log pair.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Absolute dataset path, as recorded in the header.
    pub fn dataset_path(&self) -> &Path {
        &self.dataset_path
    }

    /// Metadata log path.
    pub fn meta(&self) -> &Path {
        &self.meta
    }

    /// Data log path.
    pub fn data(&self) -> &Path {
        &self.data
    }

    /// Whether either file this process owns is present.
    pub fn exists(&self) -> bool {
        self.meta.exists() || (self.owns_data() && self.data.exists())
    }

    /// Create the log directory if needed.
    pub fn create_dir(&self) -> LogResult<()> {
        std::fs::create_dir_all(&self.log_dir).map_err(|e| {
            LogError::Io(format!(
                "cannot create log directory {}: {}",
                self.log_dir.display(),
                e
            ))
        })
    }

    /// Remove the files this process owns, ignoring ones already gone.
    pub fn remove(&self) -> LogResult<()> {
        let owned = if self.owns_data() {
            vec![&self.meta, &self.data]
        } else {
            vec![&self.meta]
        };
        for path in owned {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(LogError::Io(format!(
                        "cannot remove {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        Ok(())
    }
}
