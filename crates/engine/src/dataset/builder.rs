//! Dataset builder for hint- and file-driven configuration
//!
//! Log settings can come from an explicit [`LogConfig`], a TOML file, or
//! the dataset's open hints. Hints are applied last, on top of whichever
//! of the other two was given.

use std::path::PathBuf;

use stagelog_core::{DatasetBackend, IoMode, LogResult};
use stagelog_durability::{LogConfig, LogRecovery, RecoveryStats};

use super::LoggedDataset;

/// Builder for [`LoggedDataset`].
///
/// ```ignore
/// use stagelog_engine::DatasetBuilder;
///
/// // Hints as passed to the dataset open call
/// let ds = DatasetBuilder::new()
///     .hint("nc_dw_dirname", "/local/bb")
///     .hint("nc_dw_flush_buffer_size", "67108864")
///     .recover(true)
///     .open(backend)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct DatasetBuilder {
    config: Option<LogConfig>,
    config_file: Option<PathBuf>,
    hints: Vec<(String, String)>,
    recover: bool,
}

impl DatasetBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an explicit configuration.
    pub fn config(mut self, config: LogConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Start from a TOML file. Ignored when an explicit configuration is set.
    pub fn config_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Add one open hint.
    pub fn hint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.hints.push((key.into(), value.into()));
        self
    }

    /// Add several open hints.
    pub fn hints<I, K, V>(mut self, hints: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.hints
            .extend(hints.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Replay a log left behind by an earlier session when opening.
    pub fn recover(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }

    /// The configuration the dataset will use.
    pub fn resolve_config(&self) -> LogResult<LogConfig> {
        let base = match (&self.config, &self.config_file) {
            (Some(config), _) => config.clone(),
            (None, Some(path)) => LogConfig::from_file(path)?,
            (None, None) => LogConfig::default(),
        };
        let config = base.apply_hints(self.hints.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        Ok(config)
    }

    /// Wrap a freshly created dataset.
    pub fn create<B: DatasetBackend>(self, backend: B) -> LogResult<LoggedDataset<B>> {
        LoggedDataset::create(backend, self.resolve_config()?)
    }

    /// Wrap an existing dataset for writing.
    ///
    /// With [`DatasetBuilder::recover`], a leftover log pair for this
    /// dataset is replayed and removed first. Collective.
    pub fn open<B: DatasetBackend>(self, mut backend: B) -> LogResult<LoggedDataset<B>> {
        let config = self.resolve_config()?;
        let recovered = if self.recover {
            recover_leftover(&mut backend, &config)?
        } else {
            None
        };
        let mut dataset = LoggedDataset::open(backend, config, true)?;
        dataset.recovered = recovered;
        Ok(dataset)
    }

    /// Wrap an existing dataset for reading only; no log is created.
    pub fn open_readonly<B: DatasetBackend>(self, backend: B) -> LogResult<LoggedDataset<B>> {
        LoggedDataset::open(backend, self.resolve_config()?, false)
    }
}

fn recover_leftover<B: DatasetBackend>(
    backend: &mut B,
    config: &LogConfig,
) -> LogResult<Option<RecoveryStats>> {
    let recovery = LogRecovery::for_config(config, &*backend)?;
    let stats = if recovery.exists() {
        tracing::warn!(
            path = %backend.path().display(),
            "Found write-ahead log from an earlier session; replaying"
        );
        Some(recovery.recover(backend, IoMode::Collective, config.flush_limit())?)
    } else {
        None
    };
    // the shared data log is removed once every process is done reading it
    if recovery.is_shared() {
        backend.barrier()?;
    }
    if stats.is_some() {
        recovery.discard()?;
    }
    Ok(stats)
}
