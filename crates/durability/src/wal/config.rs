//! Log configuration.
//!
//! Settings come from three places, all producing the same [`LogConfig`]:
//! builder methods, a TOML file, or the dataset open hints.
//!
//! # Example
//!
//! ```toml
//! # Where the per-process log pair is written
//! log_dir = "/local/scratch/bb"
//! # Replay memory budget in bytes; 0 = unbounded
//! flush_buffer_size = 67108864
//! # One data log per dataset, interleaved by block across processes
//! shared_log = true
//! verify_on_write = false
//! ```
//!
//! # Hints
//!
//! Hint keys use the `nc_dw_` prefix. The older `nc_bb_` spellings are
//! accepted for the keys that had them. Switch values are `enable` or
//! `disable`, in any case.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Hint announcing the logging driver; exported, ignored on input.
pub const HINT_DRIVER: &str = "nc_dw_driver";
/// Hint naming the log directory.
pub const HINT_DIRNAME: &str = "nc_dw_dirname";
/// Hint allowing an existing log pair to be reused.
pub const HINT_OVERWRITE: &str = "nc_dw_overwrite";
/// Hint sharing one data log between the processes of a dataset.
pub const HINT_SHAREDLOG: &str = "nc_dw_sharedlog";
/// Hint turning on verify-on-write.
pub const HINT_CHECK: &str = "nc_dw_check";
/// Hint controlling deletion of the log pair on close.
pub const HINT_DEL_ON_CLOSE: &str = "nc_dw_del_on_close";
/// Hint setting the replay memory budget.
pub const HINT_FLUSH_BUFFER_SIZE: &str = "nc_dw_flush_buffer_size";
/// Hint controlling flush before reads.
pub const HINT_FLUSH_ON_READ: &str = "nc_dw_flush_on_read";
/// Hint controlling flush on sync.
pub const HINT_FLUSH_ON_SYNC: &str = "nc_dw_flush_on_sync";

/// Default block size of a shared data log (8 MiB).
pub const DEFAULT_SHARED_BLOCK_SIZE: u64 = 8 * 1024 * 1024;

/// Map an `nc_bb_` key to its `nc_dw_` name.
fn canonical_key(key: &str) -> &str {
    match key {
        "nc_bb_dirname" => HINT_DIRNAME,
        "nc_bb_overwrite" => HINT_OVERWRITE,
        "nc_bb_check" => HINT_CHECK,
        "nc_bb_del_on_close" => HINT_DEL_ON_CLOSE,
        "nc_bb_flush_buffer_size" => HINT_FLUSH_BUFFER_SIZE,
        other => other,
    }
}

/// Log configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory for the log pair (default: current directory).
    pub log_dir: PathBuf,

    /// Reuse an existing log pair instead of failing (default: false).
    pub overwrite: bool,

    /// Remove the log pair once flushed and closed (default: true).
    pub delete_on_close: bool,

    /// Replay memory budget in bytes; 0 means unbounded (default: 0).
    pub flush_buffer_size: u64,

    /// Re-read every appended entry from disk and compare (default: false).
    ///
    /// Doubles the metadata I/O; meant for debugging.
    pub verify_on_write: bool,

    /// Flush before any read of the dataset (default: true).
    pub flush_on_read: bool,

    /// Flush on sync (default: true).
    pub flush_on_sync: bool,

    /// Share one data log between all processes of the dataset
    /// (default: false).
    ///
    /// Each process owns every `num_procs`-th block of the shared file.
    pub shared_log: bool,

    /// Block size of a shared data log in bytes (default: 8 MiB).
    pub shared_block_size: u64,

    /// Data log write buffer in bytes; 0 writes every payload through
    /// (default: 0).
    ///
    /// Payloads still in the buffer when a process dies are lost, and
    /// recovery treats their entries as uncommitted.
    pub data_buffer_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            log_dir: PathBuf::from("."),
            overwrite: false,
            delete_on_close: true,
            flush_buffer_size: 0,
            verify_on_write: false,
            flush_on_read: true,
            flush_on_sync: true,
            shared_log: false,
            shared_block_size: DEFAULT_SHARED_BLOCK_SIZE,
            data_buffer_size: 0,
        }
    }
}

fn parse_switch(key: &str, value: &str) -> Result<bool, LogConfigError> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("enable") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("disable") {
        Ok(false)
    } else {
        Err(LogConfigError::InvalidHint {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// Parse a byte count: decimal or `0x` hexadecimal, optionally signed.
/// Negative budgets mean "no limit" and clamp to 0.
fn parse_size(key: &str, value: &str) -> Result<u64, LogConfigError> {
    let invalid = || LogConfigError::InvalidHint {
        key: key.to_string(),
        value: value.to_string(),
    };
    let trimmed = value.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let size = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    }
    .map_err(|_| invalid())?;
    Ok(if negative { 0 } else { size })
}

impl LogConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log directory (builder pattern).
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Allow reusing an existing log pair (builder pattern).
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Set delete-on-close (builder pattern).
    pub fn with_delete_on_close(mut self, delete: bool) -> Self {
        self.delete_on_close = delete;
        self
    }

    /// Set the replay memory budget (builder pattern).
    pub fn with_flush_buffer_size(mut self, bytes: u64) -> Self {
        self.flush_buffer_size = bytes;
        self
    }

    /// Set verify-on-write (builder pattern).
    pub fn with_verify_on_write(mut self, verify: bool) -> Self {
        self.verify_on_write = verify;
        self
    }

    /// Set flush-on-read (builder pattern).
    pub fn with_flush_on_read(mut self, flush: bool) -> Self {
        self.flush_on_read = flush;
        self
    }

    /// Set flush-on-sync (builder pattern).
    pub fn with_flush_on_sync(mut self, flush: bool) -> Self {
        self.flush_on_sync = flush;
        self
    }

    /// Share the data log between processes (builder pattern).
    pub fn with_shared_log(mut self, shared: bool) -> Self {
        self.shared_log = shared;
        self
    }

    /// Set the shared data log block size (builder pattern).
    pub fn with_shared_block_size(mut self, bytes: u64) -> Self {
        self.shared_block_size = bytes;
        self
    }

    /// Set the data log write buffer size (builder pattern).
    pub fn with_data_buffer_size(mut self, bytes: u64) -> Self {
        self.data_buffer_size = bytes;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), LogConfigError> {
        if self.log_dir.as_os_str().is_empty() {
            return Err(LogConfigError::EmptyLogDir);
        }
        if self.shared_block_size == 0 {
            return Err(LogConfigError::ZeroBlockSize);
        }
        Ok(())
    }

    /// Replay budget as an optional limit.
    pub fn flush_limit(&self) -> Option<u64> {
        if self.flush_buffer_size > 0 {
            Some(self.flush_buffer_size)
        } else {
            None
        }
    }

    /// Apply dataset open hints on top of the defaults.
    pub fn from_hints<'a, I>(hints: I) -> Result<Self, LogConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        LogConfig::default().apply_hints(hints)
    }

    /// Apply dataset open hints on top of this configuration.
    ///
    /// Unknown keys are ignored so hints meant for other layers can be
    /// passed through unchanged.
    pub fn apply_hints<'a, I>(self, hints: I) -> Result<Self, LogConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = self;
        for (key, value) in hints {
            match canonical_key(key) {
                HINT_DIRNAME => config.log_dir = PathBuf::from(value),
                HINT_OVERWRITE => config.overwrite = parse_switch(key, value)?,
                HINT_SHAREDLOG => config.shared_log = parse_switch(key, value)?,
                HINT_CHECK => config.verify_on_write = parse_switch(key, value)?,
                HINT_DEL_ON_CLOSE => config.delete_on_close = parse_switch(key, value)?,
                HINT_FLUSH_ON_READ => config.flush_on_read = parse_switch(key, value)?,
                HINT_FLUSH_ON_SYNC => config.flush_on_sync = parse_switch(key, value)?,
                HINT_FLUSH_BUFFER_SIZE => config.flush_buffer_size = parse_size(key, value)?,
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Settings that differ from the defaults, as hint key/value pairs.
    ///
    /// Always starts with `nc_dw_driver=enable`.
    pub fn export_hints(&self) -> Vec<(String, String)> {
        let defaults = LogConfig::default();
        let mut hints = vec![(HINT_DRIVER.to_string(), "enable".to_string())];
        let mut set = |key: &str, value: &str| hints.push((key.to_string(), value.to_string()));

        if self.overwrite {
            set(HINT_OVERWRITE, "enable");
        }
        if self.shared_log {
            set(HINT_SHAREDLOG, "enable");
        }
        if self.verify_on_write {
            set(HINT_CHECK, "enable");
        }
        if !self.delete_on_close {
            set(HINT_DEL_ON_CLOSE, "disable");
        }
        if self.log_dir != defaults.log_dir {
            set(HINT_DIRNAME, &self.log_dir.display().to_string());
        }
        if self.flush_buffer_size > 0 {
            set(HINT_FLUSH_BUFFER_SIZE, &self.flush_buffer_size.to_string());
        }
        if !self.flush_on_read {
            set(HINT_FLUSH_ON_READ, "disable");
        }
        if !self.flush_on_sync {
            set(HINT_FLUSH_ON_SYNC, "disable");
        }
        hints
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, LogConfigError> {
        let config: LogConfig =
            toml::from_str(content).map_err(|e| LogConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, LogConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LogConfigError::Io(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Serialize to TOML and write to `path`.
    pub fn write_to_file(&self, path: &Path) -> Result<(), LogConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| LogConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| {
            LogConfigError::Io(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Create a configuration suited to tests: checks on, files kept in `dir`.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        LogConfig {
            log_dir: dir.into(),
            verify_on_write: true,
            ..LogConfig::default()
        }
    }
}

/// Log configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogConfigError {
    /// Log directory is empty.
    #[error("Log directory must not be empty")]
    EmptyLogDir,

    /// Shared data log block size is zero.
    #[error("Shared log block size must be positive")]
    ZeroBlockSize,

    /// A recognised hint has an unusable value.
    #[error("Invalid value '{value}' for hint '{key}'")]
    InvalidHint {
        /// Hint key
        key: String,
        /// Rejected value
        value: String,
    },

    /// Config file could not be parsed or serialized.
    #[error("Config parse error: {0}")]
    Parse(String),

    /// Config file could not be read or written.
    #[error("Config I/O error: {0}")]
    Io(String),
}

impl From<LogConfigError> for stagelog_core::LogError {
    fn from(e: LogConfigError) -> Self {
        stagelog_core::LogError::InvalidArgument(e.to_string())
    }
}
