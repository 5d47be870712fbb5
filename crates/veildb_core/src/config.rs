//! Log layer configuration.

use std::path::PathBuf;
use std::time::Duration;

/// How value-log files are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingMode {
    /// Positional reads through the file descriptor.
    FileIo,
    /// Memory-mapped reads. Appends still go through the descriptor; the
    /// mapping is sized ahead of the write frontier and remapped when the
    /// frontier approaches its end.
    MemoryMap,
}

/// Configuration for opening the log manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding WAL segments, value-log segments and the registry.
    pub value_dir: PathBuf,

    /// Disables writes, deletions and key rotation.
    pub read_only: bool,

    /// Whether to fsync after every write batch (safer but slower).
    pub sync_writes: bool,

    /// Roll threshold for WAL and value-log files.
    pub value_log_file_size: u32,

    /// How value-log files are read.
    pub value_log_loading_mode: LoadingMode,

    /// Storage key wrapping the data keys at rest. Empty disables
    /// encryption; otherwise must be 16, 24 or 32 bytes.
    pub storage_key: Vec<u8>,

    /// How long a data key stays current before rotation.
    pub encryption_key_rotation: Duration,

    /// Values at most this long are stored inline in the WAL; longer values
    /// go to the value log and leave a pointer behind.
    pub value_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            value_dir: PathBuf::from("."),
            read_only: false,
            sync_writes: false,
            value_log_file_size: 512 * 1024 * 1024, // 512 MB
            value_log_loading_mode: LoadingMode::MemoryMap,
            storage_key: Vec::new(),
            encryption_key_rotation: Duration::from_secs(10 * 24 * 60 * 60), // 10 days
            value_threshold: 4096,
        }
    }
}

impl Config {
    /// Creates a configuration rooted at the given value directory.
    #[must_use]
    pub fn new(value_dir: impl Into<PathBuf>) -> Self {
        Self {
            value_dir: value_dir.into(),
            ..Self::default()
        }
    }

    /// Sets read-only mode.
    #[must_use]
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets whether to fsync after every write batch.
    #[must_use]
    pub fn sync_writes(mut self, value: bool) -> Self {
        self.sync_writes = value;
        self
    }

    /// Sets the roll threshold for log files.
    #[must_use]
    pub fn value_log_file_size(mut self, size: u32) -> Self {
        self.value_log_file_size = size;
        self
    }

    /// Sets the value-log loading mode.
    #[must_use]
    pub fn value_log_loading_mode(mut self, mode: LoadingMode) -> Self {
        self.value_log_loading_mode = mode;
        self
    }

    /// Sets the storage key. Empty disables encryption.
    #[must_use]
    pub fn storage_key(mut self, key: Vec<u8>) -> Self {
        self.storage_key = key;
        self
    }

    /// Sets the data-key rotation period.
    #[must_use]
    pub fn encryption_key_rotation(mut self, period: Duration) -> Self {
        self.encryption_key_rotation = period;
        self
    }

    /// Sets the WAL/value-log routing threshold.
    #[must_use]
    pub fn value_threshold(mut self, threshold: usize) -> Self {
        self.value_threshold = threshold;
        self
    }

    /// Whether at-rest encryption is configured.
    #[must_use]
    pub fn encryption_enabled(&self) -> bool {
        !self.storage_key.is_empty()
    }
}
