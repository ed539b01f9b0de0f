use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default legacy key prefix used by the flat key-value store.
pub const DEFAULT_PREFIX: &str = "viking";

/// Default quota for the legacy key-value store (5 MiB, the usual
/// browser-local-storage budget the legacy data lived under).
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Default retention for recently completed optimistic moves.
pub const DEFAULT_RETENTION_MS: u64 = 5_000;

/// Configuration consumed by the storage core. Hosts construct one of these
/// and hand it to `DbHandle::acquire` / the engines.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the database and legacy store files.
    pub data_dir: PathBuf,
    /// Demo mode switches the database name and disables remote fetches.
    #[serde(default)]
    pub demo_mode: bool,
    /// Legacy key prefix, without the trailing underscore.
    #[serde(default = "default_prefix")]
    pub legacy_prefix: String,
    /// Byte quota for the legacy key-value store.
    #[serde(default = "default_quota")]
    pub quota_bytes: usize,
    /// Retention window for recently completed optimistic moves.
    #[serde(default = "default_retention")]
    pub retention_ms: u64,
    /// Bounded history size for the network status helper.
    #[serde(default = "default_history")]
    pub max_history_size: usize,
    /// Consecutive failed probes before the network helper reports offline.
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold: u32,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_quota() -> usize {
    DEFAULT_QUOTA_BYTES
}

fn default_retention() -> u64 {
    DEFAULT_RETENTION_MS
}

fn default_history() -> usize {
    10
}

fn default_offline_threshold() -> u32 {
    3
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            demo_mode: false,
            legacy_prefix: default_prefix(),
            quota_bytes: default_quota(),
            retention_ms: default_retention(),
            max_history_size: default_history(),
            offline_threshold: default_offline_threshold(),
        }
    }

    pub fn with_demo_mode(mut self, demo_mode: bool) -> Self {
        self.demo_mode = demo_mode;
        self
    }

    /// Database name; suffixed with `-demo` in demo mode so demo data never
    /// mixes with real data.
    pub fn database_name(&self) -> String {
        if self.demo_mode {
            "vikingbase-demo".to_string()
        } else {
            "vikingbase".to_string()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("{}.sqlite3", self.database_name()))
    }

    /// Persistence file for the legacy key-value store.
    pub fn legacy_store_path(&self) -> PathBuf {
        self.data_dir.join("legacy_kv.json")
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Fully qualified legacy key, e.g. `viking_last_sync`.
    pub fn legacy_key(&self, suffix: &str) -> String {
        format!("{}_{}", self.legacy_prefix, suffix)
    }
}
