//! Configuration for the ledger store

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Replay and check the whole chain when opening
    pub verify_on_open: bool,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            verify_on_open: false,
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Compress entry values with LZ4
    pub compress: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 2,
            max_background_jobs: 2,
            compress: true,
            enable_statistics: false,
        }
    }
}

impl StoreConfig {
    /// Store rooted at `data_dir` with default tuning
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Check values RocksDB would reject
    pub fn validate(&self) -> crate::Result<()> {
        if self.rocksdb.write_buffer_size_mb == 0 {
            return Err(crate::StoreError::Config(
                "write_buffer_size_mb must be positive".to_string(),
            ));
        }
        if self.rocksdb.max_write_buffer_number < 1 {
            return Err(crate::StoreError::Config(
                "max_write_buffer_number must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
