//! EngineConfig - TOML 設定
//!
//! すべてのフィールドにデフォルトがあるので、空のファイルでも有効です。
//!
//! ```toml
//! [store]
//! kind = "sqlite"        # or "memory"
//! path = "extask.db"
//!
//! [lease]
//! default_lock_duration_ms = 30000
//! ```

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub lease: LeaseConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// SQLite のデータベースファイル（`kind = "memory"` では無視）
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Sqlite,
            path: PathBuf::from("extask.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// 呼び出し側が lock duration を指定しないときの lease 期間
    pub default_lock_duration_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_lock_duration_ms: 30_000,
        }
    }
}

impl LeaseConfig {
    pub fn default_lock_duration(&self) -> Duration {
        Duration::milliseconds(self.default_lock_duration_ms.min(i64::MAX as u64) as i64)
    }
}

/// ConfigError は設定の読み込みエラー
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }
}
