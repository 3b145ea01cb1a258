//! Configuration schema for Rigger
//!
//! Configuration is stored at `~/.config/rigger/config.toml`. It holds
//! host-level defaults; anything a pipeline file sets takes precedence.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Dependency cache settings
    pub cache: CacheConfig,

    /// Phase time limits
    pub timeouts: TimeoutConfig,

    /// Matrix scheduling defaults
    pub matrix: MatrixConfig,

    /// Registry defaults
    pub publish: PublishConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Append run events to the state directory's events.log
    pub event_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            event_log: true,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache location (default: state directory)
    pub dir: Option<PathBuf>,

    /// Entries older than N days read as misses (0 = never expire)
    pub max_age_days: u32,

    /// Default age for `rigger cache gc`
    pub gc_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_age_days: 0,
            gc_days: 30,
        }
    }
}

/// Time limits, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Dependency installation on a cache miss
    pub install_secs: u64,

    /// Default per-step limit
    pub step_secs: u64,

    /// Waiting for every cell to deliver its artifacts
    pub download_secs: u64,
}

impl TimeoutConfig {
    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }

    pub fn step(&self) -> Duration {
        Duration::from_secs(self.step_secs)
    }

    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            install_secs: 1800,
            step_secs: 3600,
            download_secs: 600,
        }
    }
}

/// Matrix scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// Cells running at once when the pipeline does not say
    pub max_parallel: usize,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self { max_parallel: 4 }
    }
}

/// Publish configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Registry URL or directory used when the pipeline names none
    pub registry: Option<String>,

    /// Environment variable holding the registry token
    pub token_env: String,

    /// Treat files the registry already has as skipped
    pub skip_existing: bool,

    /// Uploads in flight at once
    pub concurrency: usize,

    /// Per-request limit for HTTP registries
    pub timeout_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            registry: None,
            token_env: "RIGGER_REGISTRY_TOKEN".to_string(),
            skip_existing: true,
            concurrency: 4,
            timeout_secs: 120,
        }
    }
}
