//! Run event log
//!
//! Appends JSON lines to `~/.local/state/rigger/events.log`: cell start and
//! finish, cache hits and misses, publish records. Registry tokens never
//! reach this file.

use crate::config::{schema::Config, ConfigManager};
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// File-based event logger that appends JSON lines
pub struct EventLog {
    enabled: bool,
    path: PathBuf,
    /// Serializes appends from concurrently running cells
    write_lock: Mutex<()>,
}

impl EventLog {
    /// Create a new event logger from config
    pub fn new(config: &Config) -> Self {
        Self::at(ConfigManager::event_log_path(), config.general.event_log)
    }

    pub fn at(path: PathBuf, enabled: bool) -> Self {
        Self {
            enabled,
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// A logger that records nothing
    pub fn disabled() -> Self {
        Self::at(PathBuf::new(), false)
    }

    /// Log an event as a JSON line
    ///
    /// IO failures are reported as warnings and otherwise ignored.
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize event: {}", e);
                return;
            }
        };
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.append(&line).await {
            warn!("Failed to write event log: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
