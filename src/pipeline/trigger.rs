//! Trigger events and pipeline selection

use crate::error::{RiggerError, RiggerResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Which pipeline a trigger selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Test matrix on every push
    Test,
    /// Build, transform and publish on a published release
    Release,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test => f.write_str("test"),
            Self::Release => f.write_str("release"),
        }
    }
}

/// Event that starts a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Source revision being built
    pub revision: String,
    pub branch: String,
    #[serde(default)]
    pub release_published: bool,
}

impl TriggerEvent {
    pub fn new(revision: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
            branch: branch.into(),
            release_published: false,
        }
    }

    pub fn released(mut self) -> Self {
        self.release_published = true;
        self
    }

    pub fn kind(&self) -> PipelineKind {
        if self.release_published {
            PipelineKind::Release
        } else {
            PipelineKind::Test
        }
    }

    /// Read an event descriptor written as JSON
    pub async fn from_file(path: &Path) -> RiggerResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RiggerError::io(format!("reading event {}", path.display()), e))?;
        Ok(serde_json::from_str(&content)?)
    }
}
