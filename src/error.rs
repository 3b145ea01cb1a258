//! Error types for Rigger
//!
//! All modules use `RiggerResult<T>` as their return type. A cache miss and a
//! skip-existing publish are expected control flow and never appear here.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for Rigger operations
pub type RiggerResult<T> = Result<T, RiggerError>;

/// All errors that can occur in Rigger
#[derive(Error, Debug)]
pub enum RiggerError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Pipeline file not found: {0}")]
    PipelineNotFound(PathBuf),

    #[error("Invalid pipeline definition: {0}")]
    PipelineInvalid(String),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Matrix errors
    #[error("Invalid matrix: {0}")]
    MatrixInvalid(String),

    // Cache errors
    #[error("Cache key template {template:?}: {reason}")]
    CacheKeyTemplate { template: String, reason: String },

    #[error("Cache entry {key} is corrupt: {reason}")]
    CacheCorrupt { key: String, reason: String },

    #[error("Dependency installation failed: {0}")]
    DependencyInstall(String),

    // Step errors
    #[error("Step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Step '{step}' timed out after {}s", .limit.as_secs())]
    StepTimeout { step: String, limit: Duration },

    // Artifact errors
    #[error("Invalid artifact name {name:?}: {reason}")]
    ArtifactName { name: String, reason: String },

    #[error("Build produced no usable artifact: {0}")]
    BuildOutput(String),

    #[error("No platform tag mapping for '{tag}' (artifact {artifact})")]
    ArtifactTransformMismatch { artifact: String, tag: String },

    // Exchange errors
    #[error("Unknown artifact collection: {0}")]
    ExchangeUnknown(String),

    #[error("Producer {producer} is not part of collection {collection}")]
    ExchangeProducer { collection: String, producer: String },

    #[error("Producer {producer} already uploaded to collection {collection}")]
    ExchangeConflict { collection: String, producer: String },

    #[error("Collection {collection} is incomplete, missing: {}", .missing.join(", "))]
    ExchangeIncomplete {
        collection: String,
        missing: Vec<String>,
    },

    #[error("Timed out waiting for collection {0}")]
    ExchangeTimeout(String),

    #[error("Two producers uploaded different content as {0}")]
    ArtifactCollision(String),

    // Publish errors
    #[error("Registry token not set (expected in ${0})")]
    TokenMissing(String),

    #[error("Registry error: {0}")]
    Registry(String),

    // Pipeline outcome
    #[error("Pipeline failed: {failed_cells} cell(s) failed, {failed_artifacts} artifact(s) not published")]
    PipelineFailed {
        failed_cells: usize,
        failed_artifacts: usize,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {}\n{output}", .code.map_or("signal".to_string(), |c| format!("status {c}")))]
    CommandExit {
        command: String,
        code: Option<i32>,
        output: String,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // Terminal interaction
    #[error("Prompt failed: {0}")]
    Prompt(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RiggerError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a step failure
    pub fn step(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error terminates the cell it occurred in.
    ///
    /// Errors outside this set are configuration or host problems that abort
    /// the whole pipeline run.
    pub fn is_cell_fatal(&self) -> bool {
        matches!(
            self,
            Self::DependencyInstall(_)
                | Self::StepFailed { .. }
                | Self::StepTimeout { .. }
                | Self::BuildOutput(_)
                | Self::ArtifactName { .. }
                | Self::ArtifactTransformMismatch { .. }
                | Self::CacheCorrupt { .. }
                | Self::CommandFailed { .. }
                | Self::CommandExit { .. }
                | Self::ExchangeConflict { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::PipelineNotFound(_) => Some("Create a rigger.toml or pass --pipeline <FILE>"),
            Self::TokenMissing(_) => Some("Export the registry token or set publish.token_env"),
            Self::ArtifactTransformMismatch { .. } => {
                Some("Add the tag to a [[transform]] platform_tags table or to publish.accepted_tags")
            }
            Self::CacheCorrupt { .. } => Some("Run: rigger cache clear --yes"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = RiggerError::ArtifactTransformMismatch {
            artifact: "pkg-1.0-cp37-linux_i686.whl".to_string(),
            tag: "linux_i686".to_string(),
        };
        assert!(err.to_string().contains("No platform tag mapping for 'linux_i686'"));
    }

    #[test]
    fn error_hint() {
        let err = RiggerError::TokenMissing("TOKEN".to_string());
        assert!(err.hint().is_some());
        assert!(RiggerError::Internal("x".to_string()).hint().is_none());
    }

    #[test]
    fn cell_fatal_classification() {
        assert!(RiggerError::DependencyInstall("pip".to_string()).is_cell_fatal());
        assert!(RiggerError::step("test", "exit 1").is_cell_fatal());
        assert!(!RiggerError::MatrixInvalid("empty".to_string()).is_cell_fatal());
        assert!(!RiggerError::TokenMissing("T".to_string()).is_cell_fatal());
    }

    #[test]
    fn incomplete_lists_missing_producers() {
        let err = RiggerError::ExchangeIncomplete {
            collection: "dist".to_string(),
            missing: vec!["os=linux".to_string(), "os=macos".to_string()],
        };
        assert!(err.to_string().ends_with("os=linux, os=macos"));
    }

    #[test]
    fn timeout_display_uses_seconds() {
        let err = RiggerError::StepTimeout {
            step: "test".to_string(),
            limit: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "Step 'test' timed out after 90s");
    }
}
