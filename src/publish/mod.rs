//! Publishing a downloaded collection to a registry
//!
//! Every artifact gets exactly one [`PublishRecord`]. An artifact the registry
//! already has is skipped, not failed, so release runs can be repeated. One
//! failing artifact never stops the others from being attempted.

pub mod registry;

pub use registry::{DirectoryRegistry, HttpRegistry, Registry, UploadError};

use crate::artifact::Artifact;
use crate::error::{RiggerError, RiggerResult};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Opaque registry credential
///
/// Never printed: both `Debug` and `Display` redact the value.
#[derive(Clone)]
pub struct RegistryToken(String);

impl RegistryToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Read the token from environment variable `var`
    pub fn from_env(var: &str) -> RiggerResult<Self> {
        match std::env::var(var) {
            Ok(token) if !token.trim().is_empty() => Ok(Self(token.trim().to_string())),
            _ => Err(RiggerError::TokenMissing(var.to_string())),
        }
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RegistryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RegistryToken(***)")
    }
}

impl fmt::Display for RegistryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyExists,
}

/// Result of publishing one artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishOutcome {
    Published,
    Skipped { reason: SkipReason },
    Failed { reason: String },
}

impl PublishOutcome {
    pub fn already_exists() -> Self {
        Self::Skipped {
            reason: SkipReason::AlreadyExists,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::Skipped { .. } => "skipped (exists)",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishRecord {
    pub artifact: String,
    pub producer: String,
    pub digest: String,
    #[serde(flatten)]
    pub outcome: PublishOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishReport {
    pub registry: String,
    pub records: Vec<PublishRecord>,
}

impl PublishReport {
    /// Success unless some artifact failed for a reason other than existing
    pub fn is_success(&self) -> bool {
        !self.records.iter().any(|r| r.outcome.is_failed())
    }

    pub fn published_count(&self) -> usize {
        self.count(|o| matches!(o, PublishOutcome::Published))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|o| matches!(o, PublishOutcome::Skipped { .. }))
    }

    pub fn failed_count(&self) -> usize {
        self.count(PublishOutcome::is_failed)
    }

    fn count(&self, f: impl Fn(&PublishOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| f(&r.outcome)).count()
    }
}

pub struct Publisher {
    registry: Arc<dyn Registry>,
    skip_existing: bool,
    concurrency: usize,
}

impl Publisher {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            skip_existing: true,
            concurrency: 4,
        }
    }

    /// With `false`, an artifact that already exists is a failure
    pub fn skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Attempt every artifact; records come back in input order
    pub async fn publish_all(&self, artifacts: Vec<Artifact>) -> PublishReport {
        info!(
            "Publishing {} artifact(s) to {}",
            artifacts.len(),
            self.registry.describe()
        );

        let records = stream::iter(artifacts)
            .map(|artifact| async move {
                let outcome = self.publish_one(&artifact).await;
                match &outcome {
                    PublishOutcome::Failed { reason } => {
                        warn!("{}: publish failed: {}", artifact.file_name(), reason)
                    }
                    other => info!("{}: {}", artifact.file_name(), other.label()),
                }
                PublishRecord {
                    artifact: artifact.file_name(),
                    producer: artifact.producer().to_string(),
                    digest: artifact.digest().to_string(),
                    outcome,
                }
            })
            .buffered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        PublishReport {
            registry: self.registry.describe(),
            records,
        }
    }

    async fn publish_one(&self, artifact: &Artifact) -> PublishOutcome {
        if self.skip_existing {
            match self.registry.exists(artifact.name()).await {
                Ok(true) => return PublishOutcome::already_exists(),
                Ok(false) => {}
                // The upload itself will report an existing file
                Err(e) => warn!("{}: existence check failed: {}", artifact.file_name(), e),
            }
        }

        match self.registry.upload(artifact).await {
            Ok(()) => PublishOutcome::Published,
            Err(UploadError::AlreadyExists) if self.skip_existing => {
                PublishOutcome::already_exists()
            }
            Err(e) => PublishOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }
}
