//! Registry backends

use crate::artifact::{Artifact, ArtifactName};
use crate::error::{RiggerError, RiggerResult};
use crate::publish::RegistryToken;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use ureq::Agent;
use uuid::Uuid;

/// Why an upload was not accepted
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("file already exists")]
    AlreadyExists,

    #[error("{0}")]
    Rejected(String),
}

/// External system that artifacts are published to
#[async_trait]
pub trait Registry: Send + Sync {
    /// Human-readable location, safe to log
    fn describe(&self) -> String;

    /// Whether a file with this name and version is already present
    async fn exists(&self, name: &ArtifactName) -> RiggerResult<bool>;

    async fn upload(&self, artifact: &Artifact) -> Result<(), UploadError>;
}

/// Registry laid out on disk as `<root>/<package>/<version>/<file>`
///
/// Files are never replaced: a second upload of the same name reports
/// `AlreadyExists`, matching the behaviour of public package indexes.
#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
    root: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &ArtifactName) -> PathBuf {
        self.root
            .join(&name.package)
            .join(&name.version)
            .join(name.file_name())
    }
}

#[async_trait]
impl Registry for DirectoryRegistry {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn exists(&self, name: &ArtifactName) -> RiggerResult<bool> {
        tokio::fs::try_exists(self.path_for(name))
            .await
            .map_err(|e| RiggerError::io(format!("checking {}", name), e))
    }

    async fn upload(&self, artifact: &Artifact) -> Result<(), UploadError> {
        let dest = self.path_for(artifact.name());
        let rejected = |e: io::Error| UploadError::Rejected(format!("{}: {e}", dest.display()));

        let parent = dest.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent).await.map_err(rejected)?;

        // Write aside, then hard-link into place: the link fails if the name
        // is taken, so a file appears whole or not at all.
        let tmp = parent.join(format!(".upload-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, artifact.payload())
            .await
            .map_err(rejected)?;
        let linked = tokio::fs::hard_link(&tmp, &dest).await;
        let _ = tokio::fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(UploadError::AlreadyExists),
            Err(e) => Err(rejected(e)),
        }
    }
}

/// HTTP registry speaking a simple `HEAD`/`PUT` protocol on
/// `<base>/<package>/<version>/<file>`, authenticated with a bearer token
pub struct HttpRegistry {
    base_url: String,
    token: RegistryToken,
    agent: Agent,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>, token: RegistryToken, timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            agent: Agent::new_with_config(config),
        }
    }

    fn url_for(&self, name: &ArtifactName) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_url,
            name.package,
            name.version,
            name.file_name()
        )
    }

    fn authorization(&self) -> String {
        format!("Bearer {}", self.token.expose())
    }
}

/// Classify an upload response. 409, or 400 whose body says the file already
/// exists, means the registry already has it.
fn classify_upload(status: u16, body: &str) -> Result<(), UploadError> {
    match status {
        200..=299 => Ok(()),
        409 => Err(UploadError::AlreadyExists),
        400 if body.to_ascii_lowercase().contains("already exist") => {
            Err(UploadError::AlreadyExists)
        }
        _ => {
            let detail = body.lines().next().unwrap_or("").trim();
            Err(UploadError::Rejected(format!("HTTP {status} {detail}").trim_end().to_string()))
        }
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn exists(&self, name: &ArtifactName) -> RiggerResult<bool> {
        let url = self.url_for(name);
        let agent = self.agent.clone();
        let auth = self.authorization();

        let status = tokio::task::spawn_blocking(move || {
            agent
                .head(&url)
                .header("Authorization", &auth)
                .call()
                .map(|resp| resp.status().as_u16())
        })
        .await
        .map_err(|e| RiggerError::Internal(format!("registry worker failed: {e}")))?
        .map_err(|e| RiggerError::Registry(e.to_string()))?;

        debug!("HEAD {} -> {}", name, status);
        match status {
            200..=299 => Ok(true),
            404 | 410 => Ok(false),
            other => Err(RiggerError::Registry(format!("HEAD {name} returned {other}"))),
        }
    }

    async fn upload(&self, artifact: &Artifact) -> Result<(), UploadError> {
        let url = self.url_for(artifact.name());
        let agent = self.agent.clone();
        let auth = self.authorization();
        let payload = artifact.payload().to_vec();
        let digest = artifact.digest().to_string();

        let response = tokio::task::spawn_blocking(move || {
            let mut resp = agent
                .put(&url)
                .header("Authorization", &auth)
                .header("Content-Type", "application/octet-stream")
                .header("X-Content-Sha256", &digest)
                .send(&payload[..])?;
            let status = resp.status().as_u16();
            let body = resp.body_mut().read_to_string().unwrap_or_default();
            Ok::<_, ureq::Error>((status, body))
        })
        .await
        .map_err(|e| UploadError::Rejected(format!("registry worker failed: {e}")))?
        .map_err(|e| UploadError::Rejected(e.to_string()))?;

        let (status, body) = response;
        classify_upload(status, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{Binding, Cell};
    use tempfile::TempDir;

    fn artifact(file: &str) -> Artifact {
        let cell = Cell::new(0, Binding::new(vec![("os".to_string(), "linux".to_string())]));
        Artifact::new(ArtifactName::parse(file).unwrap(), "linux", cell.id, b"bytes".to_vec())
    }

    #[tokio::test]
    async fn directory_registry_is_create_once() {
        let dir = TempDir::new().unwrap();
        let registry = DirectoryRegistry::new(dir.path());
        let wheel = artifact("pkg-1.0-cp38-manylinux1.whl");

        assert!(!registry.exists(wheel.name()).await.unwrap());
        registry.upload(&wheel).await.unwrap();
        assert!(registry.exists(wheel.name()).await.unwrap());
        assert_eq!(registry.upload(&wheel).await, Err(UploadError::AlreadyExists));

        let stored = dir.path().join("pkg/1.0/pkg-1.0-cp38-manylinux1.whl");
        assert_eq!(std::fs::read(stored).unwrap(), b"bytes");
    }

    #[test]
    fn upload_status_classification() {
        assert_eq!(classify_upload(201, ""), Ok(()));
        assert_eq!(classify_upload(409, ""), Err(UploadError::AlreadyExists));
        assert_eq!(
            classify_upload(400, "400 File already exists. See /help"),
            Err(UploadError::AlreadyExists)
        );
        assert_eq!(
            classify_upload(400, "Invalid distribution"),
            Err(UploadError::Rejected("HTTP 400 Invalid distribution".to_string()))
        );
        assert_eq!(
            classify_upload(503, ""),
            Err(UploadError::Rejected("HTTP 503".to_string()))
        );
    }

    #[test]
    fn urls_follow_package_layout() {
        let registry = HttpRegistry::new(
            "https://upload.example.org/",
            RegistryToken::new("secret"),
            Duration::from_secs(5),
        );
        let name = ArtifactName::parse("pkg-1.0-cp38-win_amd64.whl").unwrap();
        assert_eq!(
            registry.url_for(&name),
            "https://upload.example.org/pkg/1.0/pkg-1.0-cp38-win_amd64.whl"
        );
        assert_eq!(registry.describe(), "https://upload.example.org");
    }
}
