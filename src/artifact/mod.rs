//! Build artifacts and their naming convention
//!
//! Artifact file names follow `{package}-{version}-{runtime-tag}-{platform-tag}.{ext}`.
//! The runtime tag may itself contain dashes (`cp37-cp37m`); the platform tag
//! is always the last dash-separated segment and the extension starts at its
//! first dot, so `numpy-1.16.0-cp37-cp37m-linux_x86_64.whl` splits into
//! `numpy`, `1.16.0`, `cp37-cp37m`, `linux_x86_64` and `whl`.

pub mod builder;
pub mod exchange;
pub mod transform;

pub use builder::{ArtifactBuilder, CommandBuilder};
pub use exchange::{ArtifactExchange, Collection};
pub use transform::{TransformRule, Transformer};

use crate::error::{RiggerError, RiggerResult};
use crate::matrix::CellId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Parsed artifact file name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactName {
    pub package: String,
    pub version: String,
    pub runtime_tag: String,
    pub platform_tag: String,
    pub ext: String,
}

impl ArtifactName {
    pub fn parse(file_name: &str) -> RiggerResult<Self> {
        let invalid = |reason: &str| RiggerError::ArtifactName {
            name: file_name.to_string(),
            reason: reason.to_string(),
        };

        if file_name.contains(['/', '\\']) {
            return Err(invalid("must be a bare file name"));
        }

        let (head, last) = file_name
            .rsplit_once('-')
            .ok_or_else(|| invalid("expected {package}-{version}-{runtime}-{platform}.{ext}"))?;
        let (platform_tag, ext) = last
            .split_once('.')
            .ok_or_else(|| invalid("missing file extension"))?;

        let mut parts = head.splitn(3, '-');
        let (Some(package), Some(version), Some(runtime_tag)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid(
                "expected {package}-{version}-{runtime}-{platform}.{ext}",
            ));
        };

        let name = Self {
            package: package.to_string(),
            version: version.to_string(),
            runtime_tag: runtime_tag.to_string(),
            platform_tag: platform_tag.to_string(),
            ext: ext.to_string(),
        };
        if [&name.package, &name.version, &name.runtime_tag, &name.platform_tag, &name.ext]
            .iter()
            .any(|part| part.is_empty())
        {
            return Err(invalid("empty name component"));
        }
        Ok(name)
    }

    /// Same name with a different platform tag
    pub fn with_platform_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            platform_tag: tag.into(),
            ..self.clone()
        }
    }

    pub fn file_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}.{}",
            self.package, self.version, self.runtime_tag, self.platform_tag, self.ext
        )
    }
}

impl TryFrom<String> for ArtifactName {
    type Error = RiggerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ArtifactName> for String {
    fn from(name: ArtifactName) -> Self {
        name.to_string()
    }
}

/// Immutable named binary produced by one cell
#[derive(Clone)]
pub struct Artifact {
    name: ArtifactName,
    platform: String,
    producer: CellId,
    digest: String,
    payload: Arc<[u8]>,
}

impl Artifact {
    pub fn new(
        name: ArtifactName,
        platform: impl Into<String>,
        producer: CellId,
        payload: impl Into<Arc<[u8]>>,
    ) -> Self {
        let payload = payload.into();
        Self {
            name,
            platform: platform.into(),
            producer,
            digest: payload_digest(&payload),
            payload,
        }
    }

    pub fn name(&self) -> &ArtifactName {
        &self.name
    }

    pub fn file_name(&self) -> String {
        self.name.file_name()
    }

    /// Value of the producing cell's platform axis
    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn producer(&self) -> &CellId {
        &self.producer
    }

    /// Hex SHA-256 of the payload
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// The same bytes under a new name; payload and digest are shared
    pub fn renamed(&self, name: ArtifactName) -> Self {
        Self {
            name,
            ..self.clone()
        }
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("name", &self.name.to_string())
            .field("platform", &self.platform)
            .field("producer", &self.producer)
            .field("digest", &self.digest)
            .field("size", &self.payload.len())
            .finish()
    }
}

fn payload_digest(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}
