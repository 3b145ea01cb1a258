//! Platform tag rewriting for registry compatibility

use crate::artifact::Artifact;
use crate::error::{RiggerError, RiggerResult};
use crate::matrix::Binding;
use crate::step::Predicate;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Tag mapping applied to artifacts from cells matching `when`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRule {
    pub when: Predicate,
    /// Produced tag -> accepted tag
    pub platform_tags: BTreeMap<String, String>,
}

impl TransformRule {
    pub fn new(when: Predicate) -> Self {
        Self {
            when,
            platform_tags: BTreeMap::new(),
        }
    }

    pub fn map(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.platform_tags.insert(from.into(), to.into());
        self
    }
}

/// Rewrites artifact names so their platform tags are in the registry's
/// accepted vocabulary. Payloads are never touched.
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    rules: Vec<TransformRule>,
    accepted: BTreeSet<String>,
}

impl Transformer {
    /// Mapping targets are always part of the accepted vocabulary
    pub fn new(rules: Vec<TransformRule>, accepted: impl IntoIterator<Item = String>) -> Self {
        let mut accepted: BTreeSet<String> = accepted.into_iter().collect();
        for rule in &rules {
            accepted.extend(rule.platform_tags.values().cloned());
        }
        Self { rules, accepted }
    }

    pub fn rules(&self) -> &[TransformRule] {
        &self.rules
    }

    pub fn is_accepted(&self, tag: &str) -> bool {
        self.accepted.contains(tag)
    }

    /// Apply the rules matching the producing cell's binding.
    ///
    /// When no rule matches the artifact passes through unchanged. When one
    /// does, the tag must either be accepted already or be mapped by a
    /// matching rule; anything else is a mismatch.
    pub fn apply(&self, artifact: Artifact, binding: &Binding) -> RiggerResult<Artifact> {
        let matching: Vec<&TransformRule> = self
            .rules
            .iter()
            .filter(|r| r.when.evaluate(binding))
            .collect();
        if matching.is_empty() {
            return Ok(artifact);
        }

        let tag = artifact.name().platform_tag.clone();
        if self.is_accepted(&tag) {
            debug!("{} already carries accepted tag {}", artifact.file_name(), tag);
            return Ok(artifact);
        }

        let Some(target) = matching.iter().find_map(|r| r.platform_tags.get(&tag)) else {
            return Err(RiggerError::ArtifactTransformMismatch {
                artifact: artifact.file_name(),
                tag,
            });
        };

        let renamed = artifact.renamed(artifact.name().with_platform_tag(target));
        info!("Retagged {} as {}", artifact.file_name(), renamed.file_name());
        Ok(renamed)
    }
}
