//! Pipeline file (`rigger.toml`) schema and validation
//!
//! ```toml
//! [package]
//! name = "cornac"
//!
//! [matrix]
//! fail_fast = false
//! [[matrix.axis]]
//! name = "os"
//! values = ["linux", "macos", "windows"]
//!
//! [dependencies]
//! key = "deps-{os}-{runtime}-{branch}-v{generation}"
//! paths = [".venv"]
//! install = ["python -m venv $RIGGER_CELL_DIR/.venv"]
//!
//! [[test.steps]]
//! uses = "install"
//! [[test.steps]]
//! name = "libomp"
//! run = "brew install libomp"
//! when = { os = "macos" }
//! ```

use crate::artifact::{TransformRule, Transformer};
use crate::cache::{check_cache_path, CacheKey, KeyVars, BUILTIN_KEY_VARS};
use crate::error::{RiggerError, RiggerResult};
use crate::matrix::{Binding, Matrix};
use crate::pipeline::PipelineKind;
use crate::step::{Condition, Guard, Severity, Step, StepAction};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name searched for by [`PipelineDefinition::discover`]
pub const PIPELINE_FILE: &str = "rigger.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub package: PackageDef,

    #[serde(default)]
    pub matrix: Matrix,

    pub dependencies: Option<DependenciesDef>,

    #[serde(default)]
    pub test: StageDef,

    #[serde(default)]
    pub release: StageDef,

    pub build: Option<BuildDef>,

    #[serde(default, rename = "transform")]
    pub transforms: Vec<TransformDef>,

    #[serde(default)]
    pub publish: PublishDef,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageDef {
    pub name: String,
}

/// Cache-backed dependency installation
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependenciesDef {
    /// Cache key template
    pub key: String,

    /// Bump to invalidate every entry written under older generations
    #[serde(default = "default_generation")]
    pub generation: u32,

    /// Paths below the cell directory that make up the cached state
    pub paths: Vec<String>,

    /// Commands run on a cache miss
    #[serde(default)]
    pub install: Vec<String>,

    pub timeout_secs: Option<u64>,

    /// Overrides `cache.max_age_days` from the host config
    pub max_age_days: Option<u32>,
}

fn default_generation() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDef {
    #[serde(default)]
    pub steps: Vec<StepDef>,

    /// Default per-step limit for this stage
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStep {
    Install,
    Build,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDef {
    pub name: Option<String>,
    pub run: Option<String>,
    pub uses: Option<BuiltinStep>,
    pub when: Option<Condition>,
    pub unless: Option<Condition>,
    #[serde(default = "default_required")]
    pub required: bool,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_required() -> bool {
    true
}

impl StepDef {
    pub fn to_step(&self) -> RiggerResult<Step> {
        let (action, default_name) = match (&self.run, self.uses) {
            (Some(command), None) => (
                StepAction::Run(command.clone()),
                command.lines().next().unwrap_or("run").trim().to_string(),
            ),
            (None, Some(BuiltinStep::Install)) => (StepAction::Install, "install".to_string()),
            (None, Some(BuiltinStep::Build)) => (StepAction::Build, "build".to_string()),
            _ => {
                return Err(RiggerError::PipelineInvalid(format!(
                    "step '{}' needs exactly one of `run` or `uses`",
                    self.name.as_deref().unwrap_or("?")
                )))
            }
        };

        Ok(Step {
            name: self.name.clone().unwrap_or(default_name),
            action,
            guard: Guard::from_tables(self.when.as_ref(), self.unless.as_ref()),
            severity: if self.required {
                Severity::Required
            } else {
                Severity::NonFatal
            },
            timeout: self.timeout_secs.map(Duration::from_secs),
            env: self.env.clone(),
        })
    }
}

/// How the release pipeline produces each cell's artifact
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildDef {
    /// Command that writes one artifact into `$RIGGER_DIST_DIR`
    pub run: String,

    #[serde(default = "default_extension")]
    pub extension: String,

    /// Axis whose value tags the artifact's platform
    #[serde(default = "default_platform_axis")]
    pub platform_axis: String,
}

fn default_extension() -> String {
    "whl".to_string()
}

fn default_platform_axis() -> String {
    "os".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformDef {
    /// Cells the rule applies to; empty means every cell
    #[serde(default)]
    pub when: Condition,
    pub platform_tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishDef {
    /// Registry URL (`http(s)://`) or directory; falls back to host config
    pub registry: Option<String>,
    pub token_env: Option<String>,
    pub skip_existing: Option<bool>,
    /// Platform tags the registry accepts as-is
    #[serde(default)]
    pub accepted_tags: Vec<String>,
    /// Exchange collection name
    #[serde(default = "default_collection")]
    pub collection: String,
    pub concurrency: Option<usize>,
}

fn default_collection() -> String {
    "dist".to_string()
}

impl Default for PublishDef {
    fn default() -> Self {
        Self {
            registry: None,
            token_env: None,
            skip_existing: None,
            accepted_tags: Vec::new(),
            collection: default_collection(),
            concurrency: None,
        }
    }
}

impl PipelineDefinition {
    /// Find `rigger.toml` in `start` or the nearest ancestor
    pub fn discover(start: &Path) -> RiggerResult<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(PIPELINE_FILE))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| RiggerError::PipelineNotFound(start.join(PIPELINE_FILE)))
    }

    pub async fn load(path: &Path) -> RiggerResult<Self> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RiggerError::PipelineNotFound(path.to_path_buf()))
            }
            Err(e) => {
                return Err(RiggerError::io(
                    format!("reading pipeline {}", path.display()),
                    e,
                ))
            }
        };
        Self::from_toml(&content).map_err(|e| match e {
            RiggerError::PipelineInvalid(reason) => {
                RiggerError::PipelineInvalid(format!("{}: {reason}", path.display()))
            }
            other => other,
        })
    }

    /// Parse and validate
    pub fn from_toml(content: &str) -> RiggerResult<Self> {
        let definition: Self =
            toml::from_str(content).map_err(|e| RiggerError::PipelineInvalid(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn stage(&self, kind: PipelineKind) -> &StageDef {
        match kind {
            PipelineKind::Test => &self.test,
            PipelineKind::Release => &self.release,
        }
    }

    pub fn steps(&self, kind: PipelineKind) -> RiggerResult<Vec<Step>> {
        self.stage(kind).steps.iter().map(StepDef::to_step).collect()
    }

    /// Variables for rendering the cache key of one cell
    pub fn key_vars(&self, binding: &Binding, branch: &str) -> KeyVars {
        let generation = self
            .dependencies
            .as_ref()
            .map_or_else(default_generation, |d| d.generation);
        let mut vars = KeyVars::for_cell(binding, branch, generation);
        vars.set("package", &self.package.name);
        vars.set("os_family", std::env::consts::FAMILY);
        vars
    }

    pub fn transformer(&self) -> Transformer {
        let rules = self
            .transforms
            .iter()
            .map(|t| TransformRule {
                when: t.when.to_predicate(),
                platform_tags: t.platform_tags.clone(),
            })
            .collect();
        Transformer::new(rules, self.publish.accepted_tags.iter().cloned())
    }

    pub fn validate(&self) -> RiggerResult<()> {
        let invalid = |reason: String| Err(RiggerError::PipelineInvalid(reason));

        if self.package.name.trim().is_empty() {
            return invalid("package.name is empty".to_string());
        }
        self.matrix.validate()?;
        if let Some(axis) = self
            .matrix
            .axes
            .iter()
            .find(|a| BUILTIN_KEY_VARS.contains(&a.name.as_str()))
        {
            return invalid(format!(
                "matrix axis '{}' clashes with a built-in cache key variable",
                axis.name
            ));
        }

        if self.test.steps.is_empty() && self.release.steps.is_empty() {
            return invalid("no steps in [test] or [release]".to_string());
        }

        for kind in [PipelineKind::Test, PipelineKind::Release] {
            let steps = self.steps(kind)?;
            let mut names = HashSet::new();
            for step in &steps {
                if !names.insert(step.name.as_str()) {
                    return invalid(format!("{kind} step '{}' declared twice", step.name));
                }
                if let Guard::When(predicate) = &step.guard {
                    predicate.check_axes(&self.matrix)?;
                }
                match step.action {
                    StepAction::Install if self.dependencies.is_none() => {
                        return invalid(format!(
                            "step '{}' uses install but [dependencies] is missing",
                            step.name
                        ))
                    }
                    StepAction::Build if kind == PipelineKind::Test => {
                        return invalid(format!(
                            "step '{}': build steps belong to the release pipeline",
                            step.name
                        ))
                    }
                    _ => {}
                }
            }

            let builds = steps
                .iter()
                .filter(|s| s.action == StepAction::Build)
                .count();
            if kind == PipelineKind::Release && !steps.is_empty() && builds != 1 {
                return invalid(format!(
                    "release pipeline needs exactly one build step, found {builds}"
                ));
            }
        }

        if let Some(deps) = &self.dependencies {
            if deps.paths.is_empty() {
                return invalid("dependencies.paths is empty".to_string());
            }
            for path in &deps.paths {
                check_cache_path(path)?;
            }
            let sample = Binding::new(
                self.matrix
                    .axes
                    .iter()
                    .map(|a| (a.name.clone(), a.values.first().cloned().unwrap_or_default()))
                    .collect(),
            );
            CacheKey::new(&deps.key).validate(&self.key_vars(&sample, "main"))?;
        }

        if !self.release.steps.is_empty() {
            let Some(build) = &self.build else {
                return invalid("release pipeline needs a [build] section".to_string());
            };
            if !self.matrix.axes.is_empty() && !self.matrix.has_axis(&build.platform_axis) {
                return invalid(format!(
                    "build.platform_axis '{}' is not a matrix axis",
                    build.platform_axis
                ));
            }
        }

        for transform in &self.transforms {
            transform.when.to_predicate().check_axes(&self.matrix)?;
        }

        Ok(())
    }
}
