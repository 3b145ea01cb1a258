//! Conditional step execution within a cell
//!
//! Steps run strictly in declared order. A guard decides whether a step runs
//! for a given cell; a required step that fails aborts the cell, a non-fatal
//! one is logged and recorded.

pub mod command;
pub mod executor;
pub mod predicate;

pub use command::{CommandRunner, ShellRunner};
pub use executor::{CellRun, StepExecutor, StepHandler};
pub use predicate::{AxisMatch, Condition, Guard, Predicate};

use crate::matrix::Cell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// What a step does when it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Opaque shell command
    Run(String),
    /// Resolve dependencies through the cache
    Install,
    /// Produce the cell's artifact
    Build,
}

/// How a step failure affects its cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Required,
    NonFatal,
}

/// An ordered unit of work within a cell
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
    pub guard: Guard,
    pub severity: Severity,
    /// Overrides the executor's default limit
    pub timeout: Option<Duration>,
    /// Extra environment for `Run` steps
    pub env: BTreeMap<String, String>,
}

impl Step {
    pub fn run(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, StepAction::Run(command.into()))
    }

    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            action,
            guard: Guard::Always,
            severity: Severity::Required,
            timeout: None,
            env: BTreeMap::new(),
        }
    }

    pub fn when(mut self, predicate: Predicate) -> Self {
        self.guard = Guard::When(predicate);
        self
    }

    pub fn non_fatal(mut self) -> Self {
        self.severity = Severity::NonFatal;
        self
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }
}

/// Why a step did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Guard evaluated to false for this cell
    ConditionFalse,
    /// An earlier required step failed
    Aborted,
    /// The matrix was cancelled
    Cancelled,
}

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded { detail: Option<String> },
    Skipped { reason: SkipReason },
    Failed { reason: String },
    FailedNonFatal { reason: String },
}

impl StepOutcome {
    pub fn ran(&self) -> bool {
        !matches!(self, Self::Skipped { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub duration_ms: u64,
}

/// Per-cell execution environment
#[derive(Debug, Clone)]
pub struct CellContext {
    pub cell: Cell,
    /// Project checkout the cell directory was copied from
    pub workdir: PathBuf,
    /// Private copy of the checkout; commands run here and cache paths
    /// are relative to it
    pub cell_dir: PathBuf,
    /// Where the build step leaves its artifact
    pub dist_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl CellContext {
    pub fn new(
        cell: Cell,
        workdir: PathBuf,
        cell_dir: PathBuf,
        extra_env: &BTreeMap<String, String>,
    ) -> Self {
        let dist_dir = cell_dir.join("dist");
        let mut env = extra_env.clone();
        env.insert("RIGGER_CELL".to_string(), cell.id.to_string());
        env.insert(
            "RIGGER_CELL_DIR".to_string(),
            cell_dir.to_string_lossy().into_owned(),
        );
        env.insert(
            "RIGGER_DIST_DIR".to_string(),
            dist_dir.to_string_lossy().into_owned(),
        );
        for (axis, value) in cell.binding.iter() {
            env.insert(axis_env_name(axis), value.to_string());
        }

        Self {
            cell,
            workdir,
            cell_dir,
            dist_dir,
            env,
        }
    }
}

/// `runtime-version` becomes `RIGGER_RUNTIME_VERSION`
fn axis_env_name(axis: &str) -> String {
    let name: String = axis
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("RIGGER_{name}")
}
