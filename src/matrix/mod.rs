//! Build matrix declaration and expansion
//!
//! A matrix is a list of named axes. Expansion produces the Cartesian product
//! of all axis values as an ordered list of immutable [`Binding`]s, first axis
//! outermost, minus any declared exclusions.

pub mod orchestrator;

pub use orchestrator::{CancelToken, CellJob, CellReport, CellStatus, MatrixOutcome, Orchestrator};

use crate::error::{RiggerError, RiggerResult};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// A named matrix dimension with its ordered values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<String>,
}

impl MatrixAxis {
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Ordered assignment of one value to every axis of the matrix
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Binding(Vec<(String, String)>);

impl Binding {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    /// Value bound to `axis`, if the matrix declares it
    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every pair of a partial binding is present in this one
    pub fn contains(&self, partial: &BTreeMap<String, String>) -> bool {
        partial
            .iter()
            .all(|(axis, value)| self.get(axis) == Some(value.as_str()))
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "default");
        }
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl Serialize for Binding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (axis, value) in &self.0 {
            map.serialize_entry(axis, value)?;
        }
        map.end()
    }
}

/// Stable identity of a cell, derived from its binding
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system safe form of the id, used for per-cell work directories
    pub fn slug(&self) -> String {
        self.0
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
                _ => '_',
            })
            .collect()
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One element of the matrix product
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cell {
    /// Position in expansion order
    pub index: usize,
    pub id: CellId,
    pub binding: Binding,
}

impl Cell {
    pub fn new(index: usize, binding: Binding) -> Self {
        Self {
            index,
            id: CellId(binding.to_string()),
            binding,
        }
    }
}

/// Declarative matrix: axes, exclusions and scheduling policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matrix {
    #[serde(rename = "axis", default)]
    pub axes: Vec<MatrixAxis>,

    /// Partial bindings removed from the product
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, String>>,

    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,

    /// Maximum concurrently running cells (falls back to config)
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

fn default_fail_fast() -> bool {
    true
}

impl Default for Matrix {
    fn default() -> Self {
        Self::new(Vec::new(), default_fail_fast())
    }
}

impl Matrix {
    pub fn new(axes: Vec<MatrixAxis>, fail_fast: bool) -> Self {
        Self {
            axes,
            exclude: Vec::new(),
            fail_fast,
            max_parallel: None,
        }
    }

    /// Whether the matrix declares an axis with this name
    pub fn has_axis(&self, name: &str) -> bool {
        self.axes.iter().any(|a| a.name == name)
    }

    /// Check axis names, values and exclusions for consistency
    pub fn validate(&self) -> RiggerResult<()> {
        let mut names = HashSet::new();
        for axis in &self.axes {
            if axis.name.is_empty() {
                return Err(RiggerError::MatrixInvalid("axis with empty name".to_string()));
            }
            if !names.insert(axis.name.as_str()) {
                return Err(RiggerError::MatrixInvalid(format!(
                    "axis '{}' declared twice",
                    axis.name
                )));
            }
            if axis.values.is_empty() {
                return Err(RiggerError::MatrixInvalid(format!(
                    "axis '{}' has no values",
                    axis.name
                )));
            }
            let mut seen = HashSet::new();
            if let Some(dup) = axis.values.iter().find(|v| !seen.insert(v.as_str())) {
                return Err(RiggerError::MatrixInvalid(format!(
                    "axis '{}' lists value '{}' twice",
                    axis.name, dup
                )));
            }
        }

        for rule in &self.exclude {
            if let Some(axis) = rule.keys().find(|k| !self.has_axis(k)) {
                return Err(RiggerError::MatrixInvalid(format!(
                    "exclude refers to unknown axis '{axis}'"
                )));
            }
        }

        if self.max_parallel == Some(0) {
            return Err(RiggerError::MatrixInvalid(
                "max_parallel must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Expand the matrix into its cells
    pub fn expand(&self) -> RiggerResult<Vec<Cell>> {
        self.validate()?;

        let mut product: Vec<Vec<(String, String)>> = vec![Vec::new()];
        for axis in &self.axes {
            product = product
                .into_iter()
                .flat_map(|prefix| {
                    axis.values.iter().map(move |value| {
                        let mut pairs = prefix.clone();
                        pairs.push((axis.name.clone(), value.clone()));
                        pairs
                    })
                })
                .collect();
        }

        let cells: Vec<Cell> = product
            .into_iter()
            .map(Binding::new)
            .filter(|binding| !self.exclude.iter().any(|rule| binding.contains(rule)))
            .enumerate()
            .map(|(index, binding)| Cell::new(index, binding))
            .collect();

        if cells.is_empty() {
            return Err(RiggerError::MatrixInvalid(
                "every cell is excluded".to_string(),
            ));
        }

        Ok(cells)
    }
}
