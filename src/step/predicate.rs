//! Step guards evaluated against a cell's binding
//!
//! Evaluation is pure: the only input is the [`Binding`], never the host
//! environment, so `rigger matrix` can show which steps each cell will run.

use crate::error::{RiggerError, RiggerResult};
use crate::matrix::{Binding, Matrix};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Boolean condition over axis values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Equals { axis: String, value: String },
    OneOf { axis: String, values: Vec<String> },
    Not(Box<Predicate>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
}

impl Predicate {
    pub fn equals(axis: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equals {
            axis: axis.into(),
            value: value.into(),
        }
    }

    pub fn evaluate(&self, binding: &Binding) -> bool {
        match self {
            Self::Equals { axis, value } => binding.get(axis) == Some(value.as_str()),
            Self::OneOf { axis, values } => binding
                .get(axis)
                .is_some_and(|bound| values.iter().any(|v| v == bound)),
            Self::Not(inner) => !inner.evaluate(binding),
            Self::All(parts) => parts.iter().all(|p| p.evaluate(binding)),
            Self::Any(parts) => parts.iter().any(|p| p.evaluate(binding)),
        }
    }

    /// Reject predicates that name axes the matrix does not declare
    pub fn check_axes(&self, matrix: &Matrix) -> RiggerResult<()> {
        match self {
            Self::Equals { axis, .. } | Self::OneOf { axis, .. } => {
                if matrix.has_axis(axis) {
                    Ok(())
                } else {
                    Err(RiggerError::PipelineInvalid(format!(
                        "condition refers to unknown axis '{axis}'"
                    )))
                }
            }
            Self::Not(inner) => inner.check_axes(matrix),
            Self::All(parts) | Self::Any(parts) => {
                parts.iter().try_for_each(|p| p.check_axes(matrix))
            }
        }
    }
}

/// Whether a step runs unconditionally or only for some cells
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Guard {
    #[default]
    Always,
    When(Predicate),
}

impl Guard {
    pub fn allows(&self, binding: &Binding) -> bool {
        match self {
            Self::Always => true,
            Self::When(predicate) => predicate.evaluate(binding),
        }
    }

    /// Build a guard from the `when` / `unless` tables of a pipeline file
    pub fn from_tables(when: Option<&Condition>, unless: Option<&Condition>) -> Self {
        let mut parts = Vec::new();
        if let Some(when) = when {
            parts.push(when.to_predicate());
        }
        if let Some(unless) = unless {
            parts.push(Predicate::Not(Box::new(unless.to_predicate())));
        }

        match parts.len() {
            0 => Self::Always,
            1 => Self::When(parts.remove(0)),
            _ => Self::When(Predicate::All(parts)),
        }
    }
}

/// Axis value or list of accepted values, as written in `rigger.toml`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum AxisMatch {
    One(String),
    Many(Vec<String>),
}

/// Table form of a predicate: every listed axis must match
///
/// ```toml
/// when = { os = "macos" }
/// unless = { runtime = ["3.6", "3.7"] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(transparent)]
pub struct Condition(pub BTreeMap<String, AxisMatch>);

impl Condition {
    pub fn to_predicate(&self) -> Predicate {
        let mut parts: Vec<Predicate> = self
            .0
            .iter()
            .map(|(axis, matcher)| match matcher {
                AxisMatch::One(value) => Predicate::equals(axis, value),
                AxisMatch::Many(values) => Predicate::OneOf {
                    axis: axis.clone(),
                    values: values.clone(),
                },
            })
            .collect();

        if parts.len() == 1 {
            parts.remove(0)
        } else {
            Predicate::All(parts)
        }
    }
}
