//! Final run report

use crate::error::RiggerError;
use crate::matrix::{CellReport, CellStatus};
use crate::pipeline::PipelineKind;
use crate::publish::PublishReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

/// What happened to the release collection after the matrix finished
#[derive(Debug, Clone, Serialize)]
pub struct CollectionSummary {
    pub name: String,
    pub version: Option<u32>,
    /// Distinct artifact file names handed to the publisher
    pub artifacts: Vec<String>,
    pub exported_to: Option<PathBuf>,
    /// Why the collection was not published
    pub error: Option<String>,
}

impl CollectionSummary {
    pub fn failed(name: &str, error: &RiggerError) -> Self {
        Self {
            name: name.to_string(),
            version: None,
            artifacts: Vec::new(),
            exported_to: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub kind: PipelineKind,
    pub revision: String,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub fail_fast: bool,
    /// Whether fail-fast cancelled the matrix
    pub cancelled: bool,
    /// Every cell, in expansion order
    pub cells: Vec<CellReport>,
    pub collection: Option<CollectionSummary>,
    pub publish: Option<PublishReport>,
}

impl PipelineReport {
    /// Every cell succeeded and, for releases, every artifact was published
    /// or already present
    pub fn is_success(&self) -> bool {
        let cells_ok = self
            .cells
            .iter()
            .all(|c| c.status == CellStatus::Succeeded);

        match self.kind {
            PipelineKind::Test => cells_ok,
            PipelineKind::Release => {
                cells_ok
                    && self
                        .collection
                        .as_ref()
                        .is_some_and(|c| c.error.is_none())
                    && self.publish.as_ref().is_some_and(PublishReport::is_success)
            }
        }
    }

    pub fn failed_cells(&self) -> usize {
        self.cells.iter().filter(|c| c.status.is_failed()).count()
    }

    pub fn cancelled_cells(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| c.status == CellStatus::Cancelled)
            .count()
    }

    pub fn failed_artifacts(&self) -> usize {
        self.publish.as_ref().map_or(0, PublishReport::failed_count)
    }

    /// Error describing the failure, if the run failed
    pub fn failure(&self) -> Option<RiggerError> {
        (!self.is_success()).then(|| RiggerError::PipelineFailed {
            failed_cells: self.failed_cells(),
            failed_artifacts: self.failed_artifacts(),
        })
    }
}
