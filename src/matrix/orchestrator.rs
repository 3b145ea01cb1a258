//! Concurrent cell scheduling under a fail-fast policy
//!
//! Every cell runs as its own tokio task. The only coordination between cells
//! is the shared [`CancelToken`]: with fail-fast enabled the first failing cell
//! fires it, running cells stop at their next step boundary and queued cells
//! never start.

use crate::matrix::Cell;
use crate::step::StepRecord;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Shared cancellation signal for one matrix run
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token has been cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal status of a cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CellStatus {
    Succeeded,
    Failed { step: String, reason: String },
    Cancelled,
}

impl CellStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Everything recorded about one cell's execution
#[derive(Debug, Clone, Serialize)]
pub struct CellReport {
    pub cell: Cell,
    #[serde(flatten)]
    pub status: CellStatus,
    pub steps: Vec<StepRecord>,
    /// File names of artifacts this cell handed to the exchange
    pub artifacts: Vec<String>,
    pub duration_ms: u64,
}

impl CellReport {
    /// Report for a cell that never started
    pub fn cancelled(cell: Cell) -> Self {
        Self {
            cell,
            status: CellStatus::Cancelled,
            steps: Vec::new(),
            artifacts: Vec::new(),
            duration_ms: 0,
        }
    }

    fn crashed(cell: Cell, reason: String) -> Self {
        Self {
            cell,
            status: CellStatus::Failed {
                step: "<cell>".to_string(),
                reason,
            },
            steps: Vec::new(),
            artifacts: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Unit of work executed once per cell
#[async_trait]
pub trait CellJob: Send + Sync + 'static {
    /// Run the cell to a terminal state
    async fn run(&self, cell: Cell, cancel: CancelToken) -> CellReport;

    /// Called for cells that reach a terminal state without `run` completing
    async fn abandon(&self, _cell: &Cell) {}
}

/// Result of a whole matrix run
#[derive(Debug, Clone, Serialize)]
pub struct MatrixOutcome {
    pub fail_fast: bool,
    pub cancelled: bool,
    /// Cell reports in expansion order
    pub cells: Vec<CellReport>,
}

impl MatrixOutcome {
    pub fn is_success(&self) -> bool {
        self.cells
            .iter()
            .all(|c| matches!(c.status, CellStatus::Succeeded))
    }

    pub fn failed_count(&self) -> usize {
        self.cells.iter().filter(|c| c.status.is_failed()).count()
    }

    pub fn cancelled_count(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| matches!(c.status, CellStatus::Cancelled))
            .count()
    }
}

/// Runs cells concurrently under a failure policy
#[derive(Debug, Clone)]
pub struct Orchestrator {
    fail_fast: bool,
    max_parallel: usize,
}

impl Orchestrator {
    pub fn new(fail_fast: bool, max_parallel: usize) -> Self {
        Self {
            fail_fast,
            max_parallel: max_parallel.max(1),
        }
    }

    pub async fn run<J: CellJob>(&self, cells: Vec<Cell>, job: Arc<J>) -> MatrixOutcome {
        let cancel = CancelToken::new();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();
        let mut in_flight = HashMap::new();

        info!(
            "Running {} cell(s), fail-fast={}, max-parallel={}",
            cells.len(),
            self.fail_fast,
            self.max_parallel
        );

        for cell in cells {
            let job = Arc::clone(&job);
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);
            let fail_fast = self.fail_fast;
            let task_cell = cell.clone();

            let handle = tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;

                if cancel.is_cancelled() {
                    debug!("Cell {} cancelled before start", task_cell.id);
                    job.abandon(&task_cell).await;
                    return CellReport::cancelled(task_cell);
                }

                let report = job.run(task_cell, cancel.clone()).await;
                if fail_fast && report.status.is_failed() && !cancel.is_cancelled() {
                    info!("Cell {} failed, cancelling remaining cells", report.cell.id);
                    cancel.cancel();
                }
                report
            });
            in_flight.insert(handle.id(), cell);
        }

        let mut reports = Vec::with_capacity(in_flight.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, report)) => {
                    in_flight.remove(&id);
                    debug!("Cell {} finished: {}", report.cell.id, report.status.label());
                    reports.push(report);
                }
                Err(err) => {
                    let Some(cell) = in_flight.remove(&err.id()) else {
                        continue;
                    };
                    warn!("Cell {} task aborted: {}", cell.id, err);
                    job.abandon(&cell).await;
                    if self.fail_fast {
                        cancel.cancel();
                    }
                    reports.push(CellReport::crashed(cell, err.to_string()));
                }
            }
        }

        reports.sort_by_key(|r| r.cell.index);
        MatrixOutcome {
            fail_fast: self.fail_fast,
            cancelled: cancel.is_cancelled(),
            cells: reports,
        }
    }
}
