//! Ordered, guarded step execution for one cell

use crate::error::{RiggerError, RiggerResult};
use crate::matrix::{CancelToken, CellStatus};
use crate::step::{CellContext, Severity, SkipReason, Step, StepOutcome, StepRecord};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Performs the action of a single step
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run `step`, returning an optional detail line for the report
    async fn handle(&self, step: &Step, ctx: &CellContext) -> RiggerResult<Option<String>>;
}

/// Result of running a cell's step list
#[derive(Debug, Clone)]
pub struct CellRun {
    pub status: CellStatus,
    pub records: Vec<StepRecord>,
}

/// Runs steps in declared order, honouring guards, severities, timeouts and
/// cancellation at step boundaries
#[derive(Debug, Clone)]
pub struct StepExecutor {
    default_timeout: Duration,
}

impl StepExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub async fn run(
        &self,
        steps: &[Step],
        ctx: &CellContext,
        handler: &dyn StepHandler,
        cancel: &CancelToken,
    ) -> CellRun {
        let cell = &ctx.cell.id;
        let mut status = CellStatus::Succeeded;
        let mut records = Vec::with_capacity(steps.len());

        for step in steps {
            let skip = match status {
                CellStatus::Failed { .. } => Some(SkipReason::Aborted),
                CellStatus::Cancelled => Some(SkipReason::Cancelled),
                CellStatus::Succeeded if cancel.is_cancelled() => {
                    info!("[{}] cancelled before '{}'", cell, step.name);
                    status = CellStatus::Cancelled;
                    Some(SkipReason::Cancelled)
                }
                CellStatus::Succeeded if !step.guard.allows(&ctx.cell.binding) => {
                    debug!("[{}] '{}' skipped, condition not met", cell, step.name);
                    Some(SkipReason::ConditionFalse)
                }
                CellStatus::Succeeded => None,
            };

            if let Some(reason) = skip {
                records.push(StepRecord {
                    name: step.name.clone(),
                    outcome: StepOutcome::Skipped { reason },
                    duration_ms: 0,
                });
                continue;
            }

            info!("[{}] {}", cell, step.name);
            let started = Instant::now();
            let limit = step.timeout.unwrap_or(self.default_timeout);

            let result = match tokio::time::timeout(limit, handler.handle(step, ctx)).await {
                Ok(result) => result,
                Err(_) => Err(RiggerError::StepTimeout {
                    step: step.name.clone(),
                    limit,
                }),
            };

            let outcome = match result {
                Ok(detail) => StepOutcome::Succeeded { detail },
                Err(e) if step.severity == Severity::NonFatal => {
                    warn!("[{}] non-fatal step '{}' failed: {}", cell, step.name, e);
                    StepOutcome::FailedNonFatal {
                        reason: e.to_string(),
                    }
                }
                Err(e) => {
                    warn!("[{}] step '{}' failed: {}", cell, step.name, e);
                    status = CellStatus::Failed {
                        step: step.name.clone(),
                        reason: e.to_string(),
                    };
                    StepOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };

            records.push(StepRecord {
                name: step.name.clone(),
                outcome,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        CellRun { status, records }
    }
}
