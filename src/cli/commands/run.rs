//! Run command - execute the pipeline selected by a trigger event

use crate::cli::args::{OutputFormat, RunArgs};
use crate::cli::commands::pipeline_path;
use crate::config::{Config, ConfigManager};
use crate::error::{RiggerError, RiggerResult};
use crate::events::EventLog;
use crate::matrix::{CellReport, CellStatus};
use crate::pipeline::{PipelineDefinition, PipelineReport, PipelineRunner, RunnerOptions, TriggerEvent};
use crate::publish::PublishOutcome;
use crate::step::StepOutcome;
use crate::ui::{self, TaskSpinner, UiContext};
use console::style;
use std::sync::Arc;
use tracing::debug;

/// Execute the run command
pub async fn execute(args: RunArgs, config: &Config) -> RiggerResult<()> {
    let ctx = UiContext::detect();
    let path = pipeline_path(args.pipeline.as_deref())?;
    debug!("Pipeline file: {}", path.display());

    let definition = PipelineDefinition::load(&path).await?;
    let workdir = path
        .parent()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| RiggerError::PipelineNotFound(path.clone()))?;

    let event = match &args.event {
        Some(file) => TriggerEvent::from_file(file).await?,
        None => {
            let event = TriggerEvent::new(args.revision, args.branch);
            if args.release {
                event.released()
            } else {
                event
            }
        }
    };

    let mut options = RunnerOptions::resolve(config, &definition, workdir);
    if let Some(n) = args.max_parallel {
        options.max_parallel = n.max(1);
    }

    ConfigManager::ensure_state_dirs(config).await?;
    let cells = definition.matrix.expand()?.len();
    let package = definition.package.name.clone();
    let runner = PipelineRunner::new(definition, options)
        .with_event_log(Arc::new(EventLog::new(config)));

    let mut spinner = TaskSpinner::new(&ctx);
    let show_progress = args.format == OutputFormat::Table;
    if show_progress {
        spinner.start(&format!(
            "Running {} pipeline for {} ({} cells)...",
            event.kind(),
            package,
            cells
        ));
    }

    let report = match runner.run(&event).await {
        Ok(report) => report,
        Err(e) => {
            if show_progress {
                spinner.stop_error("Pipeline could not start");
            }
            return Err(e);
        }
    };

    if show_progress {
        if report.is_success() {
            spinner.stop(&format!("{} pipeline passed", report.kind));
        } else {
            spinner.stop_error(&format!("{} pipeline failed", report.kind));
        }
    }

    match args.format {
        OutputFormat::Table => print_report_table(&ctx, &report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => print_report_plain(&report),
    }

    match report.failure() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn print_report_table(ctx: &UiContext, report: &PipelineReport) {
    ui::section(ctx, &format!("Cells ({})", report.cells.len()));
    for cell in &report.cells {
        print_cell(ctx, cell);
    }

    if let Some(collection) = &report.collection {
        ui::section(ctx, &format!("Collection '{}'", collection.name));
        match &collection.error {
            Some(error) => ui::step_error_detail(ctx, "not published", error),
            None => {
                ui::key_value(ctx, "artifacts", &collection.artifacts.len().to_string());
                if let Some(dir) = &collection.exported_to {
                    ui::key_value(ctx, "exported to", &dir.display().to_string());
                }
            }
        }
    }

    if let Some(publish) = &report.publish {
        ui::section(ctx, &format!("Publish to {}", publish.registry));
        for record in &publish.records {
            match &record.outcome {
                PublishOutcome::Published => ui::step_ok(ctx, &record.artifact),
                PublishOutcome::Skipped { .. } => {
                    ui::step_info(ctx, &format!("{} (already exists)", record.artifact))
                }
                PublishOutcome::Failed { reason } => {
                    ui::step_error_detail(ctx, &record.artifact, reason)
                }
            }
        }
        println!();
        println!(
            "Published: {}  Skipped: {}  Failed: {}",
            publish.published_count(),
            publish.skipped_count(),
            publish.failed_count()
        );
    }

    println!();
    println!(
        "Run {} finished in {:.1}s",
        style(report.run_id).dim(),
        report.duration_ms as f64 / 1000.0
    );
}

fn print_cell(ctx: &UiContext, cell: &CellReport) {
    let label = format!("{} ({:.1}s)", cell.cell.id, cell.duration_ms as f64 / 1000.0);
    match &cell.status {
        CellStatus::Succeeded => ui::step_ok(ctx, &label),
        CellStatus::Cancelled => ui::step_info(ctx, &format!("{} cancelled", cell.cell.id)),
        CellStatus::Failed { step, reason } => {
            ui::step_error_detail(ctx, &label, &format!("{step}: {}", first_line(reason)))
        }
    }

    for record in &cell.steps {
        if let StepOutcome::FailedNonFatal { reason } = &record.outcome {
            ui::step_warn_hint(
                ctx,
                &format!("{} / {} failed (non-fatal)", cell.cell.id, record.name),
                first_line(reason),
            );
        }
    }
}

fn print_report_plain(report: &PipelineReport) {
    for cell in &report.cells {
        println!("{}\t{}", cell.cell.id, cell.status.label());
    }
    if let Some(publish) = &report.publish {
        for record in &publish.records {
            println!("{}\t{}", record.artifact, record.outcome.label());
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_of_multiline_reason() {
        assert_eq!(first_line("exit status 1\nTraceback"), "exit status 1");
        assert_eq!(first_line(""), "");
    }
}
