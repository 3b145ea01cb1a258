//! Matrix command - dry listing of cells and the steps they would run

use crate::cli::args::{MatrixArgs, OutputFormat};
use crate::cli::commands::pipeline_path;
use crate::error::RiggerResult;
use crate::matrix::Cell;
use crate::pipeline::{PipelineDefinition, PipelineKind};
use crate::step::{Step, StepAction};
use console::style;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct CellPlan<'a> {
    cell: &'a Cell,
    steps: Vec<&'a str>,
}

/// Execute the matrix command
pub async fn execute(args: MatrixArgs) -> RiggerResult<()> {
    let path = pipeline_path(args.pipeline.as_deref())?;
    let definition = PipelineDefinition::load(&path).await?;
    let kind = if args.release {
        PipelineKind::Release
    } else {
        PipelineKind::Test
    };

    let cells = definition.matrix.expand()?;
    let steps = definition.steps(kind)?;
    let plans = plan(&cells, &steps);

    match args.format {
        OutputFormat::Table => print_table(&definition, kind, &plans, &steps),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plans)?),
        OutputFormat::Plain => {
            for plan in &plans {
                println!("{}", plan.cell.id);
            }
        }
    }

    Ok(())
}

/// Steps whose guards admit each cell, in declared order
fn plan<'a>(cells: &'a [Cell], steps: &'a [Step]) -> Vec<CellPlan<'a>> {
    cells
        .iter()
        .map(|cell| CellPlan {
            cell,
            steps: steps
                .iter()
                .filter(|s| s.guard.allows(&cell.binding))
                .map(|s| s.name.as_str())
                .collect(),
        })
        .collect()
}

fn print_table(
    definition: &PipelineDefinition,
    kind: PipelineKind,
    plans: &[CellPlan<'_>],
    steps: &[Step],
) {
    println!(
        "{} {} pipeline, {} cell(s), fail-fast {}",
        style(&definition.package.name).cyan().bold(),
        kind,
        plans.len(),
        if definition.matrix.fail_fast { "on" } else { "off" }
    );
    println!();
    println!("{:<36} STEPS", "CELL");
    println!("{}", "-".repeat(80));

    for plan in plans {
        let listed: Vec<String> = steps
            .iter()
            .map(|step| {
                if plan.steps.contains(&step.name.as_str()) {
                    display_name(step)
                } else {
                    style(format!("({})", step.name)).dim().to_string()
                }
            })
            .collect();
        println!("{:<36} {}", plan.cell.id.as_str(), listed.join(", "));
    }
}

fn display_name(step: &Step) -> String {
    match step.action {
        StepAction::Run(_) => step.name.clone(),
        StepAction::Install | StepAction::Build => style(&step.name).cyan().to_string(),
    }
}
