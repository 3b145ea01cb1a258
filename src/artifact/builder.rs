//! Per-cell artifact production

use crate::artifact::{Artifact, ArtifactName};
use crate::error::{RiggerError, RiggerResult};
use crate::step::{CellContext, CommandRunner};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use tracing::{debug, info};

/// Produces exactly one artifact for a cell that reached its build step
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn build(&self, ctx: &CellContext) -> RiggerResult<Artifact>;
}

/// Runs the build command and picks up its single output from `RIGGER_DIST_DIR`
pub struct CommandBuilder {
    command: String,
    extension: String,
    platform_axis: String,
    runner: Arc<dyn CommandRunner>,
}

impl CommandBuilder {
    pub fn new(
        command: impl Into<String>,
        extension: impl Into<String>,
        platform_axis: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            command: command.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
            platform_axis: platform_axis.into(),
            runner,
        }
    }

    async fn reset_dist_dir(&self, ctx: &CellContext) -> RiggerResult<()> {
        match tokio::fs::remove_dir_all(&ctx.dist_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(RiggerError::io("clearing dist directory", e)),
        }
        tokio::fs::create_dir_all(&ctx.dist_dir)
            .await
            .map_err(|e| RiggerError::io("creating dist directory", e))
    }

    async fn outputs(&self, ctx: &CellContext) -> RiggerResult<Vec<String>> {
        let suffix = format!(".{}", self.extension);
        let mut found = Vec::new();
        let mut dir = tokio::fs::read_dir(&ctx.dist_dir)
            .await
            .map_err(|e| RiggerError::io("reading dist directory", e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| RiggerError::io("reading dist directory", e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
            if is_file && name.ends_with(&suffix) {
                found.push(name);
            } else {
                debug!("[{}] ignoring dist entry {}", ctx.cell.id, name);
            }
        }
        found.sort();
        Ok(found)
    }
}

#[async_trait]
impl ArtifactBuilder for CommandBuilder {
    async fn build(&self, ctx: &CellContext) -> RiggerResult<Artifact> {
        let platform = ctx
            .cell
            .binding
            .get(&self.platform_axis)
            .ok_or_else(|| {
                RiggerError::BuildOutput(format!(
                    "cell {} has no '{}' axis to tag the artifact with",
                    ctx.cell.id, self.platform_axis
                ))
            })?
            .to_string();

        self.reset_dist_dir(ctx).await?;
        self.runner
            .run(&self.command, ctx, &BTreeMap::new())
            .await?;

        let mut outputs = self.outputs(ctx).await?;
        let file_name = match outputs.len() {
            1 => outputs.remove(0),
            0 => {
                return Err(RiggerError::BuildOutput(format!(
                    "no *.{} file in {}",
                    self.extension,
                    ctx.dist_dir.display()
                )))
            }
            _ => {
                return Err(RiggerError::BuildOutput(format!(
                    "expected one *.{} file, found {}",
                    self.extension,
                    outputs.join(", ")
                )))
            }
        };

        let name = ArtifactName::parse(&file_name)?;
        let payload = tokio::fs::read(ctx.dist_dir.join(&file_name))
            .await
            .map_err(|e| RiggerError::io(format!("reading {file_name}"), e))?;

        let artifact = Artifact::new(name, platform, ctx.cell.id.clone(), payload);
        info!(
            "[{}] built {} ({} bytes)",
            ctx.cell.id,
            artifact.file_name(),
            artifact.size()
        );
        Ok(artifact)
    }
}
