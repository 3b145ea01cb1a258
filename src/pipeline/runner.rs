//! Wires the components into one pipeline run
//!
//! trigger -> matrix expansion -> per-cell steps (install, run, build +
//! transform) -> exchange upload -> download barrier -> publish -> report

use crate::artifact::{
    Artifact, ArtifactBuilder, ArtifactExchange, CommandBuilder, Transformer,
};
use crate::cache::store::remove_path;
use crate::cache::{
    CacheKey, CacheStore, CommandInstaller, DependencyResolver, FsCacheStore,
};
use crate::config::{Config, ConfigManager};
use crate::error::{RiggerError, RiggerResult};
use crate::events::EventLog;
use crate::matrix::{CancelToken, Cell, CellId, CellJob, CellReport, CellStatus, Orchestrator};
use crate::pipeline::report::{CollectionSummary, PipelineReport};
use crate::pipeline::{PipelineDefinition, PipelineKind, TriggerEvent};
use crate::publish::{DirectoryRegistry, HttpRegistry, PublishReport, Publisher, Registry, RegistryToken};
use crate::step::{
    CellContext, CommandRunner, ShellRunner, Step, StepAction, StepExecutor, StepHandler,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Host-level settings for a run, merged from config and the pipeline file
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Project checkout; each cell works on its own copy
    pub workdir: PathBuf,
    /// Scratch space for cell directories and the exported collection
    pub work_root: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_max_age_days: u32,
    pub install_timeout: Duration,
    pub step_timeout: Duration,
    pub download_timeout: Duration,
    pub max_parallel: usize,
    pub registry: Option<String>,
    pub token_env: String,
    pub skip_existing: bool,
    pub publish_concurrency: usize,
    pub registry_timeout: Duration,
    /// Where a release writes its downloaded collection
    pub export_dir: Option<PathBuf>,
}

impl RunnerOptions {
    /// Pipeline settings win over host config
    pub fn resolve(config: &Config, definition: &PipelineDefinition, workdir: PathBuf) -> Self {
        let deps = definition.dependencies.as_ref();
        let publish = &definition.publish;
        let work_root = workdir.join(".rigger");

        Self {
            cache_dir: ConfigManager::cache_dir_for(config),
            cache_max_age_days: deps
                .and_then(|d| d.max_age_days)
                .unwrap_or(config.cache.max_age_days),
            install_timeout: deps
                .and_then(|d| d.timeout_secs)
                .map_or_else(|| config.timeouts.install(), Duration::from_secs),
            step_timeout: config.timeouts.step(),
            download_timeout: config.timeouts.download(),
            max_parallel: definition
                .matrix
                .max_parallel
                .unwrap_or(config.matrix.max_parallel),
            registry: publish.registry.clone().or_else(|| config.publish.registry.clone()),
            token_env: publish
                .token_env
                .clone()
                .unwrap_or_else(|| config.publish.token_env.clone()),
            skip_existing: publish.skip_existing.unwrap_or(config.publish.skip_existing),
            publish_concurrency: publish.concurrency.unwrap_or(config.publish.concurrency),
            registry_timeout: Duration::from_secs(config.publish.timeout_secs),
            export_dir: Some(work_root.join("dist")),
            work_root,
            workdir,
        }
    }
}

pub struct PipelineRunner {
    definition: Arc<PipelineDefinition>,
    options: RunnerOptions,
    commands: Arc<dyn CommandRunner>,
    store: Arc<dyn CacheStore>,
    builder: Option<Arc<dyn ArtifactBuilder>>,
    registry: Option<Arc<dyn Registry>>,
    events: Arc<EventLog>,
}

impl PipelineRunner {
    pub fn new(definition: PipelineDefinition, options: RunnerOptions) -> Self {
        let store = FsCacheStore::new(&options.cache_dir)
            .with_max_age_days(options.cache_max_age_days);
        Self {
            definition: Arc::new(definition),
            options,
            commands: Arc::new(ShellRunner),
            store: Arc::new(store),
            builder: None,
            registry: None,
            events: Arc::new(EventLog::disabled()),
        }
    }

    pub fn with_command_runner(mut self, commands: Arc<dyn CommandRunner>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = store;
        self
    }

    /// Replace the `[build]` command
    pub fn with_builder(mut self, builder: Arc<dyn ArtifactBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Replace the configured registry
    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_event_log(mut self, events: Arc<EventLog>) -> Self {
        self.events = events;
        self
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    fn registry(&self) -> RiggerResult<Arc<dyn Registry>> {
        if let Some(registry) = &self.registry {
            return Ok(Arc::clone(registry));
        }

        let location = self.options.registry.as_deref().ok_or_else(|| {
            RiggerError::PipelineInvalid(
                "release pipeline needs publish.registry (pipeline or config)".to_string(),
            )
        })?;

        if location.starts_with("http://") || location.starts_with("https://") {
            let token = RegistryToken::from_env(&self.options.token_env)?;
            Ok(Arc::new(HttpRegistry::new(
                location,
                token,
                self.options.registry_timeout,
            )))
        } else {
            Ok(Arc::new(DirectoryRegistry::new(
                self.options.workdir.join(location),
            )))
        }
    }

    fn builder(&self) -> RiggerResult<Arc<dyn ArtifactBuilder>> {
        if let Some(builder) = &self.builder {
            return Ok(Arc::clone(builder));
        }
        let build = self.definition.build.as_ref().ok_or_else(|| {
            RiggerError::PipelineInvalid("release pipeline needs a [build] section".to_string())
        })?;
        Ok(Arc::new(CommandBuilder::new(
            build.run.clone(),
            build.extension.clone(),
            build.platform_axis.clone(),
            Arc::clone(&self.commands),
        )))
    }

    fn resolver(&self) -> Option<(DependencyResolver, CacheKey)> {
        let deps = self.definition.dependencies.as_ref()?;
        let installer = CommandInstaller::new(deps.install.clone(), Arc::clone(&self.commands));
        let resolver = DependencyResolver::new(
            Arc::clone(&self.store),
            Arc::new(installer),
            deps.paths.clone(),
            self.options.install_timeout,
        );
        Some((resolver, CacheKey::new(&deps.key)))
    }

    pub async fn run(&self, event: &TriggerEvent) -> RiggerResult<PipelineReport> {
        let kind = event.kind();
        let steps = self.definition.steps(kind)?;
        if steps.is_empty() {
            return Err(RiggerError::PipelineInvalid(format!(
                "no {kind} steps defined"
            )));
        }
        let cells = self.definition.matrix.expand()?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();

        // Resolve release prerequisites (token included) before any cell runs
        let (publisher, builder) = match kind {
            PipelineKind::Release => {
                let publisher = Publisher::new(self.registry()?)
                    .skip_existing(self.options.skip_existing)
                    .concurrency(self.options.publish_concurrency);
                (Some(publisher), Some(self.builder()?))
            }
            PipelineKind::Test => (None, None),
        };

        let collection = self.definition.publish.collection.clone();
        let exchange = Arc::new(ArtifactExchange::new());
        if kind == PipelineKind::Release {
            let producers: Vec<CellId> = cells.iter().map(|c| c.id.clone()).collect();
            exchange.declare(&collection, &producers)?;
        }

        let stage_timeout = self
            .definition
            .stage(kind)
            .timeout_secs
            .map_or(self.options.step_timeout, Duration::from_secs);

        let job = Arc::new(CellPipeline {
            kind,
            steps,
            executor: StepExecutor::new(stage_timeout),
            workdir: self.options.workdir.clone(),
            work_root: self.options.work_root.clone(),
            cells_root: self.options.work_root.join("cells"),
            base_env: self.base_env(kind, event, run_id),
            commands: Arc::clone(&self.commands),
            resolver: self.resolver(),
            definition: Arc::clone(&self.definition),
            branch: event.branch.clone(),
            builder,
            transformer: self.definition.transformer(),
            exchange: Arc::clone(&exchange),
            collection: collection.clone(),
            events: Arc::clone(&self.events),
        });

        info!(
            "Run {}: {} pipeline for {} at {}",
            run_id, kind, event.branch, event.revision
        );
        self.events
            .log(
                "run.started",
                &json!({
                    "run_id": run_id,
                    "kind": kind,
                    "revision": event.revision,
                    "branch": event.branch,
                    "cells": cells.len(),
                }),
            )
            .await;

        let orchestrator = Orchestrator::new(self.definition.matrix.fail_fast, self.options.max_parallel);
        let outcome = orchestrator.run(cells, job).await;

        let (collection_summary, publish) = match publisher {
            Some(publisher) => {
                let (summary, publish) = self.finish_release(&exchange, &collection, &publisher).await;
                (Some(summary), publish)
            }
            None => (None, None),
        };

        let report = PipelineReport {
            run_id,
            kind,
            revision: event.revision.clone(),
            branch: event.branch.clone(),
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            fail_fast: outcome.fail_fast,
            cancelled: outcome.cancelled,
            cells: outcome.cells,
            collection: collection_summary,
            publish,
        };

        self.events
            .log(
                "run.finished",
                &json!({
                    "run_id": run_id,
                    "success": report.is_success(),
                    "failed_cells": report.failed_cells(),
                    "failed_artifacts": report.failed_artifacts(),
                    "duration_ms": report.duration_ms,
                }),
            )
            .await;

        Ok(report)
    }

    fn base_env(&self, kind: PipelineKind, event: &TriggerEvent, run_id: Uuid) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("RIGGER_BRANCH".to_string(), event.branch.clone()),
            ("RIGGER_REVISION".to_string(), event.revision.clone()),
            ("RIGGER_RUN_ID".to_string(), run_id.to_string()),
            ("RIGGER_PIPELINE".to_string(), kind.to_string()),
            ("RIGGER_PACKAGE".to_string(), self.definition.package.name.clone()),
        ])
    }

    /// Wait for the collection, export it and publish it. Partial collections
    /// are never published.
    async fn finish_release(
        &self,
        exchange: &ArtifactExchange,
        name: &str,
        publisher: &Publisher,
    ) -> (CollectionSummary, Option<PublishReport>) {
        let downloaded = match exchange.download(name, self.options.download_timeout).await {
            Ok(collection) => collection,
            Err(e) => {
                warn!("Not publishing {}: {}", name, e);
                return (CollectionSummary::failed(name, &e), None);
            }
        };

        let artifacts = match downloaded.distinct() {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!("Not publishing {}: {}", name, e);
                return (CollectionSummary::failed(name, &e), None);
            }
        };

        let mut summary = CollectionSummary {
            name: name.to_string(),
            version: Some(downloaded.version),
            artifacts: artifacts.iter().map(Artifact::file_name).collect(),
            exported_to: None,
            error: None,
        };

        if let Some(dir) = &self.options.export_dir {
            if let Err(e) = export_fresh(&downloaded, dir).await {
                warn!("Not publishing {}: {}", name, e);
                summary.error = Some(e.to_string());
                return (summary, None);
            }
            summary.exported_to = Some(dir.clone());
        }

        let report = publisher.publish_all(artifacts).await;
        for record in &report.records {
            self.events.log("publish.record", &json!(record)).await;
        }
        (summary, Some(report))
    }
}

async fn export_fresh(collection: &crate::artifact::Collection, dir: &Path) -> RiggerResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(RiggerError::io(format!("clearing {}", dir.display()), e)),
    }
    collection.export(dir).await.map(|_| ())
}

/// Everything one cell needs; shared read-only by all cells of a run
struct CellPipeline {
    kind: PipelineKind,
    steps: Vec<Step>,
    executor: StepExecutor,
    workdir: PathBuf,
    work_root: PathBuf,
    cells_root: PathBuf,
    base_env: BTreeMap<String, String>,
    commands: Arc<dyn CommandRunner>,
    resolver: Option<(DependencyResolver, CacheKey)>,
    definition: Arc<PipelineDefinition>,
    branch: String,
    builder: Option<Arc<dyn ArtifactBuilder>>,
    transformer: Transformer,
    exchange: Arc<ArtifactExchange>,
    collection: String,
    events: Arc<EventLog>,
}

impl CellPipeline {
    fn cell_dir(&self, cell: &Cell) -> PathBuf {
        self.cells_root
            .join(format!("{:02}-{}", cell.index, cell.id.slug()))
    }

    fn release_slot(&self, cell: &CellId) {
        if self.kind != PipelineKind::Release {
            return;
        }
        if let Err(e) = self.exchange.abandon(&self.collection, cell) {
            warn!("[{}] could not release exchange slot: {}", cell, e);
        }
    }

    async fn execute(&self, cell: Cell, cancel: &CancelToken) -> RiggerResult<CellReport> {
        let started = Instant::now();
        let cell_dir = self.cell_dir(&cell);
        fresh_dir(&cell_dir).await?;
        seed_checkout(&self.workdir, &cell_dir, &self.work_root).await?;

        let ctx = CellContext::new(cell.clone(), self.workdir.clone(), cell_dir, &self.base_env);
        let handler = CellSteps {
            pipeline: self,
            artifact: Mutex::new(None),
        };
        let run = self.executor.run(&self.steps, &ctx, &handler, cancel).await;

        let mut status = run.status;
        let mut artifacts = Vec::new();
        if self.kind == PipelineKind::Release {
            if status == CellStatus::Succeeded {
                let produced: Vec<Artifact> = handler.take_artifact()?.into_iter().collect();
                let names: Vec<String> = produced.iter().map(Artifact::file_name).collect();
                match self.exchange.upload(&self.collection, &cell.id, produced) {
                    Ok(()) => artifacts = names,
                    Err(e) => {
                        self.release_slot(&cell.id);
                        status = CellStatus::Failed {
                            step: "upload".to_string(),
                            reason: e.to_string(),
                        };
                    }
                }
            } else {
                self.release_slot(&cell.id);
            }
        }

        Ok(CellReport {
            cell,
            status,
            steps: run.records,
            artifacts,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl CellJob for CellPipeline {
    async fn run(&self, cell: Cell, cancel: CancelToken) -> CellReport {
        self.events
            .log("cell.started", &json!({ "cell": cell.id }))
            .await;

        let report = match self.execute(cell.clone(), &cancel).await {
            Ok(report) => report,
            Err(e) => {
                if e.is_cell_fatal() {
                    warn!("[{}] {}", cell.id, e);
                } else {
                    error!("[{}] {}", cell.id, e);
                }
                self.release_slot(&cell.id);
                let mut report = CellReport::cancelled(cell);
                report.status = CellStatus::Failed {
                    step: "setup".to_string(),
                    reason: e.to_string(),
                };
                report
            }
        };

        self.events
            .log(
                "cell.finished",
                &json!({
                    "cell": report.cell.id,
                    "status": report.status.label(),
                    "artifacts": report.artifacts,
                    "duration_ms": report.duration_ms,
                }),
            )
            .await;
        report
    }

    async fn abandon(&self, cell: &Cell) {
        self.release_slot(&cell.id);
    }
}

/// Step actions for one cell; holds the artifact its build step produced
struct CellSteps<'a> {
    pipeline: &'a CellPipeline,
    artifact: Mutex<Option<Artifact>>,
}

impl CellSteps<'_> {
    fn take_artifact(&self) -> RiggerResult<Option<Artifact>> {
        self.artifact
            .lock()
            .map(|mut slot| slot.take())
            .map_err(|_| RiggerError::Internal("artifact slot poisoned".to_string()))
    }
}

#[async_trait]
impl StepHandler for CellSteps<'_> {
    async fn handle(&self, step: &Step, ctx: &CellContext) -> RiggerResult<Option<String>> {
        let pipeline = self.pipeline;
        match &step.action {
            StepAction::Run(command) => {
                pipeline.commands.run(command, ctx, &step.env).await?;
                Ok(None)
            }
            StepAction::Install => {
                let (resolver, key) = pipeline.resolver.as_ref().ok_or_else(|| {
                    RiggerError::Internal("install step without [dependencies]".to_string())
                })?;
                let vars = pipeline.definition.key_vars(&ctx.cell.binding, &pipeline.branch);
                let rendered = key.render(&vars)?;
                let outcome = resolver.resolve(&rendered, ctx).await?;
                pipeline
                    .events
                    .log(
                        "cache.resolved",
                        &json!({ "cell": ctx.cell.id, "key": rendered, "outcome": outcome }),
                    )
                    .await;
                Ok(Some(format!("{} ({})", outcome.label(), rendered)))
            }
            StepAction::Build => {
                let builder = pipeline.builder.as_ref().ok_or_else(|| {
                    RiggerError::Internal("build step outside a release run".to_string())
                })?;
                let built = builder.build(ctx).await?;
                let artifact = pipeline.transformer.apply(built, &ctx.cell.binding)?;
                let name = artifact.file_name();
                *self
                    .artifact
                    .lock()
                    .map_err(|_| RiggerError::Internal("artifact slot poisoned".to_string()))? =
                    Some(artifact);
                Ok(Some(name))
            }
        }
    }
}

async fn fresh_dir(dir: &Path) -> RiggerResult<()> {
    let target = dir.to_path_buf();
    tokio::task::spawn_blocking(move || remove_path(&target))
        .await
        .map_err(|e| RiggerError::Internal(format!("clearing {}: {e}", dir.display())))??;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| RiggerError::io(format!("creating {}", dir.display()), e))
}

/// Give a cell its own copy of the checkout, leaving out rigger's work root
async fn seed_checkout(workdir: &Path, cell_dir: &Path, work_root: &Path) -> RiggerResult<()> {
    let (src, dst, skip) = (
        workdir.to_path_buf(),
        cell_dir.to_path_buf(),
        work_root.to_path_buf(),
    );
    tokio::task::spawn_blocking(move || copy_tree(&src, &dst, &skip))
        .await
        .map_err(|e| RiggerError::Internal(format!("seeding {}: {e}", cell_dir.display())))?
}

fn copy_tree(src: &Path, dst: &Path, skip: &Path) -> RiggerResult<()> {
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.path() != skip);

    for item in walker {
        let item = item.map_err(|e| {
            RiggerError::io(
                format!("reading checkout {}", src.display()),
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::other("symlink loop")),
            )
        })?;
        let rel = item.path().strip_prefix(src).map_err(|_| {
            RiggerError::Internal(format!("{} is outside the checkout", item.path().display()))
        })?;
        let dest = dst.join(rel);
        let file_type = item.file_type();

        let copied = if file_type.is_dir() {
            std::fs::create_dir_all(&dest)
        } else if file_type.is_symlink() {
            copy_link(item.path(), &dest)
        } else {
            std::fs::copy(item.path(), &dest).map(|_| ())
        };
        copied.map_err(|e| RiggerError::io(format!("copying {} into cell", rel.display()), e))?;
    }
    Ok(())
}

#[cfg(unix)]
fn copy_link(src: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(std::fs::read_link(src)?, dest)
}

#[cfg(not(unix))]
fn copy_link(src: &Path, dest: &Path) -> io::Result<()> {
    std::fs::copy(src, dest).map(|_| ())
}
