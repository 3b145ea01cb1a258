//! Cache-backed dependency installation
//!
//! On a hit the stored state is restored into the cell directory and the
//! installer never runs. On a miss the installer runs, the declared paths are
//! captured and published under the same key. Either way the cell ends up with
//! the same bytes on disk.

use crate::cache::store::{remove_path, CacheStore};
use crate::error::{RiggerError, RiggerResult};
use crate::step::{CellContext, CommandRunner};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Populates a cell's dependency paths from scratch
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, ctx: &CellContext) -> RiggerResult<()>;
}

/// Runs the pipeline's install commands in order
pub struct CommandInstaller {
    commands: Vec<String>,
    runner: Arc<dyn CommandRunner>,
}

impl CommandInstaller {
    pub fn new(commands: Vec<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { commands, runner }
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    async fn install(&self, ctx: &CellContext) -> RiggerResult<()> {
        let no_env = BTreeMap::new();
        for command in &self.commands {
            self.runner
                .run(command, ctx, &no_env)
                .await
                .map_err(|e| RiggerError::DependencyInstall(e.to_string()))?;
        }
        Ok(())
    }
}

/// Whether dependencies came from the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveOutcome {
    Hit,
    Miss,
}

impl ResolveOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Hit => "cache hit",
            Self::Miss => "cache miss",
        }
    }
}

pub struct DependencyResolver {
    store: Arc<dyn CacheStore>,
    installer: Arc<dyn Installer>,
    /// Paths relative to the cell directory that make up the cached state
    paths: Vec<String>,
    install_timeout: Duration,
}

impl DependencyResolver {
    pub fn new(
        store: Arc<dyn CacheStore>,
        installer: Arc<dyn Installer>,
        paths: Vec<String>,
        install_timeout: Duration,
    ) -> Self {
        Self {
            store,
            installer,
            paths,
            install_timeout,
        }
    }

    /// Make the dependencies for rendered `key` present in the cell directory
    pub async fn resolve(&self, key: &str, ctx: &CellContext) -> RiggerResult<ResolveOutcome> {
        let cell = &ctx.cell.id;

        match self.store.get(key).await {
            Ok(Some(entry)) => match self.store.materialize(&entry, &ctx.cell_dir).await {
                Ok(()) => {
                    info!("[{}] dependencies restored from cache ({})", cell, key);
                    return Ok(ResolveOutcome::Hit);
                }
                Err(e) => {
                    warn!("[{}] restoring {} failed, reinstalling: {}", cell, key, e);
                    // A half-restored root must not leak into the fresh capture.
                    self.clear_roots(ctx).await?;
                }
            },
            Ok(None) => debug!("[{}] cache miss for {}", cell, key),
            Err(e) => warn!("[{}] cache lookup for {} failed, reinstalling: {}", cell, key, e),
        }

        match tokio::time::timeout(self.install_timeout, self.installer.install(ctx)).await {
            Ok(Ok(())) => {}
            Ok(Err(e @ RiggerError::DependencyInstall(_))) => return Err(e),
            Ok(Err(e)) => return Err(RiggerError::DependencyInstall(e.to_string())),
            Err(_) => {
                return Err(RiggerError::DependencyInstall(format!(
                    "installation timed out after {}s",
                    self.install_timeout.as_secs()
                )))
            }
        }

        self.check_roots(ctx).await?;

        // The cell already has its dependencies; failing to save them only
        // costs the next run a reinstall.
        match self.store.capture(key, &ctx.cell_dir, &self.paths).await {
            Ok(entry) => match self.store.put(key, &entry).await {
                Ok(()) => info!(
                    "[{}] cached {} file(s) under {}",
                    cell,
                    entry.files.len(),
                    key
                ),
                Err(e) => warn!("[{}] could not store cache entry {}: {}", cell, key, e),
            },
            Err(e) => warn!("[{}] could not capture dependencies for {}: {}", cell, key, e),
        }

        Ok(ResolveOutcome::Miss)
    }

    async fn clear_roots(&self, ctx: &CellContext) -> RiggerResult<()> {
        let targets: Vec<_> = self.paths.iter().map(|p| ctx.cell_dir.join(p)).collect();
        tokio::task::spawn_blocking(move || targets.iter().try_for_each(|t| remove_path(t)))
            .await
            .map_err(|e| RiggerError::Internal(format!("clearing dependency paths: {e}")))?
    }

    /// Every declared path must exist once the installer is done
    async fn check_roots(&self, ctx: &CellContext) -> RiggerResult<()> {
        for path in &self.paths {
            if tokio::fs::symlink_metadata(ctx.cell_dir.join(path)).await.is_err() {
                return Err(RiggerError::DependencyInstall(format!(
                    "install finished without producing '{}' in {}",
                    path,
                    ctx.cell_dir.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::{CacheEntry, FileRecord, FsCacheStore};
    use crate::matrix::{Binding, Cell};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Writes a fake virtualenv; counts invocations
    #[derive(Default)]
    struct FakeInstaller {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Installer for FakeInstaller {
        async fn install(&self, ctx: &CellContext) -> RiggerResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let site = ctx.cell_dir.join(".venv/site-packages");
            std::fs::create_dir_all(&site).unwrap();
            std::fs::write(site.join("numpy.py"), b"version = '1.16'\n").unwrap();
            std::fs::write(site.join("blob.bin"), [0u8, 159, 146, 150, 255]).unwrap();
            Ok(())
        }
    }

    /// Writes the listed files below the cell directory
    struct FileInstaller(&'static [&'static str]);

    #[async_trait]
    impl Installer for FileInstaller {
        async fn install(&self, ctx: &CellContext) -> RiggerResult<()> {
            for rel in self.0 {
                let path = ctx.cell_dir.join(rel);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, rel.as_bytes()).unwrap();
            }
            Ok(())
        }
    }

    struct FailingInstaller;

    #[async_trait]
    impl Installer for FailingInstaller {
        async fn install(&self, _ctx: &CellContext) -> RiggerResult<()> {
            Err(RiggerError::step("pip install", "no matching distribution"))
        }
    }

    struct HangingInstaller;

    #[async_trait]
    impl Installer for HangingInstaller {
        async fn install(&self, _ctx: &CellContext) -> RiggerResult<()> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }
    }

    /// A store whose reads always fail
    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, key: &str) -> RiggerResult<Option<CacheEntry>> {
            Err(RiggerError::CacheCorrupt {
                key: key.to_string(),
                reason: "unreadable".to_string(),
            })
        }
        async fn put(&self, _key: &str, _entry: &CacheEntry) -> RiggerResult<()> {
            Err(RiggerError::Internal("read-only".to_string()))
        }
        async fn capture(&self, key: &str, _base: &Path, _roots: &[String]) -> RiggerResult<CacheEntry> {
            Err(RiggerError::Internal(format!("cannot capture {key}")))
        }
        async fn materialize(&self, _entry: &CacheEntry, _base: &Path) -> RiggerResult<()> {
            Ok(())
        }
        async fn list(&self) -> RiggerResult<Vec<CacheEntry>> {
            Ok(Vec::new())
        }
        async fn remove(&self, _key: &str) -> RiggerResult<bool> {
            Ok(false)
        }
    }

    fn ctx(dir: &TempDir, name: &str) -> CellContext {
        let cell = Cell::new(0, Binding::new(vec![("os".to_string(), "linux".to_string())]));
        let cell_dir = dir.path().join(name);
        std::fs::create_dir_all(&cell_dir).unwrap();
        CellContext::new(cell, dir.path().to_path_buf(), cell_dir, &BTreeMap::new())
    }

    fn resolver(store: Arc<dyn CacheStore>, installer: Arc<dyn Installer>) -> DependencyResolver {
        DependencyResolver::new(
            store,
            installer,
            vec![".venv".to_string()],
            Duration::from_secs(5),
        )
    }

    fn read_all(root: &Path) -> Vec<(String, Vec<u8>)> {
        let mut files: Vec<_> = walkdir::WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().into_owned();
                (rel, std::fs::read(e.path()).unwrap())
            })
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn miss_installs_then_hit_restores_identical_state() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsCacheStore::new(dir.path().join("cache")));
        let installer = Arc::new(FakeInstaller::default());
        let resolver = resolver(store, installer.clone());

        let first = ctx(&dir, "first");
        assert_eq!(
            resolver.resolve("deps-linux-v1", &first).await.unwrap(),
            ResolveOutcome::Miss
        );

        let second = ctx(&dir, "second");
        assert_eq!(
            resolver.resolve("deps-linux-v1", &second).await.unwrap(),
            ResolveOutcome::Hit
        );

        assert_eq!(installer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(read_all(&first.cell_dir), read_all(&second.cell_dir));
        assert!(!read_all(&second.cell_dir).is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_share_entries() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsCacheStore::new(dir.path().join("cache")));
        let installer = Arc::new(FakeInstaller::default());
        let resolver = resolver(store, installer.clone());

        resolver.resolve("deps-linux", &ctx(&dir, "a")).await.unwrap();
        let outcome = resolver.resolve("deps-macos", &ctx(&dir, "b")).await.unwrap();

        assert_eq!(outcome, ResolveOutcome::Miss);
        assert_eq!(installer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_install_is_cell_fatal_and_not_cached() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsCacheStore::new(dir.path().join("cache")));
        let resolver = resolver(store.clone(), Arc::new(FailingInstaller));

        let err = resolver.resolve("k", &ctx(&dir, "a")).await.unwrap_err();
        assert!(matches!(err, RiggerError::DependencyInstall(_)));
        assert!(err.is_cell_fatal());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn install_missing_declared_path_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsCacheStore::new(dir.path().join("cache")));
        // writes next to the declared path instead of into it
        let resolver = resolver(store.clone(), Arc::new(FileInstaller(&["venv/dep.txt"])));

        let err = resolver.resolve("k", &ctx(&dir, "a")).await.unwrap_err();
        assert!(matches!(err, RiggerError::DependencyInstall(_)));
        assert!(err.to_string().contains(".venv"));
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_restore_is_cleared_before_reinstall() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsCacheStore::new(dir.path().join("cache")));

        let seeded = resolver(
            store.clone(),
            Arc::new(FileInstaller(&[".venv/a.txt", ".venv/z.txt"])),
        );
        seeded.resolve("k", &ctx(&dir, "seed")).await.unwrap();
        let entry = store.get("k").await.unwrap().unwrap();
        let FileRecord::File { digest, .. } = &entry.files[".venv/z.txt"] else {
            panic!("z.txt should be a file");
        };
        std::fs::remove_file(store.root().join("blobs").join(digest)).unwrap();

        let reinstall = resolver(store.clone(), Arc::new(FileInstaller(&[".venv/b.txt"])));
        let cell = ctx(&dir, "cell");
        assert_eq!(
            reinstall.resolve("k", &cell).await.unwrap(),
            ResolveOutcome::Miss
        );

        assert!(!cell.cell_dir.join(".venv/a.txt").exists());
        assert!(cell.cell_dir.join(".venv/b.txt").exists());
        let recaptured: Vec<String> = store
            .get("k")
            .await
            .unwrap()
            .unwrap()
            .files
            .into_keys()
            .collect();
        assert_eq!(recaptured, vec![".venv", ".venv/b.txt"]);
    }

    #[tokio::test]
    async fn install_timeout_is_dependency_failure() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsCacheStore::new(dir.path().join("cache")));
        let resolver = DependencyResolver::new(
            store,
            Arc::new(HangingInstaller),
            vec![".venv".to_string()],
            Duration::from_millis(20),
        );

        let err = resolver.resolve("k", &ctx(&dir, "a")).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn unusable_store_falls_back_to_install() {
        let dir = TempDir::new().unwrap();
        let installer = Arc::new(FakeInstaller::default());
        let resolver = resolver(Arc::new(BrokenStore), installer.clone());

        let cell = ctx(&dir, "a");
        assert_eq!(
            resolver.resolve("k", &cell).await.unwrap(),
            ResolveOutcome::Miss
        );
        assert_eq!(installer.calls.load(Ordering::SeqCst), 1);
        assert!(cell.cell_dir.join(".venv/site-packages/numpy.py").exists());
    }
}
