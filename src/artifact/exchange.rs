//! Hand-off of artifacts between cells and the publish stage
//!
//! A collection is declared with the full set of cells expected to produce
//! into it. Each producer either uploads once or is abandoned (failed or
//! cancelled). `download` is a barrier: it waits until every producer is
//! terminal and then returns the whole collection, or reports which producers
//! never delivered. Artifacts are addressed by (collection, producer, file
//! name), so two cells producing the same file name never overwrite each other.

use crate::artifact::Artifact;
use crate::error::{RiggerError, RiggerResult};
use crate::matrix::CellId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Uploaded(Vec<Artifact>),
    Abandoned,
}

#[derive(Debug)]
struct CollectionState {
    version: u32,
    /// Keyed by producer id, in declaration order
    producers: Vec<(CellId, Slot)>,
}

impl CollectionState {
    fn slot_mut(&mut self, producer: &CellId) -> Option<&mut Slot> {
        self.producers
            .iter_mut()
            .find(|(id, _)| id == producer)
            .map(|(_, slot)| slot)
    }

    fn is_settled(&self) -> bool {
        self.producers
            .iter()
            .all(|(_, slot)| !matches!(slot, Slot::Pending))
    }
}

/// In-process artifact exchange shared by all cells of a run
#[derive(Debug)]
pub struct ArtifactExchange {
    collections: Mutex<HashMap<String, CollectionState>>,
    /// Bumped on every state change; downloads wait on it
    changes: watch::Sender<u64>,
}

impl Default for ArtifactExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactExchange {
    pub fn new() -> Self {
        let (changes, _rx) = watch::channel(0);
        Self {
            collections: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn lock(&self) -> RiggerResult<std::sync::MutexGuard<'_, HashMap<String, CollectionState>>> {
        self.collections
            .lock()
            .map_err(|_| RiggerError::Internal("artifact exchange lock poisoned".to_string()))
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Open a new version of `name` expecting one delivery from each producer.
    /// Any previous version of the collection is discarded.
    pub fn declare(&self, name: &str, producers: &[CellId]) -> RiggerResult<u32> {
        let mut collections = self.lock()?;
        let version = collections.get(name).map_or(1, |c| c.version + 1);
        collections.insert(
            name.to_string(),
            CollectionState {
                version,
                producers: producers.iter().map(|p| (p.clone(), Slot::Pending)).collect(),
            },
        );
        drop(collections);

        debug!("Declared collection {} v{} ({} producers)", name, version, producers.len());
        self.notify();
        Ok(version)
    }

    /// Deliver a producer's artifacts. Each producer uploads at most once.
    pub fn upload(&self, name: &str, producer: &CellId, artifacts: Vec<Artifact>) -> RiggerResult<()> {
        let mut seen = BTreeSet::new();
        for artifact in &artifacts {
            if !seen.insert(artifact.file_name()) {
                return Err(RiggerError::ExchangeConflict {
                    collection: name.to_string(),
                    producer: producer.to_string(),
                });
            }
        }

        let mut collections = self.lock()?;
        let state = collections
            .get_mut(name)
            .ok_or_else(|| RiggerError::ExchangeUnknown(name.to_string()))?;
        let slot = state
            .slot_mut(producer)
            .ok_or_else(|| RiggerError::ExchangeProducer {
                collection: name.to_string(),
                producer: producer.to_string(),
            })?;
        if !matches!(slot, Slot::Pending) {
            return Err(RiggerError::ExchangeConflict {
                collection: name.to_string(),
                producer: producer.to_string(),
            });
        }

        let count = artifacts.len();
        *slot = Slot::Uploaded(artifacts);
        drop(collections);

        info!("[{}] uploaded {} artifact(s) to {}", producer, count, name);
        self.notify();
        Ok(())
    }

    /// Mark a producer terminal without artifacts. No-op once it is terminal.
    pub fn abandon(&self, name: &str, producer: &CellId) -> RiggerResult<()> {
        let mut collections = self.lock()?;
        let Some(slot) = collections.get_mut(name).and_then(|s| s.slot_mut(producer)) else {
            return Ok(());
        };
        if matches!(slot, Slot::Pending) {
            *slot = Slot::Abandoned;
            drop(collections);
            debug!("[{}] abandoned collection {}", producer, name);
            self.notify();
        }
        Ok(())
    }

    /// Wait for every producer of `name` to become terminal, up to `limit`
    pub async fn download(&self, name: &str, limit: Duration) -> RiggerResult<Collection> {
        match tokio::time::timeout(limit, self.wait_settled(name)).await {
            Ok(result) => result,
            Err(_) => Err(RiggerError::ExchangeTimeout(name.to_string())),
        }
    }

    async fn wait_settled(&self, name: &str) -> RiggerResult<Collection> {
        // Subscribe before the first check so no change is missed in between.
        let mut rx = self.changes.subscribe();
        loop {
            if let Some(result) = self.try_collect(name)? {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(RiggerError::Internal("artifact exchange closed".to_string()));
            }
        }
    }

    fn try_collect(&self, name: &str) -> RiggerResult<Option<RiggerResult<Collection>>> {
        let collections = self.lock()?;
        let state = collections
            .get(name)
            .ok_or_else(|| RiggerError::ExchangeUnknown(name.to_string()))?;
        if !state.is_settled() {
            return Ok(None);
        }

        let missing: Vec<String> = state
            .producers
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Abandoned))
            .map(|(id, _)| id.to_string())
            .collect();
        if !missing.is_empty() {
            return Ok(Some(Err(RiggerError::ExchangeIncomplete {
                collection: name.to_string(),
                missing,
            })));
        }

        let artifacts = state
            .producers
            .iter()
            .flat_map(|(_, slot)| match slot {
                Slot::Uploaded(artifacts) => artifacts.clone(),
                _ => Vec::new(),
            })
            .collect();
        Ok(Some(Ok(Collection {
            name: name.to_string(),
            version: state.version,
            artifacts,
        })))
    }
}

/// A complete, downloaded collection
#[derive(Debug, Clone)]
pub struct Collection {
    pub name: String,
    pub version: u32,
    /// Every producer's artifacts, in producer declaration order
    pub artifacts: Vec<Artifact>,
}

impl Collection {
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// One artifact per file name. Identical files from several producers
    /// collapse to the first; different bytes under one name are a collision.
    pub fn distinct(&self) -> RiggerResult<Vec<Artifact>> {
        let mut by_name: BTreeMap<String, &Artifact> = BTreeMap::new();
        let mut out = Vec::new();
        for artifact in &self.artifacts {
            match by_name.get(&artifact.file_name()) {
                Some(existing) if existing.digest() == artifact.digest() => {
                    debug!(
                        "{} from {} duplicates {}",
                        artifact.file_name(),
                        artifact.producer(),
                        existing.producer()
                    );
                }
                Some(_) => return Err(RiggerError::ArtifactCollision(artifact.file_name())),
                None => {
                    by_name.insert(artifact.file_name(), artifact);
                    out.push(artifact.clone());
                }
            }
        }
        Ok(out)
    }

    /// Write the distinct artifacts into `dir`, returning the written paths
    pub async fn export(&self, dir: &Path) -> RiggerResult<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| RiggerError::io(format!("creating {}", dir.display()), e))?;

        let mut written = Vec::new();
        for artifact in self.distinct()? {
            let dest = dir.join(artifact.file_name());
            write_atomic(&dest, artifact.payload())
                .await
                .map_err(|e| RiggerError::io(format!("exporting {}", artifact.file_name()), e))?;
            written.push(dest);
        }
        if written.is_empty() {
            warn!("Collection {} has no artifacts to export", self.name);
        }
        Ok(written)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_file_name(format!(".tmp-{}", Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactName;
    use crate::matrix::{Binding, Cell};
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::TempDir;

    fn cell(os: &str) -> CellId {
        Cell::new(0, Binding::new(vec![("os".to_string(), os.to_string())])).id
    }

    fn artifact(producer: &CellId, file: &str, bytes: &[u8]) -> Artifact {
        Artifact::new(
            ArtifactName::parse(file).unwrap(),
            "any",
            producer.clone(),
            bytes.to_vec(),
        )
    }

    const LONG: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn download_waits_for_slow_producer() {
        let exchange = Arc::new(ArtifactExchange::new());
        let (fast, slow) = (cell("linux"), cell("macos"));
        exchange.declare("dist", &[fast.clone(), slow.clone()]).unwrap();

        exchange
            .upload("dist", &fast, vec![artifact(&fast, "p-1-cp38-linux.whl", b"l")])
            .unwrap();

        let delay = Duration::from_millis(150);
        let producer = {
            let exchange = Arc::clone(&exchange);
            let slow = slow.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                exchange
                    .upload("dist", &slow, vec![artifact(&slow, "p-1-cp38-macos.whl", b"m")])
                    .unwrap();
            })
        };

        let started = Instant::now();
        let collection = exchange.download("dist", LONG).await.unwrap();
        assert!(started.elapsed() >= delay - Duration::from_millis(10));
        assert_eq!(collection.len(), 2);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_producer_makes_collection_incomplete() {
        let exchange = ArtifactExchange::new();
        let (ok, failed) = (cell("linux"), cell("windows"));
        exchange.declare("dist", &[ok.clone(), failed.clone()]).unwrap();
        exchange
            .upload("dist", &ok, vec![artifact(&ok, "p-1-cp38-linux.whl", b"l")])
            .unwrap();
        exchange.abandon("dist", &failed).unwrap();

        match exchange.download("dist", LONG).await {
            Err(RiggerError::ExchangeIncomplete { missing, .. }) => {
                assert_eq!(missing, vec![failed.to_string()]);
            }
            other => panic!("expected incomplete collection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn download_times_out_while_producers_are_pending() {
        let exchange = ArtifactExchange::new();
        exchange.declare("dist", &[cell("linux")]).unwrap();
        assert!(matches!(
            exchange.download("dist", Duration::from_millis(30)).await,
            Err(RiggerError::ExchangeTimeout(_))
        ));
    }

    #[test]
    fn second_upload_from_same_producer_conflicts() {
        let exchange = ArtifactExchange::new();
        let linux = cell("linux");
        exchange.declare("dist", &[linux.clone()]).unwrap();
        exchange.upload("dist", &linux, vec![]).unwrap();
        assert!(matches!(
            exchange.upload("dist", &linux, vec![]),
            Err(RiggerError::ExchangeConflict { .. })
        ));
        // abandoning a delivered producer changes nothing
        exchange.abandon("dist", &linux).unwrap();
    }

    #[test]
    fn unknown_collection_and_producer_are_rejected() {
        let exchange = ArtifactExchange::new();
        let linux = cell("linux");
        assert!(matches!(
            exchange.upload("nope", &linux, vec![]),
            Err(RiggerError::ExchangeUnknown(_))
        ));
        exchange.declare("dist", &[linux]).unwrap();
        assert!(matches!(
            exchange.upload("dist", &cell("macos"), vec![]),
            Err(RiggerError::ExchangeProducer { .. })
        ));
    }

    #[test]
    fn redeclaring_starts_a_new_version() {
        let exchange = ArtifactExchange::new();
        let linux = cell("linux");
        assert_eq!(exchange.declare("dist", &[linux.clone()]).unwrap(), 1);
        exchange.upload("dist", &linux, vec![]).unwrap();
        assert_eq!(exchange.declare("dist", &[linux.clone()]).unwrap(), 2);
        exchange.upload("dist", &linux, vec![]).unwrap();
    }

    #[tokio::test]
    async fn same_file_name_from_two_producers() {
        let exchange = ArtifactExchange::new();
        let (a, b) = (cell("linux"), cell("macos"));
        exchange.declare("dist", &[a.clone(), b.clone()]).unwrap();
        exchange
            .upload("dist", &a, vec![artifact(&a, "p-1-py3-none.whl", b"same")])
            .unwrap();
        exchange
            .upload("dist", &b, vec![artifact(&b, "p-1-py3-none.whl", b"same")])
            .unwrap();

        let collection = exchange.download("dist", LONG).await.unwrap();
        assert_eq!(collection.len(), 2);
        assert_eq!(collection.distinct().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conflicting_contents_under_one_name_collide() {
        let exchange = ArtifactExchange::new();
        let (a, b) = (cell("linux"), cell("macos"));
        exchange.declare("dist", &[a.clone(), b.clone()]).unwrap();
        exchange
            .upload("dist", &a, vec![artifact(&a, "p-1-py3-none.whl", b"one")])
            .unwrap();
        exchange
            .upload("dist", &b, vec![artifact(&b, "p-1-py3-none.whl", b"two")])
            .unwrap();

        let collection = exchange.download("dist", LONG).await.unwrap();
        assert!(matches!(
            collection.distinct(),
            Err(RiggerError::ArtifactCollision(_))
        ));
    }

    #[tokio::test]
    async fn export_writes_payloads() {
        let dir = TempDir::new().unwrap();
        let exchange = ArtifactExchange::new();
        let linux = cell("linux");
        exchange.declare("dist", &[linux.clone()]).unwrap();
        exchange
            .upload("dist", &linux, vec![artifact(&linux, "p-1-cp38-linux.whl", b"wheel")])
            .unwrap();

        let collection = exchange.download("dist", LONG).await.unwrap();
        let written = collection.export(&dir.path().join("dist")).await.unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(std::fs::read(&written[0]).unwrap(), b"wheel");
    }
}
