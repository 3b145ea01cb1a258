//! Durable key/value store for dependency state
//!
//! File contents are stored once under `blobs/<sha256>`; an entry is a JSON
//! manifest mapping relative paths to blobs, stored under
//! `entries/<sha256(key)>.json`. Both are written to a temporary file and
//! renamed into place, so a reader sees either the previous entry or the new
//! one, never a partial write. Concurrent writers to the same key race to the
//! final rename and the last one wins.

use crate::cache::key::key_digest;
use crate::error::{RiggerError, RiggerResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// One captured path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileRecord {
    File {
        digest: String,
        size: u64,
        /// Permission bits as installed (0 where the platform has none)
        mode: u32,
    },
    Symlink {
        target: String,
    },
    Dir {
        mode: u32,
    },
}

/// Stored dependency state for one cache key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Rendered cache key
    pub key: String,
    /// Declared paths, relative to the cell directory
    pub roots: Vec<String>,
    /// Every file, directory and symlink below the roots
    pub files: BTreeMap<String, FileRecord>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn total_size(&self) -> u64 {
        self.files
            .values()
            .map(|r| match r {
                FileRecord::File { size, .. } => *size,
                _ => 0,
            })
            .sum()
    }

    pub fn is_older_than(&self, age: Duration) -> bool {
        self.created_at < Utc::now() - age
    }

    fn blob_digests(&self) -> impl Iterator<Item = &str> {
        self.files.values().filter_map(|r| match r {
            FileRecord::File { digest, .. } => Some(digest.as_str()),
            _ => None,
        })
    }
}

/// Key/value persistence for dependency artifacts
///
/// A miss is `Ok(None)`. `put` replaces any previous entry under the key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> RiggerResult<Option<CacheEntry>>;

    async fn put(&self, key: &str, entry: &CacheEntry) -> RiggerResult<()>;

    /// Store the contents of `roots` below `base` and describe them as an
    /// entry for `key`. The entry is not visible until passed to `put`.
    async fn capture(&self, key: &str, base: &Path, roots: &[String]) -> RiggerResult<CacheEntry>;

    /// Recreate an entry's files below `base`, replacing whatever the roots held
    async fn materialize(&self, entry: &CacheEntry, base: &Path) -> RiggerResult<()>;

    async fn list(&self) -> RiggerResult<Vec<CacheEntry>>;

    /// Remove the entry for `key`, returning whether one existed
    async fn remove(&self, key: &str) -> RiggerResult<bool>;
}

/// Reject cache paths that are absolute or escape the cell directory
pub fn check_cache_path(path: &str) -> RiggerResult<()> {
    let p = Path::new(path);
    let escapes = p
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.trim().is_empty() || p.is_absolute() || escapes {
        return Err(RiggerError::PipelineInvalid(format!(
            "cache path '{path}' must be relative to the cell directory"
        )));
    }
    Ok(())
}

/// File-system backed cache store
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    root: PathBuf,
    max_age: Option<Duration>,
}

impl FsCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_age: None,
        }
    }

    /// Entries older than `days` read as misses (0 disables expiry)
    pub fn with_max_age_days(mut self, days: u32) -> Self {
        self.max_age = (days > 0).then(|| Duration::days(i64::from(days)));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join("entries")
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.entries_dir().join(format!("{}.json", key_digest(key)))
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.blobs_dir().join(digest)
    }

    /// Delete blobs no entry refers to. Returns (count, bytes) removed.
    pub async fn prune_blobs(&self) -> RiggerResult<(usize, u64)> {
        let referenced: HashSet<String> = self
            .list()
            .await?
            .iter()
            .flat_map(|e| e.blob_digests().map(str::to_string).collect::<Vec<_>>())
            .collect();

        let this = self.clone();
        blocking(move || {
            let mut removed = (0, 0);
            let dir = this.blobs_dir();
            if !dir.exists() {
                return Ok(removed);
            }
            for item in fs::read_dir(&dir).map_err(|e| RiggerError::io("reading blob directory", e))? {
                let item = item.map_err(|e| RiggerError::io("reading blob entry", e))?;
                let name = item.file_name().to_string_lossy().into_owned();
                if referenced.contains(&name) {
                    continue;
                }
                let size = item.metadata().map(|m| m.len()).unwrap_or(0);
                fs::remove_file(item.path())
                    .map_err(|e| RiggerError::io(format!("removing blob {name}"), e))?;
                removed.0 += 1;
                removed.1 += size;
            }
            Ok(removed)
        })
        .await
    }

    fn read_entry(&self, key: &str) -> RiggerResult<Option<CacheEntry>> {
        let path = self.entry_path(key);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RiggerError::io(
                    format!("reading cache entry {}", path.display()),
                    e,
                ))
            }
        };

        let entry: CacheEntry =
            serde_json::from_slice(&content).map_err(|e| RiggerError::CacheCorrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        if entry.key != key {
            warn!("Cache slot for {} holds entry for {}, ignoring", key, entry.key);
            return Ok(None);
        }

        if let Some(max_age) = self.max_age {
            if entry.is_older_than(max_age) {
                debug!("Cache entry {} expired (created {})", key, entry.created_at);
                return Ok(None);
            }
        }

        Ok(Some(entry))
    }

    fn write_entry(&self, key: &str, entry: &CacheEntry) -> RiggerResult<()> {
        if entry.key != key {
            return Err(RiggerError::Internal(format!(
                "entry for {} stored under key {}",
                entry.key, key
            )));
        }
        if let Some(missing) = entry.blob_digests().find(|d| !self.blob_path(d).exists()) {
            return Err(RiggerError::CacheCorrupt {
                key: key.to_string(),
                reason: format!("blob {missing} is missing"),
            });
        }

        let dir = self.entries_dir();
        fs::create_dir_all(&dir).map_err(|e| RiggerError::io("creating cache entries dir", e))?;
        let content = serde_json::to_vec_pretty(entry)?;
        write_atomic(&self.entry_path(key), &content)
            .map_err(|e| RiggerError::io(format!("publishing cache entry {key}"), e))
    }

    fn capture_blocking(&self, key: &str, base: &Path, roots: &[String]) -> RiggerResult<CacheEntry> {
        let blobs = self.blobs_dir();
        fs::create_dir_all(&blobs).map_err(|e| RiggerError::io("creating cache blob dir", e))?;

        let mut files = BTreeMap::new();
        for root in roots {
            check_cache_path(root)?;
            let start = base.join(root);
            if fs::symlink_metadata(&start).is_err() {
                debug!("Cache path {} does not exist, nothing to capture", start.display());
                continue;
            }

            for item in WalkDir::new(&start).follow_links(false).sort_by_file_name() {
                let item = item.map_err(|e| {
                    RiggerError::io(
                        format!("walking {}", start.display()),
                        e.into_io_error()
                            .unwrap_or_else(|| io::Error::other("symlink loop")),
                    )
                })?;
                let rel = relative_key(base, item.path())?;
                let file_type = item.file_type();
                let meta = fs::symlink_metadata(item.path())
                    .map_err(|e| RiggerError::io(format!("inspecting {rel}"), e))?;

                let record = if file_type.is_dir() {
                    FileRecord::Dir {
                        mode: permission_bits(&meta),
                    }
                } else if file_type.is_symlink() {
                    let target = fs::read_link(item.path())
                        .map_err(|e| RiggerError::io(format!("reading link {rel}"), e))?;
                    FileRecord::Symlink {
                        target: target.to_string_lossy().into_owned(),
                    }
                } else {
                    let bytes = fs::read(item.path())
                        .map_err(|e| RiggerError::io(format!("reading {rel}"), e))?;
                    let digest = content_digest(&bytes);
                    let blob = self.blob_path(&digest);
                    if !blob.exists() {
                        write_atomic(&blob, &bytes)
                            .map_err(|e| RiggerError::io(format!("storing blob for {rel}"), e))?;
                    }
                    FileRecord::File {
                        digest,
                        size: bytes.len() as u64,
                        mode: permission_bits(&meta),
                    }
                };
                files.insert(rel, record);
            }
        }

        Ok(CacheEntry {
            key: key.to_string(),
            roots: roots.to_vec(),
            files,
            created_at: Utc::now(),
        })
    }

    fn materialize_blocking(&self, entry: &CacheEntry, base: &Path) -> RiggerResult<()> {
        for root in &entry.roots {
            check_cache_path(root)?;
            remove_path(&base.join(root))?;
        }

        // BTreeMap order puts every directory before its children. Directory
        // modes are applied last so read-only directories can still be filled.
        let mut dirs = Vec::new();
        for (rel, record) in &entry.files {
            let dest = base.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| RiggerError::io(format!("creating {}", parent.display()), e))?;
            }
            match record {
                FileRecord::Dir { mode } => {
                    fs::create_dir_all(&dest)
                        .map_err(|e| RiggerError::io(format!("creating {rel}"), e))?;
                    dirs.push((dest, *mode));
                }
                FileRecord::File { digest, mode, .. } => {
                    let blob = self.blob_path(digest);
                    if !blob.exists() {
                        return Err(RiggerError::CacheCorrupt {
                            key: entry.key.clone(),
                            reason: format!("blob {digest} for {rel} is missing"),
                        });
                    }
                    fs::copy(&blob, &dest)
                        .map_err(|e| RiggerError::io(format!("restoring {rel}"), e))?;
                    set_mode(&dest, *mode)?;
                }
                FileRecord::Symlink { target } => restore_symlink(target, &dest)?,
            }
        }
        for (dir, mode) in dirs.iter().rev() {
            set_mode(dir, *mode)?;
        }
        Ok(())
    }

    fn list_blocking(&self) -> RiggerResult<Vec<CacheEntry>> {
        let dir = self.entries_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for item in fs::read_dir(&dir).map_err(|e| RiggerError::io("reading cache entries", e))? {
            let path = item
                .map_err(|e| RiggerError::io("reading cache entry", e))?
                .path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match fs::read(&path).map(|c| serde_json::from_slice::<CacheEntry>(&c)) {
                Ok(Ok(entry)) => entries.push(entry),
                _ => warn!("Skipping unreadable cache entry {}", path.display()),
            }
        }

        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn get(&self, key: &str) -> RiggerResult<Option<CacheEntry>> {
        let this = self.clone();
        let key = key.to_string();
        blocking(move || this.read_entry(&key)).await
    }

    async fn put(&self, key: &str, entry: &CacheEntry) -> RiggerResult<()> {
        let this = self.clone();
        let key = key.to_string();
        let entry = entry.clone();
        blocking(move || this.write_entry(&key, &entry)).await?;
        debug!("Cache entry published");
        Ok(())
    }

    async fn capture(&self, key: &str, base: &Path, roots: &[String]) -> RiggerResult<CacheEntry> {
        let this = self.clone();
        let key = key.to_string();
        let base = base.to_path_buf();
        let roots = roots.to_vec();
        blocking(move || this.capture_blocking(&key, &base, &roots)).await
    }

    async fn materialize(&self, entry: &CacheEntry, base: &Path) -> RiggerResult<()> {
        let this = self.clone();
        let entry = entry.clone();
        let base = base.to_path_buf();
        blocking(move || this.materialize_blocking(&entry, &base)).await
    }

    async fn list(&self) -> RiggerResult<Vec<CacheEntry>> {
        let this = self.clone();
        blocking(move || this.list_blocking()).await
    }

    async fn remove(&self, key: &str) -> RiggerResult<bool> {
        let path = self.entry_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RiggerError::io(format!("removing cache entry {key}"), e)),
        }
    }
}

async fn blocking<T, F>(f: F) -> RiggerResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> RiggerResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RiggerError::Internal(format!("cache worker failed: {e}")))?
}

fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write to a sibling temp file, then rename over the destination
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_file_name(format!(".tmp-{}", Uuid::new_v4()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

/// Portable `/`-separated path of `path` relative to `base`
fn relative_key(base: &Path, path: &Path) -> RiggerResult<String> {
    let rel = path.strip_prefix(base).map_err(|_| {
        RiggerError::Internal(format!("{} is outside {}", path.display(), base.display()))
    })?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Remove a file or directory tree; restored read-only directories are
/// made writable first
pub(crate) fn remove_path(path: &Path) -> RiggerResult<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).or_else(|e| {
            if e.kind() != io::ErrorKind::PermissionDenied {
                return Err(e);
            }
            unlock_dirs(path);
            fs::remove_dir_all(path)
        }),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| RiggerError::io(format!("clearing {}", path.display()), e))
}

#[cfg(unix)]
fn unlock_dirs(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    for item in WalkDir::new(path).follow_links(false).into_iter().flatten() {
        if item.file_type().is_dir() {
            if let Ok(meta) = item.metadata() {
                let mode = meta.permissions().mode() | 0o700;
                let _ = fs::set_permissions(item.path(), fs::Permissions::from_mode(mode));
            }
        }
    }
}

#[cfg(not(unix))]
fn unlock_dirs(_path: &Path) {}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(_meta: &fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> RiggerResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| RiggerError::io(format!("setting mode on {}", path.display()), e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> RiggerResult<()> {
    Ok(())
}

#[cfg(unix)]
fn restore_symlink(target: &str, dest: &Path) -> RiggerResult<()> {
    std::os::unix::fs::symlink(target, dest)
        .map_err(|e| RiggerError::io(format!("linking {}", dest.display()), e))
}

#[cfg(not(unix))]
fn restore_symlink(target: &str, dest: &Path) -> RiggerResult<()> {
    warn!("Skipping symlink {} -> {} on this platform", dest.display(), target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn populate(base: &Path, marker: &str) {
        let venv = base.join(".venv");
        fs::create_dir_all(venv.join("lib/site-packages/numpy")).unwrap();
        fs::create_dir_all(venv.join("empty")).unwrap();
        fs::write(venv.join("lib/site-packages/numpy/__init__.py"), marker).unwrap();
        fs::write(venv.join("pyvenv.cfg"), "home = /usr/bin\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::create_dir_all(venv.join("bin")).unwrap();
            let activate = venv.join("bin/activate");
            fs::write(&activate, "#!/bin/sh\n").unwrap();
            fs::set_permissions(&activate, fs::Permissions::from_mode(0o755)).unwrap();
            std::os::unix::fs::symlink("/usr/bin/python3", venv.join("bin/python")).unwrap();
        }
    }

    /// Relative path -> (is_dir, contents or link target, permission bits)
    fn tree(base: &Path) -> BTreeMap<String, (bool, Vec<u8>, u32)> {
        let mut out = BTreeMap::new();
        for item in WalkDir::new(base).min_depth(1).follow_links(false) {
            let item = item.unwrap();
            let rel = relative_key(base, item.path()).unwrap();
            let ft = item.file_type();
            let meta = fs::symlink_metadata(item.path()).unwrap();
            let value = if ft.is_dir() {
                (true, Vec::new(), permission_bits(&meta))
            } else if ft.is_symlink() {
                let target = fs::read_link(item.path()).unwrap();
                (false, target.to_string_lossy().as_bytes().to_vec(), 0)
            } else {
                (false, fs::read(item.path()).unwrap(), permission_bits(&meta))
            };
            out.insert(rel, value);
        }
        out
    }

    #[tokio::test]
    async fn miss_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FsCacheStore::new(dir.path());
        assert!(store.get("deps-linux").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn capture_put_materialize_is_bit_identical() {
        let dir = TempDir::new().unwrap();
        let store = FsCacheStore::new(dir.path().join("cache"));
        let first = dir.path().join("cell-a");
        populate(&first, "v1");

        let roots = vec![".venv".to_string()];
        let entry = store.capture("deps-linux", &first, &roots).await.unwrap();
        store.put("deps-linux", &entry).await.unwrap();

        let fetched = store.get("deps-linux").await.unwrap().unwrap();
        assert_eq!(fetched, entry);

        let second = dir.path().join("cell-b");
        fs::create_dir_all(&second).unwrap();
        store.materialize(&fetched, &second).await.unwrap();

        assert_eq!(tree(&first), tree(&second));
    }

    #[tokio::test]
    async fn materialize_replaces_stale_files() {
        let dir = TempDir::new().unwrap();
        let store = FsCacheStore::new(dir.path().join("cache"));
        let src = dir.path().join("src");
        populate(&src, "fresh");
        let entry = store
            .capture("k", &src, &[".venv".to_string()])
            .await
            .unwrap();

        let dest = dir.path().join("dest");
        fs::create_dir_all(dest.join(".venv")).unwrap();
        fs::write(dest.join(".venv/stale.txt"), "old").unwrap();
        store.materialize(&entry, &dest).await.unwrap();

        assert!(!dest.join(".venv/stale.txt").exists());
        assert_eq!(tree(&src), tree(&dest));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn materialize_restores_exact_permission_bits() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = FsCacheStore::new(dir.path().join("cache"));
        let src = dir.path().join("src");
        let locked = src.join(".venv/locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(src.join(".venv/secret.cfg"), "token = none\n").unwrap();
        fs::write(src.join(".venv/tool"), "#!/bin/sh\n").unwrap();
        fs::write(locked.join("ro.txt"), "frozen").unwrap();
        fs::set_permissions(src.join(".venv/secret.cfg"), fs::Permissions::from_mode(0o600)).unwrap();
        fs::set_permissions(src.join(".venv/tool"), fs::Permissions::from_mode(0o750)).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();

        let entry = store
            .capture("k", &src, &[".venv".to_string()])
            .await
            .unwrap();
        let dest = dir.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        store.materialize(&entry, &dest).await.unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode(&dest.join(".venv/secret.cfg")), 0o600);
        assert_eq!(mode(&dest.join(".venv/tool")), 0o750);
        assert_eq!(mode(&dest.join(".venv/locked")), 0o555);
        assert_eq!(tree(&src), tree(&dest));

        // a restored read-only directory does not block the next restore
        store.materialize(&entry, &dest).await.unwrap();
        assert_eq!(tree(&src), tree(&dest));

        for base in [&src, &dest] {
            remove_path(base).unwrap();
        }
    }

    #[tokio::test]
    async fn put_supersedes_previous_entry() {
        let dir = TempDir::new().unwrap();
        let store = FsCacheStore::new(dir.path().join("cache"));
        let roots = vec![".venv".to_string()];

        let old = dir.path().join("old");
        populate(&old, "old");
        let old_entry = store.capture("k", &old, &roots).await.unwrap();
        store.put("k", &old_entry).await.unwrap();

        let new = dir.path().join("new");
        populate(&new, "new");
        let new_entry = store.capture("k", &new, &roots).await.unwrap();
        store.put("k", &new_entry).await.unwrap();

        assert_eq!(store.get("k").await.unwrap().unwrap(), new_entry);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_entries_read_as_miss() {
        let dir = TempDir::new().unwrap();
        let store = FsCacheStore::new(dir.path()).with_max_age_days(7);
        let entry = CacheEntry {
            key: "k".to_string(),
            roots: vec![],
            files: BTreeMap::new(),
            created_at: Utc::now() - Duration::days(8),
        };
        store.put("k", &entry).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());

        // without a TTL the same entry is a hit
        let forever = FsCacheStore::new(dir.path());
        assert!(forever.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn put_rejects_entry_with_missing_blob() {
        let dir = TempDir::new().unwrap();
        let store = FsCacheStore::new(dir.path());
        let entry = CacheEntry {
            key: "k".to_string(),
            roots: vec!["x".to_string()],
            files: BTreeMap::from([(
                "x".to_string(),
                FileRecord::File {
                    digest: "00".repeat(32),
                    size: 1,
                    mode: 0o644,
                },
            )]),
            created_at: Utc::now(),
        };
        assert!(matches!(
            store.put("k", &entry).await,
            Err(RiggerError::CacheCorrupt { .. })
        ));
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_manifest_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = FsCacheStore::new(dir.path());
        fs::create_dir_all(store.entries_dir()).unwrap();
        fs::write(store.entry_path("k"), b"{ not json").unwrap();
        assert!(matches!(
            store.get("k").await,
            Err(RiggerError::CacheCorrupt { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_writers_leave_a_complete_entry() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsCacheStore::new(dir.path().join("cache")));
        let roots = vec![".venv".to_string()];

        let mut expected = Vec::new();
        for i in 0..6 {
            let base = dir.path().join(format!("writer-{i}"));
            populate(&base, &format!("writer {i}"));
            expected.push(store.capture("shared", &base, &roots).await.unwrap());
        }

        let mut handles = Vec::new();
        for entry in expected.clone() {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    store.put("shared", &entry).await.unwrap();
                    let seen = store.get("shared").await.unwrap().unwrap();
                    assert!(seen.files.len() == entry.files.len());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let winner = store.get("shared").await.unwrap().unwrap();
        assert!(expected.iter().any(|e| e.files == winner.files));
    }

    #[tokio::test]
    async fn prune_removes_unreferenced_blobs() {
        let dir = TempDir::new().unwrap();
        let store = FsCacheStore::new(dir.path().join("cache"));
        let base = dir.path().join("cell");
        populate(&base, "v1");
        let entry = store
            .capture("k", &base, &[".venv".to_string()])
            .await
            .unwrap();
        store.put("k", &entry).await.unwrap();

        assert_eq!(store.prune_blobs().await.unwrap().0, 0);
        store.remove("k").await.unwrap();
        assert!(store.prune_blobs().await.unwrap().0 > 0);
    }

    #[test]
    fn cache_paths_must_stay_inside_cell_dir() {
        assert!(check_cache_path(".venv").is_ok());
        assert!(check_cache_path("cache/pip").is_ok());
        assert!(check_cache_path("../outside").is_err());
        assert!(check_cache_path("/abs").is_err());
        assert!(check_cache_path("").is_err());
    }
}
