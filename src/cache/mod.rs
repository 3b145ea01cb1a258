//! Persistent dependency cache
//!
//! Dependency state for a cell is keyed by a rendered [`CacheKey`] template.
//!
//! # Entry lifecycle
//!
//! | State | Visible to readers | Description |
//! |-------|--------------------|-------------|
//! | Miss | - | No entry, or entry older than `max_age_days` |
//! | Captured | no | Blobs written, manifest not yet published |
//! | Published | yes | Manifest renamed into place, replaces any previous entry |
//!
//! Entries are never deleted implicitly. Bumping the `generation` in the key
//! template starts a fresh namespace; `rigger cache gc` reclaims old entries.

pub mod key;
pub mod resolver;
pub mod store;

pub use key::{key_digest, CacheKey, KeyVars, BUILTIN_KEY_VARS};
pub use resolver::{CommandInstaller, DependencyResolver, Installer, ResolveOutcome};
pub use store::{check_cache_path, CacheEntry, CacheStore, FileRecord, FsCacheStore};
