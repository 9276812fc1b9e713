//! # Content Index
//!
//! Authoritative catalog of the files the server distributes, keyed by
//! content hash.
//!
//! ## Components
//! - **Builder**: walks the configured rules and hashes every file
//! - **Watcher**: turns OS change notifications into [`ChangeEvent`]s
//! - **Debounce**: batches bursts of changes into a single rebuild
//!
//! ## Concurrency
//! The current catalog is an immutable [`IndexSnapshot`] behind a reader/writer
//! lock. Sessions clone the `Arc` once and keep it for their whole exchange, so
//! a session never observes a half-applied rebuild and never holds the lock
//! across network I/O. Writers (rebuild and remove handling) swap or
//! copy-on-write the snapshot; sessions that already hold the old one keep a
//! consistent view.

pub mod builder;
pub mod debounce;
pub mod watcher;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, instrument, warn};

use crate::config::{IndexConfig, IndexRule};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::hash::ContentHash;

pub use builder::BuildReport;
pub use debounce::Debouncer;
pub use watcher::NotifyWatchRegistry;

/// Whether an update may replace a file the client already has
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplacePolicy {
    /// Always send when the client lacks this exact content
    Overwrite,
    /// Skip if the client reported any file at the same path
    PreserveIfPresent,
}

impl ReplacePolicy {
    pub fn for_rule(rule: &IndexRule) -> Self {
        if rule.mandatory {
            ReplacePolicy::Overwrite
        } else {
            ReplacePolicy::PreserveIfPresent
        }
    }
}

/// One indexed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    /// Absolute source location on the server
    pub server_path: PathBuf,
    /// Target path relative to the client install directory, `/`-separated
    pub client_path: String,
    pub hash: ContentHash,
    pub policy: ReplacePolicy,
}

/// Immutable view of the index at one point in time
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    by_hash: HashMap<ContentHash, ContentEntry>,
    by_path: HashMap<PathBuf, ContentHash>,
    epoch: u64,
}

impl IndexSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Build number that produced this snapshot
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn lookup(&self, hash: &ContentHash) -> Option<&ContentEntry> {
        self.by_hash.get(hash)
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn lookup_path(&self, server_path: &Path) -> Option<&ContentEntry> {
        self.by_path
            .get(server_path)
            .and_then(|hash| self.by_hash.get(hash))
    }

    pub fn entries(&self) -> impl Iterator<Item = &ContentEntry> {
        self.by_hash.values()
    }

    /// Insert an entry, replacing any entry with the same hash.
    ///
    /// Identical content from two sources collapses to one entry: the later
    /// insert wins and the earlier source path is dropped from the path map.
    pub fn insert(&mut self, entry: ContentEntry) {
        if let Some(previous) = self.by_path.remove(&entry.server_path) {
            if previous != entry.hash {
                self.by_hash.remove(&previous);
            }
        }
        if let Some(replaced) = self.by_hash.get(&entry.hash) {
            if replaced.server_path != entry.server_path {
                self.by_path.remove(&replaced.server_path);
            }
        }
        self.by_path.insert(entry.server_path.clone(), entry.hash);
        self.by_hash.insert(entry.hash, entry);
    }

    /// Remove the entry sourced from `server_path`, if any
    pub fn remove_path(&mut self, server_path: &Path) -> Option<ContentEntry> {
        let hash = self.by_path.remove(server_path)?;
        self.by_hash.remove(&hash)
    }

    /// Remove every entry sourced from below `dir`
    pub fn remove_tree(&mut self, dir: &Path) -> usize {
        let doomed: Vec<PathBuf> = self
            .by_path
            .keys()
            .filter(|path| path.starts_with(dir))
            .cloned()
            .collect();
        for path in &doomed {
            self.remove_path(path);
        }
        doomed.len()
    }

    /// Entries to stream to a client.
    ///
    /// Every entry whose hash was not advertised, minus preserve-policy entries
    /// whose client path the client already reported. Ordered by client path.
    pub fn delta<'a>(
        &'a self,
        advertised: &HashSet<ContentHash>,
        reported_paths: &HashSet<String>,
    ) -> Vec<&'a ContentEntry> {
        let mut delta: Vec<&ContentEntry> = self
            .by_hash
            .values()
            .filter(|entry| !advertised.contains(&entry.hash))
            .filter(|entry| {
                !(entry.policy == ReplacePolicy::PreserveIfPresent
                    && reported_paths.contains(&entry.client_path))
            })
            .collect();
        delta.sort_by(|a, b| a.client_path.cmp(&b.client_path));
        delta
    }
}

/// A classified filesystem change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A file or directory disappeared
    Remove(PathBuf),
    /// A directory appeared and needs its own watch
    CreateDir(PathBuf),
    /// Anything else; handled by a debounced rebuild
    Other(PathBuf),
}

/// What [`ContentIndex::apply_change_event`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// An indexed entry or watched directory was dropped
    Removed,
    /// A watch was registered for a new directory
    Watched,
    /// The caller should schedule a debounced rebuild
    NeedsRebuild,
    /// Nothing indexed was affected
    Ignored,
}

/// Directory watch registration.
///
/// OS watches are not recursive; every directory has to be subscribed on
/// its own.
pub trait WatchRegistry: Send {
    fn watch(&mut self, dir: &Path) -> Result<()>;
    fn unwatch(&mut self, dir: &Path) -> Result<()>;
}

/// Registry that only records subscriptions; used when no OS watcher is wanted
#[derive(Debug, Default)]
pub struct NoopWatchRegistry;

impl WatchRegistry for NoopWatchRegistry {
    fn watch(&mut self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    fn unwatch(&mut self, _dir: &Path) -> Result<()> {
        Ok(())
    }
}

struct Watches {
    registry: Box<dyn WatchRegistry>,
    watched: HashSet<PathBuf>,
}

impl Watches {
    fn add(&mut self, dir: &Path) {
        if self.watched.contains(dir) {
            return;
        }
        match self.registry.watch(dir) {
            Ok(()) => {
                self.watched.insert(dir.to_path_buf());
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to watch directory"),
        }
    }

    fn release(&mut self, dir: &Path) -> bool {
        if !self.watched.remove(dir) {
            return false;
        }
        if let Err(e) = self.registry.unwatch(dir) {
            debug!(dir = %dir.display(), error = %e, "Failed to release watch");
        }
        true
    }
}

/// Result of [`ContentIndex::prepare`], not yet serving
#[derive(Debug)]
pub struct PreparedBuild {
    snapshot: IndexSnapshot,
    visited: HashSet<PathBuf>,
    report: BuildReport,
}

impl PreparedBuild {
    pub fn report(&self) -> &BuildReport {
        &self.report
    }
}

/// The live content index owned by the server
pub struct ContentIndex {
    config: IndexConfig,
    current: RwLock<Arc<IndexSnapshot>>,
    watches: Mutex<Watches>,
    epoch: AtomicU64,
}

impl ContentIndex {
    /// Create an empty index; call [`ContentIndex::build`] to populate it
    pub fn new(config: IndexConfig) -> Self {
        Self::with_registry(config, Box::new(NoopWatchRegistry))
    }

    pub fn with_registry(config: IndexConfig, registry: Box<dyn WatchRegistry>) -> Self {
        Self {
            config,
            current: RwLock::new(Arc::new(IndexSnapshot::new())),
            watches: Mutex::new(Watches {
                registry,
                watched: HashSet::new(),
            }),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Rebuild the whole catalog from the rule set and swap it in.
    ///
    /// Blocking: walks and hashes the filesystem. Rule failures are logged and
    /// reported; the previous snapshot keeps serving until the swap.
    pub fn build(&self) -> Result<BuildReport> {
        let prepared = self.prepare();
        self.install(prepared)
    }

    /// Walk and hash every rule without touching the live snapshot
    #[instrument(skip(self), fields(rules = self.config.rules.len()))]
    pub fn prepare(&self) -> PreparedBuild {
        let (snapshot, visited, report) = builder::build_snapshot(&self.config);
        PreparedBuild {
            snapshot,
            visited,
            report,
        }
    }

    /// Swap a prepared catalog in and move the directory watches to match it
    pub fn install(&self, prepared: PreparedBuild) -> Result<BuildReport> {
        let PreparedBuild {
            mut snapshot,
            visited,
            report,
        } = prepared;

        let epoch = {
            let mut current = self
                .current
                .write()
                .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
            let epoch = self.epoch.load(Ordering::Acquire) + 1;
            snapshot.epoch = epoch;
            *current = Arc::new(snapshot);
            self.epoch.store(epoch, Ordering::Release);
            epoch
        };

        let mut watches = self.lock_watches()?;
        let stale: Vec<PathBuf> = watches
            .watched
            .iter()
            .filter(|dir| !visited.contains(*dir))
            .cloned()
            .collect();
        for dir in &stale {
            watches.release(dir);
        }
        for dir in &visited {
            watches.add(dir);
        }

        info!(
            epoch,
            files = report.files,
            rules_failed = report.rules_failed,
            skipped = report.skipped,
            watched = watches.watched.len(),
            "Content index built"
        );
        Ok(report)
    }

    /// Current snapshot; cheap, holds the read lock only for the `Arc` clone
    pub fn snapshot(&self) -> Result<Arc<IndexSnapshot>> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))
    }

    pub fn lookup(&self, hash: &ContentHash) -> Result<Option<ContentEntry>> {
        Ok(self.snapshot()?.lookup(hash).cloned())
    }

    /// Number of completed builds
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn is_watched(&self, dir: &Path) -> bool {
        self.lock_watches()
            .map(|watches| watches.watched.contains(dir))
            .unwrap_or(false)
    }

    pub fn watched_dirs(&self) -> Result<Vec<PathBuf>> {
        let watches = self.lock_watches()?;
        let mut dirs: Vec<PathBuf> = watches.watched.iter().cloned().collect();
        dirs.sort();
        Ok(dirs)
    }

    /// Apply one classified filesystem change
    #[instrument(skip(self), level = "debug")]
    pub fn apply_change_event(&self, event: ChangeEvent) -> Result<ChangeOutcome> {
        match event {
            ChangeEvent::Remove(path) => self.handle_remove(&path),
            ChangeEvent::CreateDir(dir) => {
                if builder::is_ignored(&dir, &self.config.ignored) {
                    return Ok(ChangeOutcome::Ignored);
                }
                self.lock_watches()?.add(&dir);
                debug!(dir = %dir.display(), "Watching new directory");
                Ok(ChangeOutcome::Watched)
            }
            ChangeEvent::Other(_) => Ok(ChangeOutcome::NeedsRebuild),
        }
    }

    fn handle_remove(&self, path: &Path) -> Result<ChangeOutcome> {
        let released = self.lock_watches()?.release(path);

        let mut current = self
            .current
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
        let indexed = current.lookup_path(path).is_some();
        let nested = released
            && current
                .by_path
                .keys()
                .any(|indexed_path| indexed_path.starts_with(path));
        if !indexed && !nested {
            return Ok(if released {
                ChangeOutcome::Removed
            } else {
                ChangeOutcome::Ignored
            });
        }

        let snapshot = Arc::make_mut(&mut *current);
        let removed = if indexed {
            usize::from(snapshot.remove_path(path).is_some())
        } else {
            snapshot.remove_tree(path)
        };
        drop(current);

        if released {
            self.release_tree(path)?;
        }
        debug!(path = %path.display(), removed, "Removed from index");
        Ok(ChangeOutcome::Removed)
    }

    fn release_tree(&self, dir: &Path) -> Result<()> {
        let mut watches = self.lock_watches()?;
        let nested: Vec<PathBuf> = watches
            .watched
            .iter()
            .filter(|watched| watched.starts_with(dir))
            .cloned()
            .collect();
        for watched in &nested {
            watches.release(watched);
        }
        Ok(())
    }

    fn lock_watches(&self) -> Result<std::sync::MutexGuard<'_, Watches>> {
        self.watches
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))
    }
}

impl std::fmt::Debug for ContentIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentIndex")
            .field("rules", &self.config.rules.len())
            .field("epoch", &self.epoch())
            .finish()
    }
}
