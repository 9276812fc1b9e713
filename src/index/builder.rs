//! Index building: walk every rule, hash every file, record every directory.
//!
//! Rules are applied in order, each into its own buffer. A rule only reaches
//! the snapshot once its walk succeeded, so an unreadable directory drops that
//! rule alone. Files that vanish between listing and hashing are skipped.

use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{ContentEntry, IndexSnapshot, ReplacePolicy};
use crate::config::{IndexConfig, IndexRule, IGNORE_MARKER};
use crate::error::{ProtocolError, Result};
use crate::utils::hash::hash_file;

/// Counters from one build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Entries in the resulting snapshot
    pub files: usize,
    /// Files skipped (vanished, oversized, filtered by extension)
    pub skipped: usize,
    /// Rules that contributed nothing because of an error
    pub rules_failed: usize,
    /// Directories visited (and watched)
    pub dirs: usize,
}

/// True if the final path component carries the ignore marker or an ignore-list entry
pub fn is_ignored(path: &Path, ignored: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.contains(IGNORE_MARKER) || ignored.iter().any(|entry| name.contains(entry.as_str()))
}

/// Join a rule target prefix and a relative path into a `/`-separated client path
pub fn client_path(target: &str, relative: &Path) -> String {
    let mut parts: Vec<String> = target
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .map(String::from)
        .collect();
    parts.extend(relative.components().filter_map(|component| match component {
        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
        _ => None,
    }));
    parts.join("/")
}

/// Build a fresh snapshot from the configured rules.
///
/// Returns the snapshot, every directory that should be watched and the
/// build counters.
pub fn build_snapshot(config: &IndexConfig) -> (IndexSnapshot, HashSet<PathBuf>, BuildReport) {
    let mut snapshot = IndexSnapshot::new();
    let mut dirs = HashSet::new();
    let mut report = BuildReport::default();

    for rule in &config.rules {
        match index_rule(rule, config) {
            Ok(indexed) => {
                report.skipped += indexed.skipped;
                dirs.extend(indexed.dirs);
                for entry in indexed.entries {
                    snapshot.insert(entry);
                }
            }
            Err(e) => {
                report.rules_failed += 1;
                warn!(rule = %rule.path.display(), error = %e, "Index rule failed");
            }
        }
    }

    report.files = snapshot.len();
    report.dirs = dirs.len();
    (snapshot, dirs, report)
}

struct RuleOutput {
    entries: Vec<ContentEntry>,
    dirs: Vec<PathBuf>,
    skipped: usize,
}

fn index_rule(rule: &IndexRule, config: &IndexConfig) -> Result<RuleOutput> {
    let root = rule.path.canonicalize().map_err(|e| {
        ProtocolError::IndexError(format!("Cannot resolve {}: {e}", rule.path.display()))
    })?;
    let policy = ReplacePolicy::for_rule(rule);
    let mut output = RuleOutput {
        entries: Vec::new(),
        dirs: Vec::new(),
        skipped: 0,
    };

    if root.is_file() {
        if is_ignored(&root, &config.ignored) || !rule.accepts_extension(&root) {
            return Ok(output);
        }
        let target = if rule.target.trim_matches('/').is_empty() || rule.target == "." {
            root.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            client_path(&rule.target, Path::new(""))
        };
        match index_file(&root, target, policy, config.max_file_size)? {
            Some(entry) => output.entries.push(entry),
            None => output.skipped += 1,
        }
        if let Some(parent) = root.parent() {
            output.dirs.push(parent.to_path_buf());
        }
        return Ok(output);
    }

    let walker = WalkDir::new(&root)
        .follow_links(true)
        .max_depth(if rule.recursive { usize::MAX } else { 1 })
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_ignored(entry.path(), &config.ignored));

    for item in walker {
        let entry = match item {
            Ok(entry) => entry,
            Err(e) if e.depth() > 0 && is_not_found(e.io_error()) => {
                debug!(error = %e, "Entry vanished during walk");
                output.skipped += 1;
                continue;
            }
            Err(e) => {
                return Err(ProtocolError::IndexError(format!(
                    "Cannot read {}: {e}",
                    root.display()
                )))
            }
        };

        if entry.file_type().is_dir() {
            output.dirs.push(entry.path().to_path_buf());
            continue;
        }
        if !rule.accepts_extension(entry.path()) {
            continue;
        }

        let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
        let target = client_path(&rule.target, relative);
        match index_file(entry.path(), target, policy, config.max_file_size)? {
            Some(indexed) => output.entries.push(indexed),
            None => output.skipped += 1,
        }
    }

    debug!(
        rule = %rule.path.display(),
        files = output.entries.len(),
        dirs = output.dirs.len(),
        "Rule indexed"
    );
    Ok(output)
}

/// Hash one file. `Ok(None)` means skipped (vanished or oversized).
fn index_file(
    path: &Path,
    client_path: String,
    policy: ReplacePolicy,
    max_file_size: u64,
) -> Result<Option<ContentEntry>> {
    let size = match std::fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "File disappeared before hashing");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if size > max_file_size {
        warn!(
            path = %path.display(),
            size,
            limit = max_file_size,
            "File exceeds the size cap and is not indexed"
        );
        return Ok(None);
    }

    match hash_file(path) {
        Ok(hash) => Ok(Some(ContentEntry {
            server_path: path.to_path_buf(),
            client_path,
            hash,
            policy,
        })),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "File disappeared before hashing");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn is_not_found(error: Option<&io::Error>) -> bool {
    error.is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}
