//! # Sync Client
//!
//! Client side of one synchronization run.
//!
//! The local tree is hashed before connecting so the server-side deadline
//! only covers network time. During the hash exchange every advertised file
//! the server does not know is deleted when it sits directly inside a
//! prunable directory (`mods` by default). Every delta packet must carry a
//! valid hash and signature before anything touches the disk, and files are
//! replaced through a `.new` sibling and a rename.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::config::{ClientConfig, IGNORE_MARKER, PROTOCOL_VERSION};
use crate::core::codec;
use crate::core::packet::{DeltaPacket, HashListEntry};
use crate::error::{constants, ProtocolError, Result};
use crate::index::builder::client_path;
use crate::ledger::IDENTIFIER_LEN;
use crate::transport::tls::{self, TlsClientConfig};
use crate::utils::crypto::{Verifier, SIGNATURE_LEN};
use crate::utils::hash::hash_file;
use crate::utils::timeout::with_deadline;

/// Suffix of the temporary file a delta payload is written to
const PARTIAL_SUFFIX: &str = ".new";

/// How a sync run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Server speaks another protocol version
    UpdateRequired,
    /// Identifier already served in this epoch; local files are current
    AlreadyServed,
    Synced(SyncReport),
}

/// Counters for one completed run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub advertised: usize,
    /// Advertised files the server knows
    pub kept: usize,
    /// Unknown files deleted from prunable directories
    pub pruned: usize,
    pub received: usize,
    pub bytes_received: u64,
}

/// Machine facts forwarded to the server ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub os: String,
    pub arch: String,
    pub family: String,
    pub cpus: usize,
    pub client_version: String,
    pub protocol_version: u8,
}

impl MachineInfo {
    pub fn collect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Read the persisted identifier, or generate and persist a new one
pub fn load_or_create_identifier<P: AsRef<Path>>(path: P) -> Result<[u8; IDENTIFIER_LEN]> {
    let path = path.as_ref();
    match fs::File::open(path) {
        Ok(mut file) => {
            let mut bytes = Vec::with_capacity(IDENTIFIER_LEN);
            file.read_to_end(&mut bytes)?;
            return bytes
                .try_into()
                .map_err(|_| ProtocolError::KeyError(constants::ERR_INVALID_IDENTIFIER.into()));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut identifier = [0u8; IDENTIFIER_LEN];
    getrandom::fill(&mut identifier)
        .map_err(|e| ProtocolError::KeyError(format!("Failed to generate identifier: {e}")))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)?.write_all(&identifier)?;
    info!(path = %path.display(), "Generated client identifier");
    Ok(identifier)
}

/// Hash every synchronizable file under `root`.
///
/// Entries whose name carries the ignore marker or equals an excluded
/// component are skipped together with everything below them. Paths are
/// `/`-separated and relative to `root`.
pub fn collect_hash_list(root: &Path, excluded: &[String]) -> Result<Vec<HashListEntry>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_excluded(entry.file_name(), excluded));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        match hash_file(entry.path()) {
            Ok(hash) => entries.push(HashListEntry::new(hash, client_path("", relative))),
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping unreadable file"),
        }
    }
    Ok(entries)
}

fn is_excluded(name: &std::ffi::OsStr, excluded: &[String]) -> bool {
    let name = name.to_string_lossy();
    name.contains(IGNORE_MARKER)
        || name.ends_with(PARTIAL_SUFFIX)
        || excluded.iter().any(|component| name == component.as_str())
}

/// Resolve a server-supplied client path inside the install directory.
///
/// Only plain relative `/`-separated paths are accepted.
pub fn sanitize_path(install_dir: &Path, path: &str) -> Result<PathBuf> {
    let unsafe_path = || ProtocolError::SecurityError(constants::ERR_UNSAFE_PATH.into());
    if path.is_empty() || path.contains(['\\', ':', '\0']) || path.starts_with('/') {
        return Err(unsafe_path());
    }

    let mut resolved = install_dir.to_path_buf();
    for part in path.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(unsafe_path());
        }
        match Path::new(part).components().next() {
            Some(Component::Normal(_)) => resolved.push(part),
            _ => return Err(unsafe_path()),
        }
    }
    Ok(resolved)
}

/// True if `path` sits directly inside one of the prunable directories
fn is_prunable(path: &str, prunable_dirs: &[String]) -> bool {
    match path.rsplit_once('/') {
        Some((parent, _)) => prunable_dirs.iter().any(|dir| dir == parent),
        None => false,
    }
}

/// Write `blob` to `target` through a temporary sibling
async fn replace_file(target: &Path, blob: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut partial = target.as_os_str().to_os_string();
    partial.push(PARTIAL_SUFFIX);
    let partial = PathBuf::from(partial);

    tokio::fs::write(&partial, blob).await?;
    if let Err(e) = tokio::fs::rename(&partial, target).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e.into());
    }
    Ok(())
}

/// Client state for one or more sync runs
#[derive(Debug, Clone)]
pub struct SyncClient {
    config: ClientConfig,
    verifier: Verifier,
    identifier: [u8; IDENTIFIER_LEN],
}

impl SyncClient {
    /// Load (or create) the identifier below the install directory
    pub fn new(config: ClientConfig, verifier: Verifier) -> Result<Self> {
        let identifier =
            load_or_create_identifier(config.install_dir.join(&config.identifier_path))?;
        Ok(Self::with_identifier(config, verifier, identifier))
    }

    pub fn with_identifier(
        config: ClientConfig,
        verifier: Verifier,
        identifier: [u8; IDENTIFIER_LEN],
    ) -> Self {
        Self {
            config,
            verifier,
            identifier,
        }
    }

    pub fn identifier(&self) -> &[u8; IDENTIFIER_LEN] {
        &self.identifier
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Hash the install directory on the blocking pool
    pub async fn local_hashes(&self) -> Result<Vec<HashListEntry>> {
        let root = self.config.install_dir.clone();
        let excluded = self.config.excluded_components.clone();
        tokio::task::spawn_blocking(move || collect_hash_list(&root, &excluded)).await?
    }

    /// Hash locally, connect over TLS and sync, all bounded by the connection deadline
    #[instrument(skip(self, tls_config), fields(address = %self.config.address))]
    pub async fn run(&self, tls_config: &TlsClientConfig) -> Result<SyncOutcome> {
        let local = self.local_hashes().await?;
        debug!(files = local.len(), "Local files hashed");

        let deadline = Instant::now() + self.config.connection_deadline;
        with_deadline(deadline, async {
            let mut stream =
                tls::connect(&self.config.address, tls_config, self.config.connect_timeout)
                    .await?;
            let outcome = self.sync(&mut stream, &local).await;
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "Stream shutdown failed");
            }
            outcome
        })
        .await
    }

    /// Run the protocol over an established stream
    pub async fn sync<S>(&self, stream: &mut S, local: &[HashListEntry]) -> Result<SyncOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        codec::write_u8(stream, PROTOCOL_VERSION).await?;
        stream.flush().await?;
        if codec::read_bool(stream).await? {
            warn!("Server runs another protocol version; this client must be updated");
            return Ok(SyncOutcome::UpdateRequired);
        }

        codec::write_raw(stream, &self.identifier).await?;
        stream.flush().await?;
        let signature = codec::read_array::<_, SIGNATURE_LEN>(stream).await?;
        if !self.verifier.verify(&self.identifier, &signature) {
            return Err(ProtocolError::SecurityError(
                constants::ERR_SERVER_SIGNATURE.into(),
            ));
        }

        if !codec::read_bool(stream).await? {
            info!("Already synchronized in this epoch");
            return Ok(SyncOutcome::AlreadyServed);
        }

        codec::write_bytes(stream, &MachineInfo::collect().to_json()?).await?;

        let mut report = SyncReport::default();
        for entry in local {
            entry.write_to(stream).await?;
            stream.flush().await?;
            report.advertised += 1;

            if codec::read_bool(stream).await? {
                report.kept += 1;
            } else if is_prunable(&entry.path, &self.config.prunable_dirs) {
                self.prune(&entry.path).await?;
                report.pruned += 1;
            }
        }
        HashListEntry::write_terminator(stream).await?;
        stream.flush().await?;

        while let Some(packet) = DeltaPacket::read_from(stream, self.config.max_payload_size).await? {
            if !packet.verify(&self.verifier) {
                return Err(ProtocolError::SecurityError(
                    constants::ERR_PACKET_SIGNATURE.into(),
                ));
            }
            let target = sanitize_path(&self.config.install_dir, &packet.path)?;
            replace_file(&target, &packet.blob).await?;

            report.received += 1;
            report.bytes_received += packet.blob.len() as u64;
            debug!(path = %packet.path, size = packet.blob.len(), "File updated");
        }

        info!(
            advertised = report.advertised,
            kept = report.kept,
            pruned = report.pruned,
            received = report.received,
            "Synchronization finished"
        );
        Ok(SyncOutcome::Synced(report))
    }

    async fn prune(&self, path: &str) -> Result<()> {
        let target = sanitize_path(&self.config.install_dir, path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {
                info!(path, "Removed file unknown to the server");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Append a timestamped failure line to the crash record
pub fn append_crash_record<P: AsRef<Path>>(path: P, message: &str) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{} {}", chrono::Utc::now().to_rfc3339(), message)
}
