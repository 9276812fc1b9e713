//! Per-connection protocol state machine.
//!
//! Steps run strictly in order with no backtracking:
//! version exchange, identify (the server signs the identifier), deduplication,
//! metrics intake, hash exchange, delta transfer, end of stream. Any framing
//! error is fatal to the session only.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{ServerConfig, PROTOCOL_VERSION};
use crate::core::codec;
use crate::core::packet::{DeltaPacket, HashListEntry};
use crate::error::{ProtocolError, Result};
use crate::index::{ContentIndex, IndexSnapshot};
use crate::ledger::{MachineLedger, IDENTIFIER_LEN};
use crate::utils::crypto::Signer;
use crate::utils::hash::ContentHash;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{self, CLOSE_TIMEOUT};

/// Limits applied to client-supplied fields
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_metrics_size: u64,
}

impl From<&ServerConfig> for SessionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_metrics_size: config.max_metrics_size,
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Server-owned state shared by every session
#[derive(Clone)]
pub struct SessionContext {
    pub index: Arc<ContentIndex>,
    pub ledger: Arc<MachineLedger>,
    pub signer: Arc<Signer>,
    pub metrics: Arc<Metrics>,
    pub limits: SessionLimits,
}

/// Protocol step a session is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    VersionExchange,
    Identify,
    Deduplication,
    Metrics,
    HashExchange,
    DeltaTransfer,
    End,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::VersionExchange => "version_exchange",
            SessionState::Identify => "identify",
            SessionState::Deduplication => "deduplication",
            SessionState::Metrics => "metrics",
            SessionState::HashExchange => "hash_exchange",
            SessionState::DeltaTransfer => "delta_transfer",
            SessionState::End => "end",
        };
        f.write_str(name)
    }
}

/// How a session ended without a stream error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Client speaks another protocol version and was told to update
    Outdated { client_version: u8 },
    /// Identifier already served in this epoch
    Rejected,
    /// Delta streamed in full
    Completed(TransferSummary),
}

/// Counters for one completed session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Non-terminator hash entries received
    pub advertised: usize,
    /// Advertised hashes found in the index
    pub matched: usize,
    pub files_sent: usize,
    pub bytes_sent: u64,
    /// Delta entries that could not be read or changed since indexing
    pub skipped: usize,
}

/// Result of the hash exchange step
#[derive(Debug, Default)]
struct Advertisement {
    hashes: HashSet<ContentHash>,
    paths: HashSet<String>,
    entries: usize,
    matched: usize,
}

/// One protocol run over one stream
pub struct SessionHandler<S> {
    stream: S,
    ctx: SessionContext,
    peer: String,
    state: SessionState,
    deadline: Option<Instant>,
}

impl<S> SessionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, ctx: SessionContext, peer: impl Into<String>) -> Self {
        Self {
            stream,
            ctx,
            peer: peer.into(),
            state: SessionState::VersionExchange,
            deadline: None,
        }
    }

    /// Abort the exchange with `ProtocolError::Timeout` once `deadline` passes
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion and close the stream
    #[instrument(skip(self), fields(peer = %self.peer))]
    pub async fn run(mut self) -> Result<SessionOutcome> {
        let metrics = Arc::clone(&self.ctx.metrics);
        metrics.session_started();

        let result = match self.deadline {
            Some(deadline) => timeout::with_deadline(deadline, self.drive()).await,
            None => self.drive().await,
        };
        match &result {
            Ok(SessionOutcome::Outdated { client_version }) => {
                metrics.session_outdated();
                info!(client_version, server_version = PROTOCOL_VERSION, "Client must update");
            }
            Ok(SessionOutcome::Rejected) => {
                metrics.session_rejected();
                info!("Rejecting connection - already served in this epoch");
            }
            Ok(SessionOutcome::Completed(summary)) => {
                metrics.session_completed();
                info!(
                    advertised = summary.advertised,
                    matched = summary.matched,
                    files_sent = summary.files_sent,
                    bytes_sent = summary.bytes_sent,
                    skipped = summary.skipped,
                    "Session completed"
                );
            }
            Err(e) => {
                metrics.session_failed();
                warn!(state = %self.state, kind = error_kind(e), error = %e, "Session aborted");
            }
        }

        self.state = SessionState::End;
        let stream = &mut self.stream;
        let closed = timeout::with_timeout_error(
            async { stream.shutdown().await.map_err(ProtocolError::from) },
            CLOSE_TIMEOUT,
        )
        .await;
        if let Err(e) = closed {
            debug!(error = %e, "Stream shutdown failed");
        }
        metrics.session_finished();
        result
    }

    async fn drive(&mut self) -> Result<SessionOutcome> {
        self.state = SessionState::VersionExchange;
        let client_version = codec::read_u8(&mut self.stream).await?;
        let must_update = client_version != PROTOCOL_VERSION;
        codec::write_bool(&mut self.stream, must_update).await?;
        self.stream.flush().await?;
        if must_update {
            return Ok(SessionOutcome::Outdated { client_version });
        }

        self.state = SessionState::Identify;
        let identifier = codec::read_array::<_, IDENTIFIER_LEN>(&mut self.stream).await?;
        let signature = self.ctx.signer.sign(&identifier)?;
        codec::write_raw(&mut self.stream, &signature).await?;
        self.stream.flush().await?;

        self.state = SessionState::Deduplication;
        let ledger = Arc::clone(&self.ctx.ledger);
        let admission = tokio::task::spawn_blocking(move || ledger.admit(&identifier)).await??;
        let Some(admission) = admission else {
            codec::write_bool(&mut self.stream, false).await?;
            self.stream.flush().await?;
            return Ok(SessionOutcome::Rejected);
        };
        codec::write_bool(&mut self.stream, true).await?;
        self.stream.flush().await?;

        self.state = SessionState::Metrics;
        let blob = codec::read_bytes(
            &mut self.stream,
            "metrics",
            self.ctx.limits.max_metrics_size,
        )
        .await?;
        debug!(identifier = admission.identifier(), size = blob.len(), "Metrics received");
        match tokio::task::spawn_blocking(move || admission.record(&blob)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to record machine in ledger"),
            Err(e) => warn!(error = %e, "Ledger task failed"),
        }

        self.state = SessionState::HashExchange;
        let snapshot = self.ctx.index.snapshot()?;
        let advertisement = self.exchange_hashes(&snapshot).await?;

        self.state = SessionState::DeltaTransfer;
        let mut summary = self.stream_delta(&snapshot, &advertisement).await?;
        summary.advertised = advertisement.entries;
        summary.matched = advertisement.matched;
        Ok(SessionOutcome::Completed(summary))
    }

    /// Answer one boolean per advertised entry until the terminator
    async fn exchange_hashes(&mut self, snapshot: &IndexSnapshot) -> Result<Advertisement> {
        let mut advertisement = Advertisement::default();
        while let Some(entry) = HashListEntry::read_from(&mut self.stream).await? {
            let present = snapshot.contains(&entry.hash);
            codec::write_bool(&mut self.stream, present).await?;
            self.stream.flush().await?;

            self.ctx.metrics.hash_advertised();
            advertisement.entries += 1;
            if present {
                advertisement.matched += 1;
            }
            advertisement.hashes.insert(entry.hash);
            advertisement.paths.insert(entry.path);
        }
        debug!(
            entries = advertisement.entries,
            matched = advertisement.matched,
            "Hash exchange finished"
        );
        Ok(advertisement)
    }

    /// Stream every entry the client lacks, whole file at a time
    async fn stream_delta(
        &mut self,
        snapshot: &IndexSnapshot,
        advertisement: &Advertisement,
    ) -> Result<TransferSummary> {
        let mut summary = TransferSummary::default();
        let delta = snapshot.delta(&advertisement.hashes, &advertisement.paths);
        debug!(files = delta.len(), "Delta computed");

        for entry in delta {
            let blob = match tokio::fs::read(&entry.server_path).await {
                Ok(blob) => blob,
                Err(e) => {
                    warn!(path = %entry.server_path.display(), error = %e, "Skipping unreadable file");
                    summary.skipped += 1;
                    continue;
                }
            };
            if ContentHash::of(&blob) != entry.hash {
                warn!(
                    path = %entry.server_path.display(),
                    "File changed since indexing; skipping until the next rebuild"
                );
                summary.skipped += 1;
                continue;
            }

            let packet = DeltaPacket {
                hash: entry.hash,
                signature: self.ctx.signer.sign(entry.hash.as_bytes())?,
                path: entry.client_path.clone(),
                blob,
            };
            packet.write_to(&mut self.stream).await?;

            let size = packet.blob.len() as u64;
            self.ctx.metrics.file_sent(size);
            summary.files_sent += 1;
            summary.bytes_sent += size;
            debug!(path = %entry.client_path, size, "File sent");
        }
        self.stream.flush().await?;
        Ok(summary)
    }
}

impl<S> fmt::Debug for SessionHandler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandler")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish()
    }
}

/// Short log category for a session error
fn error_kind(error: &ProtocolError) -> &'static str {
    if error.is_stream_error() {
        "stream"
    } else {
        match error {
            ProtocolError::SigningError(_) | ProtocolError::KeyError(_) => "crypto",
            _ => "internal",
        }
    }
}
