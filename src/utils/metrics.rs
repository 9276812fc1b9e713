//! Sync Server Metrics
//!
//! Counters describing session outcomes, transferred content and index
//! activity. The server owns one [`Metrics`] instance and hands it to every
//! session; all counters are atomics so no lock is involved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one server process
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Sessions currently running
    pub sessions_active: AtomicU64,
    /// TLS handshakes that failed before a session started
    pub tls_failures: AtomicU64,
    /// Sessions ended because the client protocol version is incompatible
    pub sessions_outdated: AtomicU64,
    /// Sessions rejected as already served in this epoch
    pub sessions_rejected: AtomicU64,
    /// Sessions that reached the end of the delta transfer
    pub sessions_completed: AtomicU64,
    /// Sessions aborted by stream errors or the deadline
    pub sessions_failed: AtomicU64,
    /// Hash entries advertised by clients
    pub hashes_advertised: AtomicU64,
    /// Files streamed to clients
    pub files_sent: AtomicU64,
    /// Payload bytes streamed to clients
    pub bytes_sent: AtomicU64,
    /// Completed index rebuilds
    pub index_rebuilds: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            tls_failures: AtomicU64::new(0),
            sessions_outdated: AtomicU64::new(0),
            sessions_rejected: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            hashes_advertised: AtomicU64::new(0),
            files_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            index_rebuilds: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_accepted(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tls_failed(&self) {
        self.tls_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_finished(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_outdated(&self) {
        self.sessions_outdated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_rejected(&self) {
        self.sessions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hash_advertised(&self) {
        self.hashes_advertised.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one streamed file
    pub fn file_sent(&self, byte_count: u64) {
        self.files_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn index_rebuilt(&self) {
        self.index_rebuilds.fetch_add(1, Ordering::Relaxed);
        debug!("Index rebuild recorded");
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            tls_failures: self.tls_failures.load(Ordering::Relaxed),
            sessions_outdated: self.sessions_outdated.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            hashes_advertised: self.hashes_advertised.load(Ordering::Relaxed),
            files_sent: self.files_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            index_rebuilds: self.index_rebuilds.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            sessions_active = snapshot.sessions_active,
            tls_failures = snapshot.tls_failures,
            sessions_outdated = snapshot.sessions_outdated,
            sessions_rejected = snapshot.sessions_rejected,
            sessions_completed = snapshot.sessions_completed,
            sessions_failed = snapshot.sessions_failed,
            hashes_advertised = snapshot.hashes_advertised,
            files_sent = snapshot.files_sent,
            bytes_sent = snapshot.bytes_sent,
            index_rebuilds = snapshot.index_rebuilds,
            uptime_seconds = snapshot.uptime_seconds,
            "Sync server metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub sessions_active: u64,
    pub tls_failures: u64,
    pub sessions_outdated: u64,
    pub sessions_rejected: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub hashes_advertised: u64,
    pub files_sent: u64,
    pub bytes_sent: u64,
    pub index_rebuilds: u64,
    pub uptime_seconds: u64,
}
