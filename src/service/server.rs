//! # Sync Server
//!
//! Accept loop, per-connection tasks and process wiring.
//!
//! Every accepted connection gets its own task and an absolute deadline set at
//! accept time; the TLS handshake and the whole session share it. Shutdown
//! stops accepting, then waits for in-flight sessions to finish on their own.
//! Sessions never receive a cancellation signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AppConfig;
use crate::error::{ProtocolError, Result};
use crate::index::{watcher, ContentIndex, Debouncer, NotifyWatchRegistry};
use crate::ledger::MachineLedger;
use crate::protocol::{SessionContext, SessionHandler, SessionLimits};
use crate::transport::TlsServerConfig;
use crate::utils::crypto::Signer;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_deadline;

/// TLS listener plus the shared session state
pub struct ProtocolServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ctx: SessionContext,
    connection_deadline: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ProtocolServer {
    /// Bind the listener; failures here are startup errors
    pub async fn bind(
        addr: &str,
        acceptor: TlsAcceptor,
        ctx: SessionContext,
        connection_deadline: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            acceptor,
            ctx,
            connection_deadline,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Cancelling this token stops the accept loop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until shutdown, then drain in-flight sessions
    #[instrument(skip(self), fields(address = ?self.listener.local_addr().ok()))]
    pub async fn serve(self) -> Result<()> {
        info!("Sync server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let deadline = Instant::now() + self.connection_deadline;
            self.ctx.metrics.connection_accepted();
            debug!(%peer, "Serving");
            self.tracker.spawn(handle_connection(
                self.acceptor.clone(),
                stream,
                peer,
                self.ctx.clone(),
                deadline,
            ));
        }

        drop(self.listener);
        self.tracker.close();
        info!(
            active = self.tracker.len(),
            "Shutting down server. Waiting for sessions to finish..."
        );
        self.tracker.wait().await;
        info!("All sessions finished");
        Ok(())
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
    ctx: SessionContext,
    deadline: Instant,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let handshake = with_deadline(deadline, async {
        acceptor
            .accept(stream)
            .await
            .map_err(|e| ProtocolError::TlsError(format!("TLS handshake failed: {e}")))
    })
    .await;

    let tls_stream = match handshake {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            ctx.metrics.tls_failed();
            warn!(%peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    // outcome and failures are logged by the session itself
    let _ = SessionHandler::new(tls_stream, ctx, peer.to_string())
        .with_deadline(deadline)
        .run()
        .await;
}

/// Rebuild the index and start a new dedup epoch.
///
/// The snapshot swap and the ledger truncation share the ledger lock, so a
/// session recorded during the rebuild is never lost from the new epoch. On
/// failure the previous snapshot keeps serving.
pub async fn rebuild_epoch(index: &Arc<ContentIndex>, ledger: &Arc<MachineLedger>, metrics: &Metrics) {
    let index = Arc::clone(index);
    let ledger = Arc::clone(ledger);
    let rebuilt = tokio::task::spawn_blocking(move || {
        let prepared = index.prepare();
        ledger.clear_with(|| index.install(prepared))
    })
    .await;

    match rebuilt {
        Ok(Ok(_)) => metrics.index_rebuilt(),
        Ok(Err(e)) => error!(error = %e, "Index rebuild failed; keeping the previous index"),
        Err(e) => error!(error = %e, "Index rebuild task failed; keeping the previous index"),
    }
}

/// Resolves on Ctrl-C, and on SIGTERM or SIGHUP on unix
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGHUP");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received CTRL+C signal, shutting down"),
            _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
            _ = hangup.recv() => info!("Received SIGHUP, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL+C signal, shutting down");
        }
    }
}

/// Background tasks that keep the index live
struct IndexTasks {
    debounce: JoinHandle<()>,
    watch: JoinHandle<()>,
}

fn spawn_index_tasks(
    index: &Arc<ContentIndex>,
    ledger: &Arc<MachineLedger>,
    metrics: &Arc<Metrics>,
    events: watcher::EventReceiver,
    rebuild_delay: Duration,
    shutdown: &CancellationToken,
) -> IndexTasks {
    let (debouncer, debounce) = Debouncer::spawn(rebuild_delay, shutdown.clone(), {
        let index = Arc::clone(index);
        let ledger = Arc::clone(ledger);
        let metrics = Arc::clone(metrics);
        move || {
            let index = Arc::clone(&index);
            let ledger = Arc::clone(&ledger);
            let metrics = Arc::clone(&metrics);
            async move { rebuild_epoch(&index, &ledger, &metrics).await }
        }
    });

    let watch = tokio::spawn(watcher::watch_loop(
        Arc::clone(index),
        debouncer,
        events,
        shutdown.clone(),
    ));
    IndexTasks { debounce, watch }
}

/// Start every server component from configuration and serve until a
/// shutdown signal arrives
#[instrument(skip(config), fields(address = %config.server.address))]
pub async fn run(config: AppConfig) -> Result<()> {
    config.validate_strict()?;
    let server = &config.server;

    let signer = Arc::new(Signer::load_or_generate(&server.signing_key_path)?);
    info!(public_key = %signer.public_key_base64(), "Signing key loaded");

    let acceptor = TlsServerConfig::new(&server.cert_path, &server.key_path).acceptor()?;
    let ledger = Arc::new(MachineLedger::open(&server.ledger_path)?);
    let metrics = Arc::new(Metrics::new());

    let (registry, events) = NotifyWatchRegistry::new()?;
    let index = Arc::new(ContentIndex::with_registry(
        config.index.clone(),
        Box::new(registry),
    ));
    rebuild_epoch(&index, &ledger, &metrics).await;

    let ctx = SessionContext {
        index: Arc::clone(&index),
        ledger: Arc::clone(&ledger),
        signer,
        metrics: Arc::clone(&metrics),
        limits: SessionLimits::from(server),
    };
    let protocol_server =
        ProtocolServer::bind(&server.address, acceptor, ctx, server.connection_deadline).await?;
    let shutdown = protocol_server.shutdown_token();

    let tasks = spawn_index_tasks(
        &index,
        &ledger,
        &metrics,
        events,
        server.rebuild_delay,
        &shutdown,
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    protocol_server.serve().await?;

    for (name, task) in [("debounce", tasks.debounce), ("watch", tasks.watch)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }
    metrics.log_metrics();
    Ok(())
}
