//! Full client/server runs over TLS on the loopback interface

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use ssproto::config::{ClientConfig, IndexConfig, IndexRule, PROTOCOL_VERSION};
use ssproto::core::codec;
use ssproto::error::ProtocolError;
use ssproto::index::ContentIndex;
use ssproto::ledger::MachineLedger;
use ssproto::protocol::{SessionContext, SessionLimits};
use ssproto::service::client::{SyncClient, SyncOutcome};
use ssproto::service::ProtocolServer;
use ssproto::transport::tls::{self, certificate_fingerprint, TlsClientConfig, TlsServerConfig};
use ssproto::utils::crypto::Signer;
use ssproto::utils::metrics::Metrics;

struct Running {
    _dir: tempfile::TempDir,
    address: String,
    fingerprint: String,
    signer: Arc<Signer>,
    metrics: Arc<Metrics>,
    shutdown: tokio_util::sync::CancellationToken,
    serve: tokio::task::JoinHandle<ssproto::Result<()>>,
}

async fn start_server() -> Running {
    let dir = tempfile::tempdir().unwrap();
    let bundle = dir.path().join("bundle");
    fs::create_dir_all(bundle.join("mods")).unwrap();
    fs::write(bundle.join("mods/core.jar"), b"core mod").unwrap();
    fs::write(bundle.join("mods/extra.jar"), b"extra mod").unwrap();

    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    let tls = TlsServerConfig::generate_self_signed(&cert, &key, vec!["localhost".into()]).unwrap();
    let fingerprint = hex::encode(certificate_fingerprint(&cert).unwrap());

    let index = ContentIndex::new(IndexConfig {
        rules: vec![IndexRule::new(bundle.join("mods"), "mods").mandatory(true)],
        ..IndexConfig::default()
    });
    index.build().unwrap();

    let signer = Arc::new(Signer::generate());
    let metrics = Arc::new(Metrics::new());
    let ctx = SessionContext {
        index: Arc::new(index),
        ledger: Arc::new(MachineLedger::open(dir.path().join("machines.log")).unwrap()),
        signer: Arc::clone(&signer),
        metrics: Arc::clone(&metrics),
        limits: SessionLimits::default(),
    };

    let server = ProtocolServer::bind("127.0.0.1:0", tls.acceptor().unwrap(), ctx, Duration::from_secs(30))
        .await
        .unwrap();
    let address = server.local_addr().unwrap().to_string();
    let shutdown = server.shutdown_token();
    let serve = tokio::spawn(server.serve());

    Running {
        _dir: dir,
        address,
        fingerprint,
        signer,
        metrics,
        shutdown,
        serve,
    }
}

fn client_for(server: &Running, install: &std::path::Path, id: u8) -> SyncClient {
    let config = ClientConfig {
        address: server.address.clone(),
        install_dir: install.to_path_buf(),
        ..ClientConfig::default()
    };
    SyncClient::with_identifier(config, server.signer.verifier(), [id; 32])
}

#[tokio::test]
async fn test_sync_over_pinned_tls() {
    let server = start_server().await;
    let install = tempfile::tempdir().unwrap();
    let client = client_for(&server, install.path(), 1);
    let tls = TlsClientConfig::pinned("localhost", &server.fingerprint).unwrap();

    let SyncOutcome::Synced(report) = client.run(&tls).await.unwrap() else {
        panic!("sync did not complete");
    };
    assert_eq!(report.received, 2);
    assert_eq!(fs::read(install.path().join("mods/core.jar")).unwrap(), b"core mod");

    assert_eq!(client.run(&tls).await.unwrap(), SyncOutcome::AlreadyServed);

    server.shutdown.cancel();
    server.serve.await.unwrap().unwrap();
    let stats = server.metrics.snapshot();
    assert_eq!(stats.sessions_completed, 1);
    assert_eq!(stats.sessions_rejected, 1);
    assert_eq!(stats.files_sent, 2);
}

#[tokio::test]
async fn test_wrong_pin_refuses_connection() {
    let server = start_server().await;
    let install = tempfile::tempdir().unwrap();
    let client = client_for(&server, install.path(), 2);
    let tls = TlsClientConfig::pinned("localhost", &"ab".repeat(32)).unwrap();

    let err = client.run(&tls).await.unwrap_err();
    assert!(matches!(err, ProtocolError::TlsError(_)), "unexpected error: {err}");
    assert!(!install.path().join("mods").exists());

    server.shutdown.cancel();
    server.serve.await.unwrap().unwrap();
    assert_eq!(server.metrics.snapshot().sessions_completed, 0);
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let server = start_server().await;
    let address = server.address.clone();
    server.shutdown.cancel();
    server.serve.await.unwrap().unwrap();

    let install = tempfile::tempdir().unwrap();
    let config = ClientConfig {
        address,
        install_dir: install.path().to_path_buf(),
        connect_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    };
    let client = SyncClient::with_identifier(config, server.signer.verifier(), [3; 32]);
    let tls = TlsClientConfig::pinned("localhost", &server.fingerprint).unwrap();
    assert!(client.run(&tls).await.is_err());
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_session() {
    let server = start_server().await;
    let trust = TlsClientConfig::pinned("localhost", &server.fingerprint).unwrap();
    let mut stream = tls::connect(&server.address, &trust, Duration::from_secs(5))
        .await
        .unwrap();

    codec::write_u8(&mut stream, PROTOCOL_VERSION).await.unwrap();
    stream.flush().await.unwrap();
    assert!(!codec::read_bool(&mut stream).await.unwrap());

    // session is parked waiting for the identifier
    server.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!server.serve.is_finished());
    assert_eq!(server.metrics.snapshot().sessions_active, 1);

    drop(stream);
    tokio::time::timeout(Duration::from_secs(5), server.serve)
        .await
        .expect("server did not drain after the client left")
        .unwrap()
        .unwrap();
    let stats = server.metrics.snapshot();
    assert_eq!(stats.sessions_active, 0);
    assert_eq!(stats.sessions_failed, 1);
}
