//! Client and server sessions over in-memory streams

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{duplex, AsyncWriteExt};

use ssproto::config::{ClientConfig, IndexConfig, IndexRule, PROTOCOL_VERSION};
use ssproto::core::codec;
use ssproto::core::packet::{DeltaPacket, HashListEntry};
use ssproto::error::ProtocolError;
use ssproto::index::ContentIndex;
use ssproto::ledger::MachineLedger;
use ssproto::protocol::{SessionContext, SessionHandler, SessionLimits, SessionOutcome};
use ssproto::service::client::{SyncClient, SyncOutcome};
use ssproto::service::server::rebuild_epoch;
use ssproto::utils::crypto::{Signer, Verifier};
use ssproto::utils::hash::ContentHash;
use ssproto::utils::metrics::Metrics;

struct Server {
    _dir: tempfile::TempDir,
    ctx: SessionContext,
}

impl Server {
    /// Bundle layout: `config/` (mandatory), `mods/` (jar only, mandatory)
    /// and `client/options.txt` (preserved once present)
    fn new(files: &[(&str, &[u8])]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        for sub in ["config", "mods", "client"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }

        let root = dir.path();
        let index = ContentIndex::new(IndexConfig {
            rules: vec![
                IndexRule::new(root.join("config"), "config")
                    .recursive(true)
                    .mandatory(true),
                IndexRule::new(root.join("mods"), "mods")
                    .mandatory(true)
                    .extensions(["jar"]),
                IndexRule::new(root.join("client/options.txt"), "options.txt"),
            ],
            ..IndexConfig::default()
        });
        index.build().unwrap();

        let ledger = MachineLedger::open(root.join("machines.log")).unwrap();
        Self {
            ctx: SessionContext {
                index: Arc::new(index),
                ledger: Arc::new(ledger),
                signer: Arc::new(Signer::generate()),
                metrics: Arc::new(Metrics::new()),
                limits: SessionLimits::default(),
            },
            _dir: dir,
        }
    }

    fn verifier(&self) -> Verifier {
        self.ctx.signer.verifier()
    }

    async fn new_epoch(&self) {
        rebuild_epoch(&self.ctx.index, &self.ctx.ledger, &self.ctx.metrics).await;
    }
}

fn client(install_dir: &Path, verifier: Verifier, id: u8) -> SyncClient {
    let config = ClientConfig {
        install_dir: install_dir.to_path_buf(),
        ..ClientConfig::default()
    };
    SyncClient::with_identifier(config, verifier, [id; 32])
}

/// Run one client sync against one server session
async fn sync(
    server: &Server,
    client: &SyncClient,
) -> (ssproto::Result<SyncOutcome>, ssproto::Result<SessionOutcome>) {
    let (mut client_side, server_side) = duplex(1 << 20);
    let session = tokio::spawn(SessionHandler::new(server_side, server.ctx.clone(), "duplex").run());

    let local = client.local_hashes().await.unwrap();
    let outcome = client.sync(&mut client_side, &local).await;
    drop(client_side);
    (outcome, session.await.unwrap())
}

fn read(root: &Path, relative: &str) -> Vec<u8> {
    fs::read(root.join(relative)).unwrap()
}

#[tokio::test]
async fn test_reconciliation_streams_only_missing_hashes() {
    let server = Server::new(&[
        ("config/a.cfg", b"D1"),
        ("config/b.cfg", b"D2"),
        ("mods/c.jar", b"D3"),
    ]);

    let (mut wire, server_side) = duplex(1 << 20);
    let session = tokio::spawn(SessionHandler::new(server_side, server.ctx.clone(), "raw").run());

    codec::write_u8(&mut wire, PROTOCOL_VERSION).await.unwrap();
    assert!(!codec::read_bool(&mut wire).await.unwrap());
    codec::write_raw(&mut wire, &[1u8; 32]).await.unwrap();
    let _signature = codec::read_array::<_, 64>(&mut wire).await.unwrap();
    assert!(codec::read_bool(&mut wire).await.unwrap());
    codec::write_bytes(&mut wire, b"{}").await.unwrap();

    HashListEntry::new(ContentHash::of(b"D1"), "somewhere/else.cfg")
        .write_to(&mut wire)
        .await
        .unwrap();
    assert!(codec::read_bool(&mut wire).await.unwrap());
    HashListEntry::write_terminator(&mut wire).await.unwrap();
    wire.flush().await.unwrap();

    let mut paths = Vec::new();
    while let Some(packet) = DeltaPacket::read_from(&mut wire, 1 << 20).await.unwrap() {
        assert!(packet.verify(&server.verifier()));
        paths.push(packet.path);
    }
    assert_eq!(paths, ["config/b.cfg", "mods/c.jar"]);
    assert!(matches!(
        session.await.unwrap().unwrap(),
        SessionOutcome::Completed(_)
    ));
}

#[tokio::test]
async fn test_empty_client_receives_whole_index_then_nothing() {
    let server = Server::new(&[
        ("config/a.cfg", b"alpha"),
        ("config/sub/b.cfg", b"beta"),
        ("mods/m.jar", b"jar"),
        ("client/options.txt", b"fov:70"),
    ]);
    let install = tempfile::tempdir().unwrap();
    let client = client(install.path(), server.verifier(), 7);

    let (outcome, session) = sync(&server, &client).await;
    let SyncOutcome::Synced(report) = outcome.unwrap() else {
        panic!("first sync did not complete");
    };
    assert_eq!(report.advertised, 0);
    assert_eq!(report.received, 4);
    assert!(matches!(session, Ok(SessionOutcome::Completed(_))));
    assert_eq!(read(install.path(), "config/sub/b.cfg"), b"beta");
    assert_eq!(read(install.path(), "options.txt"), b"fov:70");

    // same identifier in the same epoch
    let (outcome, session) = sync(&server, &client).await;
    assert_eq!(outcome.unwrap(), SyncOutcome::AlreadyServed);
    assert_eq!(session.unwrap(), SessionOutcome::Rejected);

    server.new_epoch().await;
    let (outcome, _) = sync(&server, &client).await;
    let SyncOutcome::Synced(report) = outcome.unwrap() else {
        panic!("second sync did not complete");
    };
    assert_eq!(report.advertised, 4);
    assert_eq!(report.kept, 4);
    assert_eq!(report.received, 0);
    assert_eq!(server.ctx.ledger.records().unwrap().len(), 1);
}

#[tokio::test]
async fn test_user_edited_preserved_file_is_not_overwritten() {
    let server = Server::new(&[("client/options.txt", b"server defaults")]);
    let install = tempfile::tempdir().unwrap();
    fs::write(install.path().join("options.txt"), b"user settings").unwrap();

    let (outcome, _) = sync(&server, &client(install.path(), server.verifier(), 8)).await;
    let SyncOutcome::Synced(report) = outcome.unwrap() else {
        panic!("sync did not complete");
    };
    assert_eq!(report.received, 0);
    assert_eq!(read(install.path(), "options.txt"), b"user settings");
}

#[tokio::test]
async fn test_mandatory_file_is_replaced() {
    let server = Server::new(&[("config/game.cfg", b"v2")]);
    let install = tempfile::tempdir().unwrap();
    fs::create_dir_all(install.path().join("config")).unwrap();
    fs::write(install.path().join("config/game.cfg"), b"v1").unwrap();

    let (outcome, _) = sync(&server, &client(install.path(), server.verifier(), 9)).await;
    assert!(matches!(outcome.unwrap(), SyncOutcome::Synced(_)));
    assert_eq!(read(install.path(), "config/game.cfg"), b"v2");
    assert!(!install.path().join("config/game.cfg.new").exists());
}

#[tokio::test]
async fn test_unknown_mods_are_pruned_other_files_kept() {
    let server = Server::new(&[("mods/known.jar", b"known")]);
    let install = tempfile::tempdir().unwrap();
    for (path, content) in [
        ("mods/known.jar", &b"known"[..]),
        ("mods/stale.jar", b"stale"),
        ("mods/libs/nested.jar", b"nested"),
        ("config/local.cfg", b"local"),
    ] {
        let path = install.path().join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    let (outcome, _) = sync(&server, &client(install.path(), server.verifier(), 10)).await;
    let SyncOutcome::Synced(report) = outcome.unwrap() else {
        panic!("sync did not complete");
    };
    assert_eq!(report.advertised, 4);
    assert_eq!(report.kept, 1);
    assert_eq!(report.pruned, 1);
    assert!(!install.path().join("mods/stale.jar").exists());
    assert!(install.path().join("mods/libs/nested.jar").exists());
    assert!(install.path().join("config/local.cfg").exists());
}

#[tokio::test]
async fn test_client_rejects_foreign_server_key() {
    let server = Server::new(&[("config/a.cfg", b"a")]);
    let install = tempfile::tempdir().unwrap();
    let impostor = Signer::generate().verifier();

    let (outcome, session) = sync(&server, &client(install.path(), impostor, 11)).await;
    assert!(matches!(outcome, Err(ProtocolError::SecurityError(_))));
    assert!(session.is_err());
    assert!(!install.path().join("config/a.cfg").exists());
}

#[tokio::test]
async fn test_outdated_server_reports_update_required() {
    let (mut client_side, mut server_side) = duplex(1024);
    let server = tokio::spawn(async move {
        let version = codec::read_u8(&mut server_side).await.unwrap();
        codec::write_bool(&mut server_side, version != PROTOCOL_VERSION + 1)
            .await
            .unwrap();
    });

    let install = tempfile::tempdir().unwrap();
    let client = client(install.path(), Signer::generate().verifier(), 12);
    let outcome = client.sync(&mut client_side, &[]).await.unwrap();
    assert_eq!(outcome, SyncOutcome::UpdateRequired);
    server.await.unwrap();
}

/// Serve a handcrafted delta to the client and return what it made of it
async fn serve_forged(signer: &Signer, packet: DeltaPacket, install: &Path) -> ssproto::Result<SyncOutcome> {
    let client = client(install, signer.verifier(), 13);
    let (mut client_side, mut server_side) = duplex(1 << 16);

    let signature = signer.sign(&[13u8; 32]).unwrap();
    let server = tokio::spawn(async move {
        codec::read_u8(&mut server_side).await.unwrap();
        codec::write_bool(&mut server_side, false).await.unwrap();
        codec::read_array::<_, 32>(&mut server_side).await.unwrap();
        codec::write_raw(&mut server_side, &signature).await.unwrap();
        codec::write_bool(&mut server_side, true).await.unwrap();
        codec::read_bytes(&mut server_side, "metrics", 1 << 16).await.unwrap();
        assert!(HashListEntry::read_from(&mut server_side).await.unwrap().is_none());
        packet.write_to(&mut server_side).await.unwrap();
        server_side.shutdown().await.unwrap();
    });

    let outcome = client.sync(&mut client_side, &[]).await;
    server.await.unwrap();
    outcome
}

#[tokio::test]
async fn test_tampered_payload_is_rejected() {
    let signer = Signer::generate();
    let hash = ContentHash::of(b"genuine");
    let packet = DeltaPacket {
        hash,
        signature: signer.sign(hash.as_bytes()).unwrap(),
        path: "config/a.cfg".into(),
        blob: b"tampered".to_vec(),
    };
    let install = tempfile::tempdir().unwrap();

    let outcome = serve_forged(&signer, packet, install.path()).await;
    assert!(matches!(outcome, Err(ProtocolError::SecurityError(_))));
    assert!(!install.path().join("config/a.cfg").exists());
}

#[tokio::test]
async fn test_signed_path_traversal_is_rejected() {
    let signer = Signer::generate();
    let hash = ContentHash::of(b"payload");
    let packet = DeltaPacket {
        hash,
        signature: signer.sign(hash.as_bytes()).unwrap(),
        path: "../escaped.txt".into(),
        blob: b"payload".to_vec(),
    };
    let parent = tempfile::tempdir().unwrap();
    let install: PathBuf = parent.path().join("install");
    fs::create_dir_all(&install).unwrap();

    let outcome = serve_forged(&signer, packet, &install).await;
    assert!(matches!(outcome, Err(ProtocolError::SecurityError(_))));
    assert!(!parent.path().join("escaped.txt").exists());
}
