//! ssproto-client: brings an install directory in line with the server.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use ssproto::config::AppConfig;
use ssproto::error::{ProtocolError, Result};
use ssproto::service::client::{append_crash_record, SyncClient, SyncOutcome};
use ssproto::transport::tls::TlsClientConfig;
use ssproto::utils::crypto::Verifier;
use ssproto::utils::logging::init_logging;

#[derive(Parser)]
#[command(name = "ssproto-client")]
#[command(version, about = "Synchronize an install directory with an ssproto server")]
struct Cli {
    /// Configuration file; written with defaults when absent
    #[arg(short, long, default_value = "ssproto.toml")]
    config: PathBuf,

    /// Directory kept in sync
    #[arg(long)]
    install_dir: Option<PathBuf>,

    /// Server address (host:port)
    #[arg(long)]
    address: Option<String>,

    /// Name the server certificate must carry
    #[arg(long)]
    server_name: Option<String>,

    /// Base64 server public key, instead of the one built in
    #[arg(long)]
    public_key: Option<String>,

    /// Hex SHA-256 fingerprint of the server certificate, instead of the built-in CA
    #[arg(long)]
    pin_sha256: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match AppConfig::load_or_init(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ssproto-client: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = cli.install_dir.clone() {
        config.client.install_dir = dir;
    }
    if let Some(address) = cli.address.clone() {
        config.client.address = address;
    }
    if let Some(name) = cli.server_name.clone() {
        config.client.server_name = name;
    }
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("ssproto-client: {e}");
    }

    let crash_log = config.client.install_dir.join(&config.client.crash_log_path);
    match run(&cli, config).await {
        Ok(SyncOutcome::UpdateRequired) => {
            println!("This client is outdated. Please install the latest version.");
            ExitCode::FAILURE
        }
        Ok(SyncOutcome::AlreadyServed) => {
            println!("Already up to date.");
            ExitCode::SUCCESS
        }
        Ok(SyncOutcome::Synced(report)) => {
            println!(
                "Synchronized: {} files received, {} unchanged, {} removed.",
                report.received, report.kept, report.pruned
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Synchronization failed: {e}");
            if let Err(log_error) = append_crash_record(&crash_log, &e.to_string()) {
                eprintln!("Could not write {}: {log_error}", crash_log.display());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, config: AppConfig) -> Result<SyncOutcome> {
    config.validate_strict()?;
    let client_config = config.client;

    let verifier = match &cli.public_key {
        Some(key) => Verifier::from_base64(key)?,
        None => Verifier::embedded().unwrap_or_else(|| {
            Err(ProtocolError::KeyError(
                "No server public key was embedded in this build; pass --public-key".into(),
            ))
        })?,
    };
    let tls_config = match &cli.pin_sha256 {
        Some(fingerprint) => TlsClientConfig::pinned(&client_config.server_name, fingerprint)?,
        None => TlsClientConfig::embedded(&client_config.server_name)?,
    };

    let client = SyncClient::new(client_config, verifier)?;
    client.run(&tls_config).await
}
