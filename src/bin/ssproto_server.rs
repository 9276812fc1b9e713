//! ssproto-server: serves the configured bundle to sync clients.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use ssproto::config::AppConfig;
use ssproto::service::server;
use ssproto::transport::tls::{certificate_fingerprint, TlsServerConfig};
use ssproto::utils::crypto::Signer;
use ssproto::utils::logging::init_logging;

#[derive(Parser)]
#[command(name = "ssproto-server")]
#[command(version, about = "Serve a signed, content-addressed client bundle")]
struct Cli {
    /// Configuration file; written with defaults when absent
    #[arg(short, long, default_value = "ssproto.toml")]
    config: PathBuf,

    /// Write a self-signed certificate and key to the configured paths, then exit
    #[arg(long)]
    generate_cert: bool,

    /// Print the base64 public signing key for client builds, then exit
    #[arg(long)]
    print_public_key: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load_or_init(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ssproto-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.generate_cert {
        return report(generate_cert(&config));
    }
    if cli.print_public_key {
        return report(
            Signer::load_or_generate(&config.server.signing_key_path)
                .map(|signer| println!("{}", signer.public_key_base64())),
        );
    }

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("ssproto-server: {e}");
        return ExitCode::FAILURE;
    }
    match server::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server stopped");
            ExitCode::FAILURE
        }
    }
}

fn generate_cert(config: &AppConfig) -> ssproto::Result<()> {
    let server = &config.server;
    TlsServerConfig::generate_self_signed(
        &server.cert_path,
        &server.key_path,
        vec![server.server_name.clone()],
    )?;
    let fingerprint = certificate_fingerprint(&server.cert_path)?;
    println!("certificate: {}", server.cert_path.display());
    println!("sha256: {}", hex::encode(fingerprint));
    Ok(())
}

fn report(result: ssproto::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ssproto-server: {e}");
            ExitCode::FAILURE
        }
    }
}
