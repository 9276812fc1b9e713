//! # TLS Transport Layer
//!
//! TLS over TCP for the sync protocol.
//!
//! The server presents a certificate loaded from PEM files (or a generated
//! self-signed one for development). The client never consults system trust
//! stores: it trusts either a CA/self-signed certificate compiled into the
//! build or a pinned SHA-256 certificate fingerprint, so a writable install
//! directory cannot redirect it to another server.
//!
//! ## Responsibilities
//! - Load server certificate chains and PKCS#8 keys
//! - Generate self-signed development certificates
//! - Build client configurations from an embedded root or a pinned fingerprint
//! - Connect with a bounded connect timeout

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, instrument};

use crate::error::{ProtocolError, Result};
use crate::utils::timeout::with_timeout_error;

/// CA or self-signed server certificate (PEM) embedded into client builds
pub const EMBEDDED_CA_CERT: Option<&str> = option_env!("SSPROTO_CA_CERT");

/// TLS server configuration
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl TlsServerConfig {
    /// Create a new TLS server configuration
    pub fn new<P: AsRef<Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
        }
    }

    /// Generate a self-signed certificate for development/testing purposes
    pub fn generate_self_signed<P: AsRef<Path>>(
        cert_path: P,
        key_path: P,
        names: Vec<String>,
    ) -> io::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(names)
            .map_err(|e| io::Error::other(format!("Certificate generation error: {e}")))?;

        let mut cert_file = File::create(&cert_path)?;
        cert_file.write_all(cert.cert.pem().as_bytes())?;

        let mut key_file = File::create(&key_path)?;
        key_file.write_all(cert.signing_key.serialize_pem().as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            key_file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }

        info!(cert = %cert_path.as_ref().display(), "Generated self-signed certificate");
        Ok(Self::new(cert_path, key_path))
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Load the TLS configuration from files
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let cert_chain = load_certificates(&self.cert_path)?;

        let key_file = File::open(&self.key_path)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file: {e}")))?;
        let mut key_reader = BufReader::new(key_file);
        let keys = pkcs8_private_keys(&mut key_reader)
            .map_err(|_| ProtocolError::TlsError("Failed to parse private key".into()))?;
        let Some(key) = keys.into_iter().next() else {
            return Err(ProtocolError::TlsError("No private keys found".into()));
        };

        // with_safe_defaults: TLS 1.2+ and modern cipher suites
        ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, PrivateKey(key))
            .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.load_server_config()?)))
    }
}

/// What the client trusts
#[derive(Debug, Clone)]
pub enum TrustAnchor {
    /// PEM text of a CA or self-signed server certificate
    RootPem(String),
    /// SHA-256 fingerprint of the exact server certificate (DER)
    Pinned([u8; 32]),
}

/// TLS Client Configuration
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    trust: TrustAnchor,
}

impl TlsClientConfig {
    pub fn new<S: Into<String>>(server_name: S, trust: TrustAnchor) -> Self {
        Self {
            server_name: server_name.into(),
            trust,
        }
    }

    /// Use the certificate embedded at build time
    pub fn embedded<S: Into<String>>(server_name: S) -> Result<Self> {
        let pem = EMBEDDED_CA_CERT.ok_or_else(|| {
            ProtocolError::TlsError("No trusted certificate was embedded in this build".into())
        })?;
        Ok(Self::new(server_name, TrustAnchor::RootPem(pem.to_string())))
    }

    /// Pin a certificate by its hex-encoded SHA-256 fingerprint
    pub fn pinned<S: Into<String>>(server_name: S, fingerprint_hex: &str) -> Result<Self> {
        let bytes = hex::decode(fingerprint_hex.trim().replace(':', ""))
            .map_err(|e| ProtocolError::TlsError(format!("Invalid certificate fingerprint: {e}")))?;
        let fingerprint: [u8; 32] = bytes.try_into().map_err(|_| {
            ProtocolError::TlsError("Certificate fingerprint must be 32 bytes".into())
        })?;
        Ok(Self::new(server_name, TrustAnchor::Pinned(fingerprint)))
    }

    /// Build the rustls client configuration
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let builder = ClientConfig::builder().with_safe_defaults();
        match &self.trust {
            TrustAnchor::RootPem(pem) => {
                let mut root_store = RootCertStore::empty();
                for cert in parse_certificates(&mut pem.as_bytes())? {
                    root_store.add(&cert).map_err(|e| {
                        ProtocolError::TlsError(format!("Failed to add cert to root store: {e}"))
                    })?;
                }
                Ok(builder
                    .with_root_certificates(root_store)
                    .with_no_client_auth())
            }
            TrustAnchor::Pinned(fingerprint) => Ok(builder
                .with_custom_certificate_verifier(Arc::new(CertificateFingerprint {
                    fingerprint: *fingerprint,
                }))
                .with_no_client_auth()),
        }
    }

    /// Get the server name as a rustls::ServerName
    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ProtocolError::TlsError("Invalid server name".into()))
    }
}

/// Accepts exactly one certificate, identified by its SHA-256 fingerprint
struct CertificateFingerprint {
    fingerprint: [u8; 32],
}

impl rustls::client::ServerCertVerifier for CertificateFingerprint {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        if calculate_cert_hash(end_entity) == self.fingerprint {
            Ok(rustls::client::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "Pinned certificate hash mismatch".into(),
            ))
        }
    }
}

/// SHA-256 over a certificate's DER encoding
pub fn calculate_cert_hash(cert: &Certificate) -> [u8; 32] {
    Sha256::digest(&cert.0).into()
}

/// Fingerprint of the first certificate in a PEM file
pub fn certificate_fingerprint<P: AsRef<Path>>(pem_path: P) -> Result<[u8; 32]> {
    let chain = load_certificates(pem_path.as_ref())?;
    chain
        .first()
        .map(calculate_cert_hash)
        .ok_or_else(|| ProtocolError::TlsError("No certificate found".into()))
}

fn load_certificates(path: &Path) -> Result<Vec<Certificate>> {
    let cert_file = File::open(path)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open cert file: {e}")))?;
    parse_certificates(&mut BufReader::new(cert_file))
}

fn parse_certificates(reader: &mut dyn io::BufRead) -> Result<Vec<Certificate>> {
    let chain = certs(reader)
        .map_err(|_| ProtocolError::TlsError("Failed to parse certificate".into()))?;
    if chain.is_empty() {
        return Err(ProtocolError::TlsError("No certificate found".into()));
    }
    Ok(chain.into_iter().map(Certificate).collect())
}

/// Connect to a TLS server
#[instrument(skip(config), fields(address = %addr))]
pub async fn connect(
    addr: &str,
    config: &TlsClientConfig,
    connect_timeout: Duration,
) -> Result<ClientTlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(config.load_client_config()?));
    let domain = config.server_name()?;

    let tls_stream = with_timeout_error(
        async {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            connector
                .connect(domain, stream)
                .await
                .map_err(|e| ProtocolError::TlsError(format!("TLS connection failed: {e}")))
        },
        connect_timeout,
    )
    .await?;

    debug!("TLS connection established");
    Ok(tls_stream)
}
