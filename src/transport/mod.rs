//! # Transport Layer
//!
//! TLS over TCP for server and client.
//!
//! ## Components
//! - **TLS**: certificate loading, self-signed generation, embedded or pinned
//!   client trust, timed connect

pub mod tls;

pub use tls::{TlsClientConfig, TlsServerConfig, TrustAnchor};
