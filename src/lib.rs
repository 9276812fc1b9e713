//! # ssproto
//!
//! Signed, content-addressed synchronization of a game client bundle.
//!
//! A server keeps a live index of the files it distributes, keyed by SHA-256
//! content hash. Clients advertise the hashes they already hold, the server
//! answers which ones it knows and then streams every indexed file the client
//! lacks, each signed with the server's Ed25519 key. Everything runs over TLS.
//!
//! ## Modules
//! - [`index`]: rule-driven content index with filesystem watching
//! - [`protocol`]: per-connection server state machine
//! - [`core`]: wire codec and multi-field frames
//! - [`ledger`]: clients served in the current index epoch
//! - [`transport`]: TLS server and client setup
//! - [`service`]: server process and client sync driver
//! - [`config`], [`error`], [`utils`]: configuration, errors, hashing,
//!   signing, logging and metrics

pub mod config;
pub mod core;
pub mod error;
pub mod index;
pub mod ledger;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use error::{ProtocolError, Result};
