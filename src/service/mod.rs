//! # Service Layer
//!
//! Process-level wiring for both ends of the protocol.
//!
//! ## Components
//! - **Server**: TLS accept loop, per-connection sessions, live index
//!   maintenance and graceful drain on shutdown
//! - **Client**: identifier persistence, local hashing, hash exchange,
//!   verified delta application and crash records

pub mod client;
pub mod server;

pub use client::{SyncClient, SyncOutcome, SyncReport};
pub use server::ProtocolServer;
