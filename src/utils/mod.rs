//! # Utility Modules
//!
//! Supporting utilities for hashing, signing, logging, metrics and timing.
//!
//! ## Components
//! - **Hash**: SHA-256 content identity
//! - **Crypto**: Ed25519 signing (server) and verification (client)
//! - **Logging**: `tracing-subscriber` initialization
//! - **Metrics**: Atomic session and transfer counters
//! - **Timeout**: Absolute connection deadlines
//!
//! ## Security
//! - Secret key material is zeroized after decoding (zeroize crate)
//! - Verification failures are never distinguishable by callers

pub mod crypto;
pub mod hash;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use crypto::{Signer, Verifier};
pub use hash::ContentHash;
