//! # Sync Protocol
//!
//! The per-connection state machine run by the server.
//!
//! ## Message Flow (protocol version 2)
//! ```text
//! Client                                   Server
//!   | -- version (u8) ------------------------> |
//!   | <------------------- must update (bool) -- |
//!   | -- identifier ([u8; 32]) ---------------> |
//!   | <------------- signature ([u8; 64]) ------ |
//!   | <----------------------- accepted (bool) - |
//!   | -- metrics (u64 len + bytes) -----------> |
//!   | -- hash + path --------------------------> |   repeated until
//!   | <----------------------- present (bool) -- |   the zero hash
//!   | <--------- hash, signature, path, blob --- |   per delta file
//!   | <------------------------------- EOF ----- |
//! ```
//!
//! ## Security
//! - The identifier signature lets the client authenticate the server before
//!   it sends anything else
//! - Every delta file carries a signature over its hash
//! - Client-supplied lengths are bounded before allocation

pub mod session;

pub use session::{
    SessionContext, SessionHandler, SessionLimits, SessionOutcome, SessionState, TransferSummary,
};
