//! # Core Protocol Components
//!
//! Wire framing shared by the server session and the client driver.
//!
//! ## Components
//! - **Codec**: integers, booleans, fixed arrays and length-prefixed strings
//! - **Packet**: hash list entries and signed delta packets
//!
//! ## Wire Format
//! ```text
//! hash list entry: [Hash(32)] [PathLen(8)] [Path(N)]
//! delta packet:    [Hash(32)] [Signature(64)] [PathLen(8)] [Path(N)] [Len(8)] [Payload(M)]
//! ```
//!
//! ## Security
//! - Path fields are capped at `MAX_PATH_LEN` before allocation
//! - Payload and metrics lengths are validated against configured limits
//!   before allocation

pub mod codec;
pub mod packet;
