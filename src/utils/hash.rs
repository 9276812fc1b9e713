//! Content hashing.
//!
//! A file's identity is the SHA-256 digest of its full bytes. Two files with
//! identical content have identical hashes regardless of name or location.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

/// Digest length in bytes
pub const HASH_LEN: usize = 32;

/// SHA-256 digest of a file's content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// The all-zero hash terminates a client's hash list
    pub const TERMINATOR: ContentHash = ContentHash([0u8; HASH_LEN]);

    /// Hash an in-memory buffer
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn is_terminator(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentHash").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hash a file by streaming it through the digest
pub fn hash_file<P: AsRef<Path>>(path: P) -> io::Result<ContentHash> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(ContentHash(hasher.finalize().into()))
}
