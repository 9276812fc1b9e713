//! Protocol frames with more than one field.
//!
//! ```text
//! hash list entry:  [hash(32)] [path_len(u64)] [path]     (zero hash: no path)
//! delta packet:     [hash(32)] [signature(64)] [path_len(u64)] [path]
//!                   [payload_len(u64)] [payload]
//! ```

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::config::MAX_PATH_LEN;
use crate::core::codec;
use crate::error::Result;
use crate::utils::crypto::{Verifier, SIGNATURE_LEN};
use crate::utils::hash::{ContentHash, HASH_LEN};

/// One entry of the client's hash list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashListEntry {
    pub hash: ContentHash,
    pub path: String,
}

impl HashListEntry {
    pub fn new(hash: ContentHash, path: impl Into<String>) -> Self {
        Self {
            hash,
            path: path.into(),
        }
    }

    /// Read one entry; `None` when the terminator arrives
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let hash = ContentHash::from_bytes(codec::read_array::<_, HASH_LEN>(reader).await?);
        if hash.is_terminator() {
            return Ok(None);
        }
        let path = codec::read_string(reader, "path", MAX_PATH_LEN).await?;
        Ok(Some(Self { hash, path }))
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = BytesMut::with_capacity(HASH_LEN + 8 + self.path.len());
        codec::put_raw(&mut buf, self.hash.as_bytes());
        codec::put_bytes(&mut buf, self.path.as_bytes());
        writer.write_all(&buf).await?;
        Ok(())
    }

    pub async fn write_terminator<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
        codec::write_raw(writer, ContentHash::TERMINATOR.as_bytes()).await
    }
}

/// One file streamed from server to client
#[derive(Clone, PartialEq, Eq)]
pub struct DeltaPacket {
    pub hash: ContentHash,
    pub signature: [u8; SIGNATURE_LEN],
    pub path: String,
    pub blob: Vec<u8>,
}

impl std::fmt::Debug for DeltaPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaPacket")
            .field("hash", &self.hash)
            .field("path", &self.path)
            .field("len", &self.blob.len())
            .finish()
    }
}

impl DeltaPacket {
    /// Write header and payload. The header goes out in one write so small
    /// files do not fragment into many TLS records.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut header = BytesMut::with_capacity(HASH_LEN + SIGNATURE_LEN + 16 + self.path.len());
        codec::put_raw(&mut header, self.hash.as_bytes());
        codec::put_raw(&mut header, &self.signature);
        codec::put_bytes(&mut header, self.path.as_bytes());
        codec::put_u64(&mut header, self.blob.len() as u64);
        writer.write_all(&header).await?;
        writer.write_all(&self.blob).await?;
        Ok(())
    }

    /// Read the next packet; `None` on a clean end of stream at a frame boundary
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_payload: u64,
    ) -> Result<Option<Self>> {
        let Some(hash) = codec::read_array_or_eof::<_, HASH_LEN>(reader).await? else {
            return Ok(None);
        };
        let signature = codec::read_array::<_, SIGNATURE_LEN>(reader).await?;
        let path = codec::read_string(reader, "path", MAX_PATH_LEN).await?;
        let blob = codec::read_bytes(reader, "payload", max_payload).await?;
        Ok(Some(Self {
            hash: ContentHash::from_bytes(hash),
            signature,
            path,
            blob,
        }))
    }

    /// True iff the payload matches the hash and the hash carries a valid signature
    pub fn verify(&self, verifier: &Verifier) -> bool {
        ContentHash::of(&self.blob) == self.hash
            && verifier.verify(self.hash.as_bytes(), &self.signature)
    }
}
