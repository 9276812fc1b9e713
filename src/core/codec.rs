//! # Binary Codec
//!
//! Framing primitives shared by server and client.
//!
//! ## Encoding rules
//! - Integers: fixed width, little-endian
//! - Booleans: one byte, `0` or `1`
//! - Fixed-size byte arrays: raw bytes, no prefix
//! - Variable-length strings: `u64` length followed by the bytes, or
//!   NUL-terminated. Protocol version 2 uses length-prefixed strings for every
//!   variable field; the NUL-terminated helpers exist for tooling and must not
//!   be mixed into a message type that already uses length prefixes.
//!
//! Every read or write blocks until the whole field is transferred or the
//! stream fails. No partial-frame state survives a call.
//!
//! Writers come in two flavours: async `write_*` functions for direct stream
//! output and `put_*` functions that append to a [`BytesMut`] so that a
//! multi-field header can be assembled and sent with one write.

use bytes::{BufMut, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{constants, ProtocolError, Result};

/// Map a premature end of stream to `ConnectionClosed`
fn map_read_err(e: io::Error) -> ProtocolError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::ConnectionClosed
    } else {
        ProtocolError::Io(e)
    }
}

pub async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
    reader.read_u8().await.map_err(map_read_err)
}

pub async fn read_u64<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64> {
    reader.read_u64_le().await.map_err(map_read_err)
}

/// Read a strict boolean byte
pub async fn read_bool<R: AsyncRead + Unpin>(reader: &mut R) -> Result<bool> {
    match read_u8(reader).await? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ProtocolError::InvalidFrame(constants::ERR_INVALID_BOOL.into())),
    }
}

/// Read a fixed-size byte array
pub async fn read_array<R: AsyncRead + Unpin, const N: usize>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).await.map_err(map_read_err)?;
    Ok(buf)
}

/// Read a fixed-size array, returning `None` if the stream ends cleanly
/// before the first byte. A stream ending mid-array is an error.
pub async fn read_array_or_eof<R: AsyncRead + Unpin, const N: usize>(
    reader: &mut R,
) -> Result<Option<[u8; N]>> {
    let mut buf = [0u8; N];
    let mut filled = 0;
    while filled < N {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::ConnectionClosed);
        }
        filled += n;
    }
    Ok(Some(buf))
}

/// Read a `u64`-length-prefixed byte string of at most `limit` bytes
pub async fn read_bytes<R: AsyncRead + Unpin>(
    reader: &mut R,
    field: &'static str,
    limit: u64,
) -> Result<Vec<u8>> {
    let size = read_u64(reader).await?;
    if size > limit {
        return Err(ProtocolError::OversizedField { field, size, limit });
    }
    let mut buf = vec![0u8; size as usize];
    reader.read_exact(&mut buf).await.map_err(map_read_err)?;
    Ok(buf)
}

/// Read a length-prefixed UTF-8 string
pub async fn read_string<R: AsyncRead + Unpin>(
    reader: &mut R,
    field: &'static str,
    limit: u64,
) -> Result<String> {
    let bytes = read_bytes(reader, field, limit).await?;
    String::from_utf8(bytes)
        .map_err(|_| ProtocolError::InvalidFrame(constants::ERR_INVALID_UTF8_PATH.into()))
}

/// Read a NUL-terminated byte string of at most `limit` bytes (terminator excluded)
pub async fn read_cstring<R: AsyncRead + Unpin>(reader: &mut R, limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let byte = read_u8(reader).await?;
        if byte == 0 {
            return Ok(out);
        }
        if out.len() == limit {
            return Err(ProtocolError::InvalidFrame(
                constants::ERR_UNTERMINATED_STRING.into(),
            ));
        }
        out.push(byte);
    }
}

pub async fn write_u8<W: AsyncWrite + Unpin>(writer: &mut W, value: u8) -> Result<()> {
    writer.write_u8(value).await?;
    Ok(())
}

pub async fn write_u64<W: AsyncWrite + Unpin>(writer: &mut W, value: u64) -> Result<()> {
    writer.write_u64_le(value).await?;
    Ok(())
}

pub async fn write_bool<W: AsyncWrite + Unpin>(writer: &mut W, value: bool) -> Result<()> {
    write_u8(writer, value as u8).await
}

/// Write raw bytes with no prefix (fixed-size arrays)
pub async fn write_raw<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await?;
    Ok(())
}

/// Write a `u64`-length-prefixed byte string
pub async fn write_bytes<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    write_u64(writer, bytes.len() as u64).await?;
    write_raw(writer, bytes).await
}

/// Write a NUL-terminated byte string; embedded NULs are rejected
pub async fn write_cstring<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    if bytes.contains(&0) {
        return Err(ProtocolError::InvalidFrame(
            "NUL-terminated field contains a NUL byte".into(),
        ));
    }
    write_raw(writer, bytes).await?;
    write_u8(writer, 0).await
}

pub fn put_u64(buf: &mut BytesMut, value: u64) {
    buf.put_u64_le(value);
}

pub fn put_raw(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_slice(bytes);
}

/// Append a `u64`-length-prefixed byte string
pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.reserve(8 + bytes.len());
    put_u64(buf, bytes.len() as u64);
    put_raw(buf, bytes);
}
