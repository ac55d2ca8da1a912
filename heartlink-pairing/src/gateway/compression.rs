//! Deflate + base64 for message bodies above the compression threshold.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// Value of the `encoding` field on a compressed message.
pub const DEFLATE: &str = "deflate";

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("content is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("content is not a valid deflate stream")]
    Corrupt(#[from] std::io::Error),
    #[error("inflated content exceeds {0} bytes")]
    TooLarge(usize),
    #[error("inflated content is not UTF-8")]
    NotUtf8,
}

pub fn deflate(text: &str) -> Result<String, CompressionError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(text.as_bytes())?;
    Ok(STANDARD.encode(encoder.finish()?))
}

/// Reverse of [`deflate`]. Stops reading past `max_len` bytes, so a small
/// payload cannot expand into an unbounded allocation.
pub fn inflate(encoded: &str, max_len: usize) -> Result<String, CompressionError> {
    let compressed = STANDARD.decode(encoded)?;
    let mut out = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .take(max_len as u64 + 1)
        .read_to_end(&mut out)?;
    if out.len() > max_len {
        return Err(CompressionError::TooLarge(max_len));
    }
    String::from_utf8(out).map_err(|_| CompressionError::NotUtf8)
}
