// SPDX-License-Identifier: Apache-2.0

//! LZ4 block compression for packet payloads.
//!
//! A payload travels compressed when the sender's `original_size` field is
//! positive; the field then carries the uncompressed length. Senders only
//! compress above a configured threshold, and fall back to the uncompressed
//! bytes when compression would grow the payload.

use crate::error::FrameError;

/// Compress `payload` if it is longer than `threshold` bytes.
///
/// Returns `(original_size, bytes)`: `original_size > 0` means `bytes` is
/// LZ4-block-compressed and decodes to exactly that many bytes.
pub fn maybe_compress(payload: &[u8], threshold: usize) -> (i32, Vec<u8>) {
    if payload.len() <= threshold {
        return (0, payload.to_vec());
    }
    let compressed = lz4_flex::compress(payload);
    // Don't use the compressed bytes if they're BIGGER than the uncompressed ones...
    if compressed.len() >= payload.len() {
        (0, payload.to_vec())
    } else {
        (payload.len() as i32, compressed)
    }
}

/// Undo [`maybe_compress`] given the received `original_size` field.
pub fn maybe_decompress(original_size: i32, payload: Vec<u8>) -> Result<Vec<u8>, FrameError> {
    if original_size <= 0 {
        return Ok(payload);
    }
    lz4_flex::decompress(&payload, original_size as usize).map_err(|e| FrameError::BadCompression(e.into()))
}
