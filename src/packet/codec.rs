// SPDX-License-Identifier: Apache-2.0

//! Little-endian cursor primitives shared by the frame and envelope codecs.

use anyhow::ensure;
use std::convert::TryInto;

/// Read a `u8` at the cursor and advance it.
pub fn read_u8(start: &mut usize, payload: &[u8]) -> anyhow::Result<u8> {
    ensure!(payload.len() >= *start + 1, "buffer too small for u8");
    let value = payload[*start];
    *start += 1;
    Ok(value)
}

/// Read a `u16` at the cursor and advance it.
pub fn read_u16(start: &mut usize, payload: &[u8]) -> anyhow::Result<u16> {
    ensure!(payload.len() >= *start + 2, "buffer too small for u16");
    let value = u16::from_le_bytes(payload[*start..][..2].try_into()?);
    *start += 2;
    Ok(value)
}

/// Read a `u32` at the cursor and advance it.
pub fn read_u32(start: &mut usize, payload: &[u8]) -> anyhow::Result<u32> {
    ensure!(payload.len() >= *start + 4, "buffer too small for u32");
    let value = u32::from_le_bytes(payload[*start..][..4].try_into()?);
    *start += 4;
    Ok(value)
}

/// Read an `i32` at the cursor and advance it.
pub fn read_i32(start: &mut usize, payload: &[u8]) -> anyhow::Result<i32> {
    ensure!(payload.len() >= *start + 4, "buffer too small for i32");
    let value = i32::from_le_bytes(payload[*start..][..4].try_into()?);
    *start += 4;
    Ok(value)
}

/// Read an `i64` at the cursor and advance it.
pub fn read_i64(start: &mut usize, payload: &[u8]) -> anyhow::Result<i64> {
    ensure!(payload.len() >= *start + 8, "buffer too small for i64");
    let value = i64::from_le_bytes(payload[*start..][..8].try_into()?);
    *start += 8;
    Ok(value)
}

/// Read a `u8`-length-prefixed UTF-8 string at the cursor and advance it.
pub fn read_short_str(start: &mut usize, payload: &[u8]) -> anyhow::Result<String> {
    let len = read_u8(start, payload)? as usize;
    ensure!(payload.len() >= *start + len, "buffer too small for string of {} bytes", len);
    let value = std::str::from_utf8(&payload[*start..][..len])?.to_string();
    *start += len;
    Ok(value)
}

/// Append a `u8`.
pub fn write_u8(payload: &mut Vec<u8>, value: u8) {
    payload.push(value);
}

/// Append a `u16`, little-endian.
pub fn write_u16(payload: &mut Vec<u8>, value: u16) {
    payload.extend_from_slice(&value.to_le_bytes());
}

/// Append a `u32`, little-endian.
pub fn write_u32(payload: &mut Vec<u8>, value: u32) {
    payload.extend_from_slice(&value.to_le_bytes());
}

/// Append an `i32`, little-endian.
pub fn write_i32(payload: &mut Vec<u8>, value: i32) {
    payload.extend_from_slice(&value.to_le_bytes());
}

/// Append an `i64`, little-endian.
pub fn write_i64(payload: &mut Vec<u8>, value: i64) {
    payload.extend_from_slice(&value.to_le_bytes());
}

/// Append a `u8`-length-prefixed UTF-8 string. The string must be at most
/// 255 bytes; callers validate msg ids before reaching this point.
pub fn write_short_str(payload: &mut Vec<u8>, value: &str) -> anyhow::Result<()> {
    ensure!(value.len() <= u8::MAX as usize, "string of {} bytes exceeds 255", value.len());
    payload.push(value.len() as u8);
    payload.extend_from_slice(value.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut buf = Vec::new();
        write_u8(&mut buf, 7);
        write_u16(&mut buf, 0xBEEF);
        write_u32(&mut buf, 0xDEAD_BEEF);
        write_i32(&mut buf, -42);
        write_i64(&mut buf, i64::MIN + 1);
        write_short_str(&mut buf, "Echo").unwrap();

        let mut start = 0;
        assert_eq!(read_u8(&mut start, &buf).unwrap(), 7);
        assert_eq!(read_u16(&mut start, &buf).unwrap(), 0xBEEF);
        assert_eq!(read_u32(&mut start, &buf).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_i32(&mut start, &buf).unwrap(), -42);
        assert_eq!(read_i64(&mut start, &buf).unwrap(), i64::MIN + 1);
        assert_eq!(read_short_str(&mut start, &buf).unwrap(), "Echo");
        assert_eq!(start, buf.len());
    }

    #[test]
    fn reads_are_bounds_checked() {
        let buf = [1u8, 2];
        let mut start = 0;
        assert!(read_u32(&mut start, &buf).is_err());
        // a failed read must not advance the cursor
        assert_eq!(start, 0);
        let mut start = 1;
        assert!(read_u16(&mut start, &buf).is_err());
    }

    #[test]
    fn string_length_is_bounds_checked() {
        // declared length of 10 with only 2 bytes behind it
        let buf = [10u8, b'a', b'b'];
        let mut start = 0;
        assert!(read_short_str(&mut start, &buf).is_err());
    }

    #[test]
    fn oversized_string_is_refused() {
        let mut buf = Vec::new();
        let long = "x".repeat(256);
        assert!(write_short_str(&mut buf, &long).is_err());
    }
}
