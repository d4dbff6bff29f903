// SPDX-License-Identifier: Apache-2.0

//! Client-facing wire framing.
//!
//! All integers are little-endian. Every frame starts with a `u32` length
//! counting the bytes after it:
//!
//! - request:  `length | msgIdLen:u8 | msgId | msgSeq:u16 | stageId:i64 | payload`
//! - response: `length | msgIdLen:u8 | msgId | msgSeq:u16 | stageId:i64 |
//!   errorCode:u16 | originalSize:i32 | payload`
//!
//! A TCP read may carry several frames or a fraction of one; the
//! [`FrameAccumulator`] buffers until a whole frame is available and then
//! yields its body.

use super::{
    codec,
    compression,
    Packet,
};
use crate::error::FrameError;
use std::convert::TryInto;

/// Length prefix size.
pub const LENGTH_PREFIX: usize = 4;
/// Fixed header bytes of a request body besides the msg id.
pub const REQUEST_HEADER: usize = 1 + 2 + 8;
/// Fixed header bytes of a response body besides the msg id.
pub const RESPONSE_HEADER: usize = 1 + 2 + 8 + 2 + 4;

fn check_msg_id(msg_id: &str) -> Result<(), FrameError> {
    if msg_id.is_empty() || msg_id.len() > u8::MAX as usize {
        return Err(FrameError::BadMsgId(msg_id.len()));
    }
    Ok(())
}

/// Encode a client→server request frame, length prefix included.
pub fn encode_request(packet: &Packet) -> Result<Vec<u8>, FrameError> {
    check_msg_id(&packet.msg_id)?;
    let body_len = REQUEST_HEADER + packet.msg_id.len() + packet.payload.len();
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body_len);
    codec::write_u32(&mut frame, body_len as u32);
    frame.push(packet.msg_id.len() as u8);
    frame.extend_from_slice(packet.msg_id.as_bytes());
    codec::write_u16(&mut frame, packet.msg_seq);
    codec::write_i64(&mut frame, packet.stage_id);
    frame.extend_from_slice(&packet.payload);
    Ok(frame)
}

/// Decode a request frame body (the bytes after the length prefix).
pub fn decode_request(body: &[u8]) -> Result<Packet, FrameError> {
    let mut start = 0;
    let msg_id = decode_msg_id(&mut start, body)?;
    let msg_seq = codec::read_u16(&mut start, body).map_err(malformed)?;
    let stage_id = codec::read_i64(&mut start, body).map_err(malformed)?;
    Ok(Packet {
        msg_id,
        msg_seq,
        stage_id,
        error_code: 0,
        payload: body[start..].to_vec(),
    })
}

/// Encode a server→client frame, compressing the payload above `threshold`
/// bytes. Length prefix included.
pub fn encode_response(packet: &Packet, threshold: usize) -> Result<Vec<u8>, FrameError> {
    check_msg_id(&packet.msg_id)?;
    let (original_size, payload) = compression::maybe_compress(&packet.payload, threshold);
    let body_len = RESPONSE_HEADER + packet.msg_id.len() + payload.len();
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body_len);
    codec::write_u32(&mut frame, body_len as u32);
    frame.push(packet.msg_id.len() as u8);
    frame.extend_from_slice(packet.msg_id.as_bytes());
    codec::write_u16(&mut frame, packet.msg_seq);
    codec::write_i64(&mut frame, packet.stage_id);
    codec::write_u16(&mut frame, packet.error_code);
    codec::write_i32(&mut frame, original_size);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a server→client frame body, decompressing when `originalSize`
/// is positive.
pub fn decode_response(body: &[u8]) -> Result<Packet, FrameError> {
    let mut start = 0;
    let msg_id = decode_msg_id(&mut start, body)?;
    let msg_seq = codec::read_u16(&mut start, body).map_err(malformed)?;
    let stage_id = codec::read_i64(&mut start, body).map_err(malformed)?;
    let error_code = codec::read_u16(&mut start, body).map_err(malformed)?;
    let original_size = codec::read_i32(&mut start, body).map_err(malformed)?;
    let payload = compression::maybe_decompress(original_size, body[start..].to_vec())?;
    Ok(Packet {
        msg_id,
        msg_seq,
        stage_id,
        error_code,
        payload,
    })
}

pub(crate) fn decode_msg_id(start: &mut usize, body: &[u8]) -> Result<String, FrameError> {
    let len = codec::read_u8(start, body).map_err(malformed)? as usize;
    if len == 0 {
        return Err(FrameError::BadMsgId(0));
    }
    if body.len() < *start + len {
        return Err(FrameError::Malformed(format!("msg id of {} bytes overruns the frame", len)));
    }
    let msg_id = std::str::from_utf8(&body[*start..][..len])
        .map_err(|_| FrameError::BadUtf8)?
        .to_string();
    *start += len;
    Ok(msg_id)
}

fn malformed(e: anyhow::Error) -> FrameError {
    FrameError::Malformed(e.to_string())
}

/// Buffers raw socket bytes and yields one frame body at a time.
pub struct FrameAccumulator {
    buffer: Vec<u8>,
    max_frame: usize,
}

impl FrameAccumulator {
    /// `max_frame` bounds the `length` field of accepted frames.
    pub fn new(max_frame: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame body, or `None` until enough bytes have
    /// accumulated. An oversize or degenerate length terminates decoding.
    pub fn next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let length = u32::from_le_bytes(self.buffer[..LENGTH_PREFIX].try_into().unwrap()) as usize;
        if length > self.max_frame {
            return Err(FrameError::Oversize {
                length,
                max: self.max_frame,
            });
        }
        if length < REQUEST_HEADER + 1 {
            return Err(FrameError::Malformed(format!("frame body of {} bytes is too short", length)));
        }
        if self.buffer.len() < LENGTH_PREFIX + length {
            return Ok(None);
        }
        let body = self.buffer[LENGTH_PREFIX..LENGTH_PREFIX + length].to_vec();
        self.buffer.drain(..LENGTH_PREFIX + length);
        Ok(Some(body))
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet {
            msg_id: "Echo".to_string(),
            msg_seq: 1,
            stage_id: 42,
            error_code: 0,
            payload: b"hello".to_vec(),
        }
    }

    #[test]
    fn request_round_trip() {
        let frame = encode_request(&sample()).unwrap();
        let decoded = decode_request(&frame[LENGTH_PREFIX..]).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn response_round_trip() {
        let mut packet = sample();
        packet.error_code = 404;
        let frame = encode_response(&packet, usize::MAX).unwrap();
        let decoded = decode_response(&frame[LENGTH_PREFIX..]).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn response_round_trip_compressed() {
        let mut packet = sample();
        packet.payload = b"tick ".iter().cycle().take(8192).copied().collect();
        let frame = encode_response(&packet, 64).unwrap();
        assert!(frame.len() < LENGTH_PREFIX + RESPONSE_HEADER + packet.msg_id.len() + packet.payload.len());
        let decoded = decode_response(&frame[LENGTH_PREFIX..]).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn accumulator_handles_partial_and_coalesced_reads() {
        let a = encode_request(&sample()).unwrap();
        let mut b_packet = sample();
        b_packet.msg_seq = 2;
        let b = encode_request(&b_packet).unwrap();

        let mut acc = FrameAccumulator::new(1024);
        // a fraction of the first frame: need more, buffer retained
        acc.extend(&a[..3]);
        assert!(acc.next().unwrap().is_none());
        assert_eq!(acc.buffered(), 3);
        // the rest of the first frame plus the whole second frame at once
        acc.extend(&a[3..]);
        acc.extend(&b);
        assert_eq!(decode_request(&acc.next().unwrap().unwrap()).unwrap().msg_seq, 1);
        assert_eq!(decode_request(&acc.next().unwrap().unwrap()).unwrap().msg_seq, 2);
        assert!(acc.next().unwrap().is_none());
        assert_eq!(acc.buffered(), 0);
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let packet = Packet {
            payload: vec![0u8; 256],
            ..sample()
        };
        let frame = encode_request(&packet).unwrap();
        let mut acc = FrameAccumulator::new(64);
        acc.extend(&frame);
        assert!(matches!(acc.next(), Err(FrameError::Oversize { .. })));
    }

    #[test]
    fn boundary_payload_sizes() {
        let max = 1024usize;
        let headroom = REQUEST_HEADER + sample().msg_id.len();
        // exactly at the limit
        let packet = Packet {
            payload: vec![7u8; max - headroom],
            ..sample()
        };
        let mut acc = FrameAccumulator::new(max);
        acc.extend(&encode_request(&packet).unwrap());
        assert!(acc.next().unwrap().is_some());
        // one byte over
        let packet = Packet {
            payload: vec![7u8; max - headroom + 1],
            ..sample()
        };
        let mut acc = FrameAccumulator::new(max);
        acc.extend(&encode_request(&packet).unwrap());
        assert!(acc.next().is_err());
    }

    #[test]
    fn msg_id_length_bounds() {
        let ok = Packet {
            msg_id: "m".repeat(255),
            ..sample()
        };
        let frame = encode_request(&ok).unwrap();
        assert_eq!(decode_request(&frame[LENGTH_PREFIX..]).unwrap().msg_id.len(), 255);

        let too_long = Packet {
            msg_id: "m".repeat(256),
            ..sample()
        };
        assert!(matches!(encode_request(&too_long), Err(FrameError::BadMsgId(256))));

        let empty = Packet {
            msg_id: String::new(),
            ..sample()
        };
        assert!(matches!(encode_request(&empty), Err(FrameError::BadMsgId(0))));

        // a frame whose msg id length byte is zero is malformed on decode
        let mut body = encode_request(&sample()).unwrap()[LENGTH_PREFIX..].to_vec();
        body[0] = 0;
        assert!(matches!(decode_request(&body), Err(FrameError::BadMsgId(0))));
    }

    #[test]
    fn truncated_body_is_malformed() {
        let frame = encode_request(&sample()).unwrap();
        let body = &frame[LENGTH_PREFIX..];
        // cut inside the stage id
        assert!(decode_request(&body[..8]).is_err());
    }
}
