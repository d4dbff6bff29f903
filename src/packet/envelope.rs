// SPDX-License-Identifier: Apache-2.0

//! The server-to-server envelope: a routing header followed by the packet
//! body, framed with the same `u32` length prefix as client frames.
//!
//! The leading `kind` byte separates requests from replies so a reply's
//! sequence number can never be mistaken for a new request from the peer's
//! independent sequence space.

use super::{
    codec,
    compression,
    frame,
    Packet,
};
use crate::{
    error::FrameError,
    AccountId,
    NodeId,
    StageId,
};

/// Direction of an envelope.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// A new request or push toward the target.
    Request = 0,
    /// A reply resolving a pending sequence at the target.
    Reply = 1,
}

/// One S2S message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Request or reply.
    pub kind: EnvelopeKind,
    /// The node that produced the envelope.
    pub source_node: NodeId,
    /// The node that should consume it.
    pub target_node: NodeId,
    /// Non-zero when addressed to a load-balanced Api service.
    pub target_service: u16,
    /// The stage on the target node, when stage-addressed.
    pub target_stage: StageId,
    /// The stage on the source node a reply should come back to.
    pub source_stage: StageId,
    /// The account the message concerns, when any.
    pub account_id: AccountId,
    /// The inner packet.
    pub packet: Packet,
}

impl Envelope {
    /// A request envelope.
    pub fn request(
        source_node: NodeId,
        target_node: NodeId,
        target_stage: StageId,
        source_stage: StageId,
        packet: Packet,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            source_node,
            target_node,
            target_service: 0,
            target_stage,
            source_stage,
            account_id: 0,
            packet,
        }
    }

    /// A request envelope addressed to an Api service rather than a stage.
    pub fn service_request(source_node: NodeId, target_service: u16, source_stage: StageId, packet: Packet) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            source_node,
            target_node: String::new(),
            target_service,
            target_stage: 0,
            source_stage,
            account_id: 0,
            packet,
        }
    }

    /// The reply to `request`, sent from `source_node`/`source_stage`.
    pub fn reply_to(request: &Envelope, source_node: NodeId, source_stage: StageId, packet: Packet) -> Self {
        Self {
            kind: EnvelopeKind::Reply,
            source_node,
            target_node: request.source_node.clone(),
            target_service: 0,
            target_stage: request.source_stage,
            source_stage,
            account_id: request.account_id,
            packet,
        }
    }

    /// Encode to a full frame, length prefix included. The inner payload is
    /// compressed above `threshold` bytes.
    pub fn encode(&self, threshold: usize) -> Result<Vec<u8>, FrameError> {
        if self.packet.msg_id.is_empty() || self.packet.msg_id.len() > u8::MAX as usize {
            return Err(FrameError::BadMsgId(self.packet.msg_id.len()));
        }
        let (original_size, payload) = compression::maybe_compress(&self.packet.payload, threshold);
        let mut body = Vec::with_capacity(64 + self.packet.msg_id.len() + payload.len());
        codec::write_u8(&mut body, self.kind as u8);
        codec::write_short_str(&mut body, &self.source_node).map_err(|_| FrameError::Malformed("source node id exceeds 255 bytes".into()))?;
        codec::write_short_str(&mut body, &self.target_node).map_err(|_| FrameError::Malformed("target node id exceeds 255 bytes".into()))?;
        codec::write_u16(&mut body, self.target_service);
        codec::write_i64(&mut body, self.target_stage);
        codec::write_i64(&mut body, self.source_stage);
        codec::write_i64(&mut body, self.account_id);
        codec::write_u8(&mut body, self.packet.msg_id.len() as u8);
        body.extend_from_slice(self.packet.msg_id.as_bytes());
        codec::write_u16(&mut body, self.packet.msg_seq);
        codec::write_i64(&mut body, self.packet.stage_id);
        codec::write_u16(&mut body, self.packet.error_code);
        codec::write_i32(&mut body, original_size);
        body.extend_from_slice(&payload);

        let mut framed = Vec::with_capacity(frame::LENGTH_PREFIX + body.len());
        codec::write_u32(&mut framed, body.len() as u32);
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    /// Decode a frame body (the bytes after the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        let mut start = 0;
        let kind = match codec::read_u8(&mut start, body).map_err(malformed)? {
            0 => EnvelopeKind::Request,
            1 => EnvelopeKind::Reply,
            other => return Err(FrameError::Malformed(format!("unknown envelope kind {}", other))),
        };
        let source_node = codec::read_short_str(&mut start, body).map_err(malformed)?;
        let target_node = codec::read_short_str(&mut start, body).map_err(malformed)?;
        let target_service = codec::read_u16(&mut start, body).map_err(malformed)?;
        let target_stage = codec::read_i64(&mut start, body).map_err(malformed)?;
        let source_stage = codec::read_i64(&mut start, body).map_err(malformed)?;
        let account_id = codec::read_i64(&mut start, body).map_err(malformed)?;
        let msg_id = frame::decode_msg_id(&mut start, body)?;
        let msg_seq = codec::read_u16(&mut start, body).map_err(malformed)?;
        let stage_id = codec::read_i64(&mut start, body).map_err(malformed)?;
        let error_code = codec::read_u16(&mut start, body).map_err(malformed)?;
        let original_size = codec::read_i32(&mut start, body).map_err(malformed)?;
        let payload = compression::maybe_decompress(original_size, body[start..].to_vec())?;
        Ok(Self {
            kind,
            source_node,
            target_node,
            target_service,
            target_stage,
            source_stage,
            account_id,
            packet: Packet {
                msg_id,
                msg_seq,
                stage_id,
                error_code,
                payload,
            },
        })
    }
}

fn malformed(e: anyhow::Error) -> FrameError {
    FrameError::Malformed(e.to_string())
}
