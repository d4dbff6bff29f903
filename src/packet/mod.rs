// SPDX-License-Identifier: Apache-2.0

//! Packet types: the client-facing [`Packet`] envelope, the internal
//! [`RoutePacket`] delivered to stage loops, and the reserved system
//! message ids.

use crate::{
    AccountId,
    NodeId,
    SessionId,
    StageId,
    TimerId,
};
use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::oneshot;

pub mod codec;
pub mod compression;
pub mod envelope;
pub mod frame;

/// Reserved prefix for framework message ids; user msg ids must not start
/// with it.
pub const SYSTEM_PREFIX: char = '$';
/// Client request binding the session to a stage, creating it when absent.
pub const MSG_CONNECT_STAGE: &str = "$ConnectStage";
/// Client request leaving the joined stage.
pub const MSG_LEAVE_STAGE: &str = "$LeaveStage";
/// S2S request driving the stage factory on a Play node.
pub const MSG_CREATE_STAGE: &str = "$CreateStage";
/// Heartbeat probe, sent by whichever side has been idle too long.
pub const MSG_PING: &str = "$Ping";
/// Heartbeat answer.
pub const MSG_PONG: &str = "$Pong";

/// The envelope exchanged with clients. `msg_seq == 0` marks a push;
/// a positive `msg_seq` marks a request expecting a reply with the same
/// sequence. Payload bytes are opaque to the framework.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    /// Short UTF-8 message name, at most 255 bytes.
    pub msg_id: String,
    /// 0 for push, otherwise the request correlation sequence.
    pub msg_seq: u16,
    /// The stage the message addresses, when relevant.
    pub stage_id: StageId,
    /// 0 on success; non-zero outcomes use [`crate::ErrorCode`] or
    /// application-defined codes.
    pub error_code: u16,
    /// Opaque payload, uncompressed in memory.
    pub payload: Vec<u8>,
}

impl Packet {
    /// A push packet (`msg_seq = 0`).
    pub fn new<T: Into<String>>(msg_id: T, payload: Vec<u8>) -> Self {
        Self {
            msg_id: msg_id.into(),
            payload,
            ..Default::default()
        }
    }

    /// A reply to `request`, carrying its sequence and stage.
    pub fn reply_to(request: &Packet, payload: Vec<u8>) -> Self {
        Self {
            msg_id: request.msg_id.clone(),
            msg_seq: request.msg_seq,
            stage_id: request.stage_id,
            error_code: 0,
            payload,
        }
    }

    /// An error reply with an empty payload.
    pub fn error_reply<T: Into<String>>(msg_id: T, msg_seq: u16, error_code: u16) -> Self {
        Self {
            msg_id: msg_id.into(),
            msg_seq,
            error_code,
            ..Default::default()
        }
    }

    /// Whether this packet is a push (fire-and-forget).
    pub fn is_push(&self) -> bool {
        self.msg_seq == 0
    }

    /// Whether the msg id is reserved for the framework.
    pub fn is_system(&self) -> bool {
        self.msg_id.starts_with(SYSTEM_PREFIX)
    }

    /// Builder-style sequence assignment.
    pub fn with_seq(mut self, msg_seq: u16) -> Self {
        self.msg_seq = msg_seq;
        self
    }

    /// Builder-style stage assignment.
    pub fn with_stage(mut self, stage_id: StageId) -> Self {
        self.stage_id = stage_id;
        self
    }
}

/// Payload of [`MSG_CONNECT_STAGE`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectStageMsg {
    /// The stage to bind to; 0 asks the node to issue a fresh id.
    pub stage_id: StageId,
    /// The stage type; empty falls back to the configured default.
    pub stage_type: String,
}

impl ConnectStageMsg {
    /// Encode to payload bytes. Fails when the stage type exceeds the
    /// 255-byte short-string limit.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(9 + self.stage_type.len());
        codec::write_i64(&mut buf, self.stage_id);
        codec::write_short_str(&mut buf, &self.stage_type)?;
        Ok(buf)
    }

    /// Decode from payload bytes.
    pub fn decode(payload: &[u8]) -> anyhow::Result<Self> {
        let mut start = 0;
        let stage_id = codec::read_i64(&mut start, payload)?;
        let stage_type = codec::read_short_str(&mut start, payload)?;
        Ok(Self { stage_id, stage_type })
    }
}

/// Payload of [`MSG_CREATE_STAGE`]: the stage type followed by the user
/// creation payload handed to `on_create`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateStageMsg {
    /// The registered stage type to construct.
    pub stage_type: String,
    /// Opaque creation payload.
    pub payload: Vec<u8>,
}

impl CreateStageMsg {
    /// Encode to payload bytes. Fails when the stage type exceeds the
    /// 255-byte short-string limit.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(1 + self.stage_type.len() + self.payload.len());
        codec::write_short_str(&mut buf, &self.stage_type)?;
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode from payload bytes.
    pub fn decode(payload: &[u8]) -> anyhow::Result<Self> {
        let mut start = 0;
        let stage_type = codec::read_short_str(&mut start, payload)?;
        Ok(Self {
            stage_type,
            payload: payload[start..].to_vec(),
        })
    }
}

/// A stage mutation stored for later execution inside the stage loop
/// (timer callbacks). The stage is passed type-erased; the generic wrapper
/// that produced the task downcasts it back.
pub(crate) type StageTask = Arc<dyn for<'a> Fn(&'a mut (dyn Any + Send)) -> BoxFuture<'a, ()> + Send + Sync>;

/// A one-shot stage mutation carrying an off-loop result back into the
/// stage loop (`async_block` post step, request callbacks).
pub(crate) type StageTaskOnce =
    Box<dyn for<'a> FnOnce(&'a mut (dyn Any + Send), Box<dyn Any + Send>) -> BoxFuture<'a, ()> + Send>;

/// Outcome of a join/auth exchange, reported back to the session task.
#[derive(Clone, Copy, Debug)]
pub struct JoinOutcome {
    /// 0 on success.
    pub error_code: u16,
    /// The authenticated account on success.
    pub account_id: AccountId,
}

impl JoinOutcome {
    pub(crate) fn failure(error_code: u16) -> Self {
        Self {
            error_code,
            account_id: 0,
        }
    }
}

/// Authentication request forwarded from a session to a stage's join path.
pub(crate) struct JoinRequest {
    pub session_id: SessionId,
    pub packet: Packet,
    pub responder: oneshot::Sender<JoinOutcome>,
}

/// The internal envelope delivered to a stage's queue.
pub(crate) enum RoutePacket {
    /// A decoded client packet from a joined session.
    Client {
        session_id: SessionId,
        account_id: AccountId,
        packet: Packet,
    },
    /// A stage-level packet from another stage or an Api controller.
    Stage {
        source_node: NodeId,
        source_stage: StageId,
        packet: Packet,
    },
    /// Authentication/join exchange.
    Join(JoinRequest),
    /// Remove an actor, voluntarily or by policy.
    Leave {
        account_id: AccountId,
        reason: u16,
        responder: Option<oneshot::Sender<u16>>,
    },
    /// The actor's session dropped; the actor lingers disconnected. The
    /// session id guards against a stale disconnect arriving after the
    /// account was rebound to a newer session.
    ActorDisconnected {
        account_id: AccountId,
        session_id: SessionId,
    },
    /// A timer fired.
    Timer { timer_id: TimerId, task: StageTask },
    /// An off-loop computation finished; run its post step.
    AsyncResult {
        task: StageTaskOnce,
        value: Box<dyn Any + Send>,
    },
    /// First item queued after a successful create.
    PostCreate,
    /// Destroy the stage.
    Close,
}

impl RoutePacket {
    /// Short name for log lines.
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            RoutePacket::Client { .. } => "client",
            RoutePacket::Stage { .. } => "stage",
            RoutePacket::Join(_) => "join",
            RoutePacket::Leave { .. } => "leave",
            RoutePacket::ActorDisconnected { .. } => "disconnected",
            RoutePacket::Timer { .. } => "timer",
            RoutePacket::AsyncResult { .. } => "async-result",
            RoutePacket::PostCreate => "post-create",
            RoutePacket::Close => "close",
        }
    }
}
