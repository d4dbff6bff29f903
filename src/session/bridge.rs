// SPDX-License-Identifier: Apache-2.0

//! Inbound packet handling for one session: the authentication protocol,
//! the stage-bind and leave exchanges, heartbeat answers, and routing of
//! joined traffic into the bound stage's queue.

use super::{
    write_packet,
    SessionState,
};
use crate::{
    error::ErrorCode,
    packet::{
        codec,
        ConnectStageMsg,
        JoinRequest,
        Packet,
        RoutePacket,
        MSG_CONNECT_STAGE,
        MSG_LEAVE_STAGE,
        MSG_PING,
        MSG_PONG,
    },
    server::Runtime,
    transport::FrameSink,
    StageId,
};
use log::{
    debug,
    info,
    warn,
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::sync::oneshot;

/// What the session loop should do after one inbound packet.
pub(crate) enum Flow {
    Continue,
    Close(u16),
}

/// Handle one decoded client packet.
pub(crate) async fn handle_inbound(
    runtime: &Arc<Runtime>,
    state: &mut SessionState,
    sink: &mut FrameSink,
    packet: Packet,
) -> Flow {
    // heartbeats flow in any state
    if packet.msg_id == MSG_PING {
        return match write_packet(runtime, sink, Packet::new(MSG_PONG, Vec::new())).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Close(ErrorCode::Disconnected.code()),
        };
    }
    if packet.msg_id == MSG_PONG {
        return Flow::Continue;
    }
    // the upper sequence range belongs to server-initiated requests, so
    // anything carrying it is a reply; stragglers are dropped in the cache
    if packet.msg_seq >= super::SERVER_SEQ_LO {
        state.cache.complete(packet.msg_seq, packet);
        return Flow::Continue;
    }
    if packet.msg_id == MSG_CONNECT_STAGE {
        return handle_connect_stage(runtime, state, sink, packet).await;
    }

    match state.account {
        None => {
            if packet.msg_seq > 0 && packet.msg_id == runtime.cfg.authenticate_message_id {
                handle_authenticate(runtime, state, sink, packet).await
            } else {
                warn!(
                    "session {} sent {} before authenticating",
                    state.session_id, packet.msg_id
                );
                if packet.msg_seq > 0 {
                    reply_or_close(
                        runtime,
                        sink,
                        Packet::error_reply(packet.msg_id, packet.msg_seq, ErrorCode::Unauthenticated.code()),
                    )
                    .await
                    .ok();
                }
                Flow::Close(ErrorCode::Unauthenticated.code())
            }
        }
        Some(account_id) => {
            if packet.msg_id == MSG_LEAVE_STAGE {
                return handle_leave(runtime, state, sink, packet, account_id).await;
            }
            if packet.is_system() {
                if packet.msg_seq > 0 {
                    reply_or_close(
                        runtime,
                        sink,
                        Packet::error_reply(packet.msg_id, packet.msg_seq, ErrorCode::BadRequest.code()),
                    )
                    .await
                    .ok();
                }
                return Flow::Continue;
            }
            let msg_seq = packet.msg_seq;
            let msg_id = packet.msg_id.clone();
            let outcome = match state.current_stage.and_then(|stage_id| runtime.stages.get(stage_id)) {
                Some(handle) => handle
                    .post(RoutePacket::Client {
                        session_id: state.session_id,
                        account_id,
                        packet,
                    })
                    .map_err(|e| e.error_code()),
                None => Err(ErrorCode::StageNotFound),
            };
            if let Err(code) = outcome {
                if msg_seq > 0 {
                    if reply_or_close(runtime, sink, Packet::error_reply(msg_id, msg_seq, code.code()))
                        .await
                        .is_err()
                    {
                        return Flow::Close(ErrorCode::Disconnected.code());
                    }
                } else {
                    debug!("session {} push {} dropped: {:?}", state.session_id, msg_id, code);
                }
            }
            Flow::Continue
        }
    }
}

/// Bind the session to a stage, creating the stage when it does not exist.
async fn handle_connect_stage(
    runtime: &Arc<Runtime>,
    state: &mut SessionState,
    sink: &mut FrameSink,
    packet: Packet,
) -> Flow {
    let msg = match ConnectStageMsg::decode(&packet.payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("session {} sent a malformed stage bind: {}", state.session_id, e);
            return reply_flow(
                runtime,
                sink,
                Packet::error_reply(packet.msg_id, packet.msg_seq, ErrorCode::BadRequest.code()),
            )
            .await;
        }
    };
    let stage_type = if msg.stage_type.is_empty() {
        runtime.cfg.default_stage_type.clone()
    } else {
        msg.stage_type
    };

    let bound = if msg.stage_id != 0 {
        match runtime.stages.get(msg.stage_id) {
            Some(handle) if handle.stage_type == stage_type => Ok(msg.stage_id),
            Some(_) => Err(ErrorCode::WrongStageType.code()),
            None => create_stage_for_session(runtime, &stage_type, Some(msg.stage_id)).await,
        }
    } else {
        create_stage_for_session(runtime, &stage_type, None).await
    };

    match bound {
        Ok(stage_id) => {
            state.current_stage = Some(stage_id);
            let mut payload = Vec::with_capacity(8);
            codec::write_i64(&mut payload, stage_id);
            let reply = Packet {
                msg_id: packet.msg_id,
                msg_seq: packet.msg_seq,
                stage_id,
                error_code: 0,
                payload,
            };
            reply_flow(runtime, sink, reply).await
        }
        Err(code) => {
            reply_flow(
                runtime,
                sink,
                Packet::error_reply(packet.msg_id, packet.msg_seq, code),
            )
            .await
        }
    }
}

async fn create_stage_for_session(
    runtime: &Arc<Runtime>,
    stage_type: &str,
    desired: Option<StageId>,
) -> Result<StageId, u16> {
    if stage_type.is_empty() {
        return Err(ErrorCode::StageNotFound.code());
    }
    runtime
        .stages
        .create_stage(runtime, stage_type, desired, Packet::new(MSG_CONNECT_STAGE, Vec::new()))
        .await
}

/// Forward the authentication request to the target stage's join path and
/// wait for the outcome before reading further frames.
async fn handle_authenticate(
    runtime: &Arc<Runtime>,
    state: &mut SessionState,
    sink: &mut FrameSink,
    packet: Packet,
) -> Flow {
    let target = if packet.stage_id != 0 {
        packet.stage_id
    } else {
        state.current_stage.unwrap_or(0)
    };
    let handle = if target != 0 {
        match runtime.stages.get(target) {
            Some(handle) => Ok((target, handle)),
            None => match create_stage_for_session(runtime, &runtime.cfg.default_stage_type.clone(), Some(target)).await
            {
                Ok(stage_id) => runtime
                    .stages
                    .get(stage_id)
                    .map(|handle| (stage_id, handle))
                    .ok_or_else(|| ErrorCode::StageNotFound.code()),
                Err(code) => Err(code),
            },
        }
    } else {
        match create_stage_for_session(runtime, &runtime.cfg.default_stage_type.clone(), None).await {
            Ok(stage_id) => runtime
                .stages
                .get(stage_id)
                .map(|handle| (stage_id, handle))
                .ok_or_else(|| ErrorCode::StageNotFound.code()),
            Err(code) => Err(code),
        }
    };
    let (stage_id, handle) = match handle {
        Ok(pair) => pair,
        Err(code) => {
            reply_or_close(
                runtime,
                sink,
                Packet::error_reply(packet.msg_id, packet.msg_seq, code),
            )
            .await
            .ok();
            return Flow::Close(code);
        }
    };

    let msg_id = packet.msg_id.clone();
    let msg_seq = packet.msg_seq;
    let (responder, rx) = oneshot::channel();
    let join = JoinRequest {
        session_id: state.session_id,
        packet,
        responder,
    };
    if let Err(e) = handle.post(RoutePacket::Join(join)) {
        let code = e.error_code().code();
        reply_or_close(runtime, sink, Packet::error_reply(msg_id, msg_seq, code))
            .await
            .ok();
        return Flow::Close(code);
    }
    let timeout = Duration::from_millis(runtime.cfg.request_timeout_ms);
    let outcome = match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) | Err(_) => {
            warn!("session {} authentication timed out", state.session_id);
            reply_or_close(
                runtime,
                sink,
                Packet::error_reply(msg_id, msg_seq, ErrorCode::Timeout.code()),
            )
            .await
            .ok();
            return Flow::Close(ErrorCode::Timeout.code());
        }
    };
    if outcome.error_code != 0 {
        info!(
            "session {} authentication rejected with {}",
            state.session_id, outcome.error_code
        );
        reply_or_close(
            runtime,
            sink,
            Packet::error_reply(msg_id, msg_seq, outcome.error_code),
        )
        .await
        .ok();
        return Flow::Close(outcome.error_code);
    }
    state.account = Some(outcome.account_id);
    state.current_stage = Some(stage_id);
    info!(
        "session {} authenticated as account {} in stage {}",
        state.session_id, outcome.account_id, stage_id
    );
    let reply = Packet {
        msg_id,
        msg_seq,
        stage_id,
        error_code: 0,
        payload: Vec::new(),
    };
    reply_flow(runtime, sink, reply).await
}

async fn handle_leave(
    runtime: &Arc<Runtime>,
    state: &mut SessionState,
    sink: &mut FrameSink,
    packet: Packet,
    account_id: crate::AccountId,
) -> Flow {
    let msg_id = packet.msg_id;
    let msg_seq = packet.msg_seq;
    let code = match state.current_stage.and_then(|stage_id| runtime.stages.get(stage_id)) {
        Some(handle) => {
            let (responder, rx) = oneshot::channel();
            match handle.post(RoutePacket::Leave {
                account_id,
                reason: crate::stage::leave_reason::VOLUNTARY,
                responder: Some(responder),
            }) {
                Ok(()) => {
                    let timeout = Duration::from_millis(runtime.cfg.request_timeout_ms);
                    match tokio::time::timeout(timeout, rx).await {
                        Ok(Ok(code)) => code,
                        Ok(Err(_)) | Err(_) => ErrorCode::Timeout.code(),
                    }
                }
                Err(e) => e.error_code().code(),
            }
        }
        None => ErrorCode::StageNotFound.code(),
    };
    if code == 0 {
        state.current_stage = None;
    }
    if msg_seq > 0 {
        return reply_flow(runtime, sink, Packet::error_reply(msg_id, msg_seq, code)).await;
    }
    Flow::Continue
}

async fn reply_or_close(runtime: &Arc<Runtime>, sink: &mut FrameSink, packet: Packet) -> anyhow::Result<()> {
    write_packet(runtime, sink, packet).await
}

async fn reply_flow(runtime: &Arc<Runtime>, sink: &mut FrameSink, packet: Packet) -> Flow {
    if packet.msg_seq == 0 {
        return Flow::Continue;
    }
    match write_packet(runtime, sink, packet).await {
        Ok(()) => Flow::Continue,
        Err(_) => Flow::Close(ErrorCode::Disconnected.code()),
    }
}
