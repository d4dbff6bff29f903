// SPDX-License-Identifier: Apache-2.0

//! Routing: resolving envelopes to local stage queues, Api controllers, or
//! peer links.
//!
//! The decision table:
//! - target node is this node and the stage exists → post to its queue;
//! - target node is this node and the stage is missing → `StageNotFound`
//!   (error reply for requests, logged drop for pushes);
//! - target node is another node → hand to its peer link;
//! - target is a service id → pick a live Api node serving it.

use crate::{
    error::ErrorCode,
    packet::{
        codec,
        envelope::{
            Envelope,
            EnvelopeKind,
        },
        CreateStageMsg,
        Packet,
        RoutePacket,
        MSG_CREATE_STAGE,
    },
    server::Runtime,
    stage::pool::StageStats,
    NodeId,
    StageId,
};
use log::{
    debug,
    warn,
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::sync::oneshot;

impl Runtime {
    /// Deliver a fire-and-forget envelope (push or reply), local or remote.
    /// Undeliverable envelopes are dropped with a log line.
    pub(crate) fn send_envelope(self: &Arc<Self>, env: Envelope) {
        if env.target_node == self.node_id {
            self.dispatch_envelope(env);
            return;
        }
        match self.cluster.link(&env.target_node) {
            Some(link) => {
                if let Err(env) = link.send(env) {
                    debug!(
                        "dropping {} for unreachable node {}",
                        env.packet.msg_id, env.target_node
                    );
                }
            }
            None => warn!("dropping {} for unknown node {}", env.packet.msg_id, env.target_node),
        }
    }

    /// Consume an envelope addressed to this node: resolve replies against
    /// the pending table, run system messages, or post to the target stage.
    pub(crate) fn dispatch_envelope(self: &Arc<Self>, env: Envelope) {
        if env.target_node != self.node_id && !env.target_node.is_empty() {
            warn!(
                "dropping misrouted envelope for {} (this is {})",
                env.target_node, self.node_id
            );
            return;
        }
        match env.kind {
            EnvelopeKind::Reply => match self.cluster.link(&env.source_node) {
                Some(link) => {
                    link.cache.complete(env.packet.msg_seq, env.packet);
                }
                None => warn!("dropping reply from unknown node {}", env.source_node),
            },
            EnvelopeKind::Request => {
                if env.packet.msg_id == MSG_CREATE_STAGE {
                    self.handle_create_stage(env);
                    return;
                }
                if env.target_service != 0 {
                    if self.cfg.service_id == Some(env.target_service) {
                        self.api.dispatch(self.clone(), env);
                    } else {
                        warn!(
                            "dropping request for service {} not served here",
                            env.target_service
                        );
                        self.reply_error_envelope(&env, ErrorCode::BadRequest);
                    }
                    return;
                }
                match self.stages.get(env.target_stage) {
                    Some(handle) => {
                        let item = RoutePacket::Stage {
                            source_node: env.source_node.clone(),
                            source_stage: env.source_stage,
                            packet: env.packet.clone(),
                        };
                        if let Err(e) = handle.post(item) {
                            warn!("stage {} refused post: {}", env.target_stage, e);
                            self.reply_error_envelope(&env, e.error_code());
                        }
                    }
                    None => {
                        debug!("stage {} not found for {}", env.target_stage, env.packet.msg_id);
                        self.reply_error_envelope(&env, ErrorCode::StageNotFound);
                    }
                }
            }
        }
    }

    /// Reply to a request envelope with a bare error code; pushes are
    /// logged and dropped.
    pub(crate) fn reply_error_envelope(self: &Arc<Self>, request: &Envelope, code: ErrorCode) {
        if request.packet.msg_seq == 0 {
            return;
        }
        let packet = Packet::error_reply(request.packet.msg_id.clone(), request.packet.msg_seq, code.code());
        let reply = Envelope::reply_to(request, self.node_id.clone(), request.target_stage, packet);
        self.send_envelope(reply);
    }

    /// Drive the stage factory for an inbound create request and reply
    /// with the outcome. Runs off the dispatch path because creation
    /// awaits the user's creation gate.
    fn handle_create_stage(self: &Arc<Self>, env: Envelope) {
        let runtime = self.clone();
        tokio::spawn(async move {
            let outcome = match CreateStageMsg::decode(&env.packet.payload) {
                Ok(msg) => {
                    let desired = if env.target_stage != 0 { Some(env.target_stage) } else { None };
                    let creation = Packet::new(MSG_CREATE_STAGE, msg.payload);
                    runtime
                        .stages
                        .create_stage(&runtime, &msg.stage_type, desired, creation)
                        .await
                }
                Err(e) => {
                    warn!("malformed create request: {}", e);
                    Err(ErrorCode::BadRequest.code())
                }
            };
            if env.packet.msg_seq == 0 {
                return;
            }
            let packet = match outcome {
                Ok(stage_id) => {
                    let mut payload = Vec::with_capacity(8);
                    codec::write_i64(&mut payload, stage_id);
                    Packet {
                        msg_id: env.packet.msg_id.clone(),
                        msg_seq: env.packet.msg_seq,
                        stage_id,
                        error_code: 0,
                        payload,
                    }
                }
                Err(code) => Packet::error_reply(env.packet.msg_id.clone(), env.packet.msg_seq, code),
            };
            let reply = Envelope::reply_to(&env, runtime.node_id.clone(), 0, packet);
            runtime.send_envelope(reply);
        });
    }

    /// Request/reply against a stage on any node. Resolves with exactly
    /// one packet; failures arrive as error packets.
    pub(crate) async fn stage_request(
        self: &Arc<Self>,
        target_node: NodeId,
        target_stage: StageId,
        source_stage: StageId,
        packet: Packet,
        timeout: Duration,
    ) -> Packet {
        let msg_id = packet.msg_id.clone();
        let link = match self.cluster.link(&target_node) {
            Some(link) => link,
            None => {
                warn!("request {} for unknown node {}", msg_id, target_node);
                return Packet::error_reply(msg_id, 0, ErrorCode::NodeUnreachable.code());
            }
        };
        let (tx, rx) = oneshot::channel();
        let seq = match link.cache.register(&msg_id, tx, timeout) {
            Ok(seq) => seq,
            Err(e) => {
                warn!("request table for {} full: {}", target_node, e);
                return Packet::error_reply(msg_id, 0, ErrorCode::Overloaded.code());
            }
        };
        let env = Envelope {
            kind: EnvelopeKind::Request,
            source_node: self.node_id.clone(),
            target_node,
            target_service: 0,
            target_stage,
            source_stage,
            account_id: 0,
            packet: packet.with_seq(seq),
        };
        if link.send(env).is_err() {
            link.cache.fail(seq, ErrorCode::NodeUnreachable);
        }
        match rx.await {
            Ok(reply) => reply,
            Err(_) => Packet::error_reply(msg_id, seq, ErrorCode::Disconnected.code()),
        }
    }

    /// Request/reply against any live Api node serving `service_id`.
    pub(crate) async fn api_request(
        self: &Arc<Self>,
        service_id: u16,
        source_stage: StageId,
        packet: Packet,
        timeout: Duration,
    ) -> Packet {
        let msg_id = packet.msg_id.clone();
        let node = match self.cluster.select_api(service_id) {
            Some(node) => node,
            None => {
                warn!("no live node for service {}", service_id);
                return Packet::error_reply(msg_id, 0, ErrorCode::NodeUnreachable.code());
            }
        };
        let link = match self.cluster.link(&node) {
            Some(link) => link,
            None => return Packet::error_reply(msg_id, 0, ErrorCode::NodeUnreachable.code()),
        };
        let (tx, rx) = oneshot::channel();
        let seq = match link.cache.register(&msg_id, tx, timeout) {
            Ok(seq) => seq,
            Err(_) => return Packet::error_reply(msg_id, 0, ErrorCode::Overloaded.code()),
        };
        let env = Envelope {
            kind: EnvelopeKind::Request,
            source_node: self.node_id.clone(),
            target_node: node,
            target_service: service_id,
            target_stage: 0,
            source_stage,
            account_id: 0,
            packet: packet.with_seq(seq),
        };
        if link.send(env).is_err() {
            link.cache.fail(seq, ErrorCode::NodeUnreachable);
        }
        match rx.await {
            Ok(reply) => reply,
            Err(_) => Packet::error_reply(msg_id, seq, ErrorCode::Disconnected.code()),
        }
    }

    /// Fire-and-forget packet to any live Api node serving `service_id`.
    pub(crate) fn api_send(self: &Arc<Self>, service_id: u16, source_stage: StageId, mut packet: Packet) {
        packet.msg_seq = 0;
        let node = match self.cluster.select_api(service_id) {
            Some(node) => node,
            None => {
                debug!("dropping {}: no live node for service {}", packet.msg_id, service_id);
                return;
            }
        };
        let env = Envelope {
            kind: EnvelopeKind::Request,
            source_node: self.node_id.clone(),
            target_node: node,
            target_service: service_id,
            target_stage: 0,
            source_stage,
            account_id: 0,
            packet,
        };
        self.send_envelope(env);
    }

    /// Queue depth and drain state for every live stage.
    pub(crate) fn stage_stats(&self) -> Vec<StageStats> {
        self.stages.stats()
    }
}
