// SPDX-License-Identifier: Apache-2.0

//! The Api controller host: a msg-id keyed registry of stateless handlers
//! dispatched with unbounded concurrency.
//!
//! Controllers are cloneable trait objects; every dispatch runs on its own
//! task against a fresh clone, so a controller must carry no per-request
//! state (shared state belongs behind an `Arc` inside the controller).

use crate::{
    packet::{
        envelope::Envelope,
        Packet,
    },
    sender::ApiSender,
    server::Runtime,
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use dyn_clone::DynClone;
use log::warn;
use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
};

/// A stateless message handler hosted on an Api node.
#[async_trait]
pub trait ApiController: DynClone + Send + Sync + 'static {
    /// Handle one inbound packet. Replies go through the sender.
    async fn handle(&self, packet: Packet, sender: ApiSender);
}

dyn_clone::clone_trait_object!(ApiController);

/// Adapter turning an async closure into an [`ApiController`].
#[derive(Clone)]
pub(crate) struct FnController<F> {
    handler: F,
}

impl<F> FnController<F> {
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F, Fut> ApiController for FnController<F>
where
    F: Fn(Packet, ApiSender) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, packet: Packet, sender: ApiSender) {
        (self.handler)(packet, sender).await;
    }
}

/// The registry of controllers served by this node.
pub(crate) struct ApiHost {
    handlers: ArcSwap<HashMap<String, Box<dyn ApiController>>>,
}

impl ApiHost {
    pub fn new() -> Self {
        Self {
            handlers: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Register a controller under a msg id. Bootstrap-time only; the map
    /// is replaced wholesale so in-flight dispatches keep their snapshot.
    pub fn register(&self, msg_id: &str, controller: Box<dyn ApiController>) {
        let mut handlers = (**self.handlers.load()).clone();
        handlers.insert(msg_id.to_string(), controller);
        self.handlers.store(Arc::new(handlers));
    }

    /// Dispatch an inbound envelope to its controller on a fresh task.
    pub fn dispatch(&self, runtime: Arc<Runtime>, env: Envelope) {
        let controller = self.handlers.load().get(&env.packet.msg_id).cloned();
        let controller = match controller {
            Some(controller) => controller,
            None => {
                warn!("no controller registered for {}", env.packet.msg_id);
                runtime.reply_error_envelope(&env, crate::ErrorCode::BadRequest);
                return;
            }
        };
        let msg_seq = env.packet.msg_seq;
        let msg_id = env.packet.msg_id.clone();
        let sender = ApiSender::new(
            runtime,
            env.source_node,
            env.source_stage,
            env.account_id,
            msg_seq,
            msg_id.clone(),
        );
        let packet = env.packet;
        tokio::spawn(async move {
            controller.handle(packet, sender.clone()).await;
            if msg_seq > 0 && !sender.replied() {
                warn!("controller for {} finished without replying", msg_id);
            }
        });
    }
}
