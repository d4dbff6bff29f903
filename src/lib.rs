// SPDX-License-Identifier: Apache-2.0

//! A distributed real-time game server framework.
//!
//! A deployment is a fleet of cooperating nodes: **Play** nodes terminate
//! client connections and host stateful rooms (*stages*) populated by
//! per-user *actors*; **Api** nodes host stateless controllers. An
//! internal server-to-server fabric routes envelopes between nodes, so a
//! stage can request another stage — or an Api service — anywhere in the
//! fleet and await exactly one outcome.
//!
//! Each stage runs a single-writer event loop: handlers for one stage
//! never overlap, so user code holds plain mutable state without locks.
//! Clients connect over TCP, TCP-TLS, WebSocket, or WSS carrying
//! length-prefixed binary packets with opaque payloads.
//!
//! ```no_run
//! use playhouse::*;
//! use async_trait::async_trait;
//!
//! struct Echo {
//!     sender: StageSender<Echo>,
//! }
//! struct Player {
//!     sender: ActorSender,
//! }
//! impl Actor for Player {}
//!
//! #[async_trait]
//! impl Stage for Echo {
//!     type Actor = Player;
//!     async fn on_authenticate(&mut self, packet: &Packet) -> Result<AccountId, u16> {
//!         Ok(i64::from_le_bytes(packet.payload[..8].try_into().unwrap()))
//!     }
//!     async fn on_dispatch(&mut self, actor: &mut Player, packet: Packet) {
//!         actor.sender.reply(Packet::new("EchoReply", packet.payload));
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut cfg = ServerConfig::new("play-1");
//!     cfg.client_bind = Some("0.0.0.0:7777".parse()?);
//!     cfg.default_stage_type = "echo".into();
//!     let server = PlayServerBuilder::new(cfg)
//!         .register_stage::<Echo, _, _>(
//!             "echo",
//!             |sender| Echo { sender },
//!             |sender| Player { sender },
//!         )
//!         .start()
//!         .await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Identifies one server process in the fleet.
pub type NodeId = String;
/// Logical id of a load-balanced Api service.
pub type ServiceId = u16;
/// Identifies a stage; unique within its node.
pub type StageId = i64;
/// Identifies an authenticated account; unique within a stage.
pub type AccountId = i64;
/// Identifies one client connection on its node.
pub type SessionId = i64;
/// Identifies a scheduled timer; unique within its node.
pub type TimerId = i64;

pub mod api;
pub mod config;
pub mod connector;
pub mod error;
pub mod packet;
pub mod request;
pub mod sender;
pub mod stage;
pub mod timer;

pub(crate) mod cluster;
pub(crate) mod router;
pub(crate) mod server;
pub(crate) mod session;
pub(crate) mod transport;

pub use api::ApiController;
pub use config::{
    ConnectorConfig,
    PeerConfig,
    ServerConfig,
};
pub use connector::Connector;
pub use error::{
    ErrorCode,
    FrameError,
};
pub use packet::{
    ConnectStageMsg,
    Packet,
    MSG_CONNECT_STAGE,
    MSG_LEAVE_STAGE,
    MSG_PING,
    MSG_PONG,
};
pub use sender::{
    ActorInfo,
    ActorSender,
    ApiSender,
    StageSender,
};
pub use server::{
    build_runtime,
    PlayServer,
    PlayServerBuilder,
};
pub use stage::{
    leave_reason,
    pool::StageStats,
    Actor,
    Stage,
};
pub use timer::TimerKind;
