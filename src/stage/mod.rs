// SPDX-License-Identifier: Apache-2.0

//! User-facing stage and actor contracts.
//!
//! A stage is a stateful room with a single-writer event loop: at any
//! moment at most one handler of a given stage instance is running, so
//! implementations need no internal locking. An actor is the per-user
//! presence inside a stage, owned and mutated exclusively by that stage's
//! loop.
//!
//! User types are constructed by builders registered per stage type:
//! `fn(StageSender<S>) -> S` and `fn(ActorSender) -> S::Actor`. The sender
//! handed to the builder is the stage's handle onto the framework — replies,
//! pushes, cross-stage requests, timers, and closure.

use crate::{
    packet::Packet,
    AccountId,
};
use async_trait::async_trait;

pub mod pool;
pub mod registry;
pub mod runner;

/// Per-user presence inside a stage.
///
/// The framework tracks identity and connection state; implementors only
/// carry game state. Both hooks run inside the owning stage's loop.
pub trait Actor: Send + 'static {
    /// Runs once, right after the builder produced the actor.
    fn on_create(&mut self) {}
    /// Runs when the actor leaves the stage or the stage is destroyed.
    fn on_destroy(&mut self) {}
}

/// A stateful room hosted on a Play node.
///
/// Every hook executes inside the stage's single-writer loop; awaiting
/// inside a hook suspends this stage only.
#[async_trait]
pub trait Stage: Sized + Send + 'static {
    /// The actor type joined into this stage.
    type Actor: Actor;

    /// Creation gate. A non-zero return refuses the stage: it is never
    /// added to the pool and the creator receives the code as its reply.
    async fn on_create(&mut self, _packet: &Packet) -> u16 {
        0
    }

    /// First item the freshly created stage processes on its own loop.
    async fn on_post_create(&mut self) {}

    /// Resolve the authenticated account behind the session's first
    /// request. Returning an error code closes the session.
    async fn on_authenticate(&mut self, packet: &Packet) -> Result<AccountId, u16>;

    /// Join gate, invoked after authentication with the freshly built
    /// actor. A non-zero return rejects the join and drops the actor.
    async fn on_join_stage(&mut self, _actor: &mut Self::Actor, _packet: &Packet) -> u16 {
        0
    }

    /// Runs once the actor is part of the stage.
    async fn on_post_join_stage(&mut self, _actor: &mut Self::Actor) {}

    /// A packet from a joined actor's session.
    async fn on_dispatch(&mut self, actor: &mut Self::Actor, packet: Packet);

    /// A stage-level packet from another stage or an Api controller.
    async fn on_stage_dispatch(&mut self, _packet: Packet) {}

    /// The actor's session dropped (`connected == false`) or the account
    /// resumed on a new session (`connected == true`).
    async fn on_actor_connection_changed(&mut self, _actor: &mut Self::Actor, _connected: bool) {}

    /// The actor is leaving: voluntarily, kicked, or evicted by policy.
    /// The actor is destroyed right after this returns.
    async fn on_leave_stage(&mut self, _actor: &mut Self::Actor, _reason: u16) {}

    /// The stage is being destroyed. Timers are already cancelled; actors
    /// are destroyed right after this returns.
    async fn on_destroy(&mut self) {}
}

/// Reasons passed to [`Stage::on_leave_stage`].
pub mod leave_reason {
    /// The client asked to leave.
    pub const VOLUNTARY: u16 = 0;
    /// A newer session took over the account.
    pub const DUPLICATE_LOGIN: u16 = crate::ErrorCode::DuplicateLogin as u16;
}
