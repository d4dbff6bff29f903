// SPDX-License-Identifier: Apache-2.0

//! The per-stage actor registry.
//!
//! Lives inside the stage runner and is only ever touched by the stage's
//! own loop, so it needs no locking. Connection state and the disconnect
//! timestamp are tracked here to support lobby-style eviction policies
//! scanned from stage timers.

use super::Actor;
use crate::{
    sender::ActorSender,
    AccountId,
    SessionId,
};
use std::collections::HashMap;
use tokio::time::Instant;

/// One joined account.
pub(crate) struct ActorEntry<A: Actor> {
    pub actor: A,
    pub sender: ActorSender,
    pub session_id: SessionId,
    pub connected: bool,
    pub disconnected_at: Option<Instant>,
}

/// Account → actor map for one stage.
pub(crate) struct ActorRegistry<A: Actor> {
    actors: HashMap<AccountId, ActorEntry<A>>,
}

impl<A: Actor> ActorRegistry<A> {
    pub fn new() -> Self {
        Self { actors: HashMap::new() }
    }

    pub fn insert(&mut self, account_id: AccountId, entry: ActorEntry<A>) {
        self.actors.insert(account_id, entry);
    }

    pub fn remove(&mut self, account_id: AccountId) -> Option<ActorEntry<A>> {
        self.actors.remove(&account_id)
    }

    pub fn get_mut(&mut self, account_id: AccountId) -> Option<&mut ActorEntry<A>> {
        self.actors.get_mut(&account_id)
    }

    pub fn contains(&self, account_id: AccountId) -> bool {
        self.actors.contains_key(&account_id)
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (AccountId, ActorEntry<A>)> + '_ {
        self.actors.drain()
    }
}
