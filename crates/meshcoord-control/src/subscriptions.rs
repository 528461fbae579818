//! Subscription registry: which clients are bound to which agent
//!
//! Each client identity is bound to at most one agent. Both directions are
//! kept under one lock so a subscriber lookup never sees a half-applied move.

use crate::directory::Origin;
use meshcoord_proto::PeerId;
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

/// A client's binding to an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub agent: PeerId,
    pub origin: Origin,
}

#[derive(Debug, Default)]
struct Bindings {
    by_client: HashMap<PeerId, Subscription>,
    by_agent: HashMap<PeerId, BTreeSet<PeerId>>,
}

impl Bindings {
    fn detach(&mut self, client: &PeerId, agent: &PeerId) {
        if let Some(clients) = self.by_agent.get_mut(agent) {
            clients.remove(client);
            if clients.is_empty() {
                self.by_agent.remove(agent);
            }
        }
    }
}

/// Registry of client → agent bindings
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    bindings: RwLock<Bindings>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `client` to `agent`, replacing any previous binding.
    ///
    /// Returns the replaced subscription.
    pub fn subscribe(&self, client: PeerId, agent: PeerId, origin: Origin) -> Option<Subscription> {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);

        let previous = bindings
            .by_client
            .insert(client, Subscription { agent, origin });
        if let Some(ref prev) = previous {
            if prev.agent != agent {
                bindings.detach(&client, &prev.agent);
            }
        }
        bindings.by_agent.entry(agent).or_default().insert(client);

        tracing::trace!(client_id = %client, agent_id = %agent, "Client subscribed");
        previous
    }

    /// Drop a client's binding regardless of who created it
    pub fn unsubscribe(&self, client: &PeerId) -> Option<Subscription> {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);

        let previous = bindings.by_client.remove(client)?;
        bindings.detach(client, &previous.agent);
        Some(previous)
    }

    /// Drop a client's binding only if `origin` created it
    pub fn unsubscribe_if(&self, client: &PeerId, origin: Origin) -> Option<Subscription> {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);

        match bindings.by_client.get(client) {
            Some(sub) if sub.origin == origin => {}
            _ => return None,
        }
        let previous = bindings.by_client.remove(client)?;
        bindings.detach(client, &previous.agent);
        Some(previous)
    }

    /// Clients bound to an agent, ordered by identity
    pub fn subscribers_of(&self, agent: &PeerId) -> Vec<PeerId> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        bindings
            .by_agent
            .get(agent)
            .map(|clients| clients.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Agent a client is bound to
    pub fn agent_of(&self, client: &PeerId) -> Option<PeerId> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        bindings.by_client.get(client).map(|sub| sub.agent)
    }

    /// Number of bound clients
    pub fn count(&self) -> usize {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        bindings.by_client.len()
    }
}
