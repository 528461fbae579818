//! Propagation of descriptor updates between coordinator instances
//!
//! A coordinator publishes every local descriptor change and applies every
//! update received from other instances through the same fan-out path. The
//! channel carrying the updates is external; this module defines the seam and
//! two implementations:
//! - [`NoopPropagation`] for single-instance deployments
//! - [`MemoryBus`] for several coordinators sharing one process

use crate::directory::InstanceId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meshcoord_proto::{Node, PeerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by a propagation channel
#[derive(Debug, Error)]
pub enum PropagationError {
    #[error("Propagation channel closed")]
    ChannelClosed,

    #[error("Publish failed: {0}")]
    Publish(String),
}

/// How the published peer relates to others
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Agent,
    Client { agent: PeerId },
}

/// One descriptor change as seen by other instances
#[derive(Debug, Clone, PartialEq)]
pub struct PeerUpdate {
    /// Instance whose local session produced the change
    pub origin: InstanceId,
    pub id: PeerId,
    pub binding: Binding,
    /// New descriptor, or `None` when the peer went away
    pub node: Option<Node>,
    /// When the origin instance accepted the change
    pub published_at: DateTime<Utc>,
}

/// Publish/subscribe channel linking coordinator instances
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Propagation: Send + Sync {
    /// Send a local change to every other instance
    async fn publish(&self, update: PeerUpdate) -> Result<(), PropagationError>;

    /// Receive changes published by instances, including this one's own.
    ///
    /// Receivers filter out updates whose origin is themselves.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<PeerUpdate>, PropagationError>;
}

/// Propagation for a single coordinator: nothing leaves the process
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPropagation;

#[async_trait]
impl Propagation for NoopPropagation {
    async fn publish(&self, _update: PeerUpdate) -> Result<(), PropagationError> {
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<PeerUpdate>, PropagationError> {
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok(rx)
    }
}

#[derive(Debug, Default)]
struct BusState {
    /// Latest live update per peer, replayed to late subscribers
    retained: HashMap<PeerId, PeerUpdate>,
    subscribers: Vec<mpsc::UnboundedSender<PeerUpdate>>,
}

/// In-process bus shared by coordinators running side by side.
///
/// Keeps the latest update per peer so an instance that subscribes after a
/// publish still converges.
#[derive(Debug, Default, Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Number of peers with a retained update
    pub fn retained_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.retained.len()
    }
}

#[async_trait]
impl Propagation for MemoryBus {
    async fn publish(&self, update: PeerUpdate) -> Result<(), PropagationError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if update.node.is_some() {
            state.retained.insert(update.id, update.clone());
        } else if state
            .retained
            .get(&update.id)
            .is_some_and(|retained| retained.origin == update.origin)
        {
            state.retained.remove(&update.id);
        }

        state
            .subscribers
            .retain(|tx| tx.send(update.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<PeerUpdate>, PropagationError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (tx, rx) = mpsc::unbounded_channel();

        for update in state.retained.values() {
            tx.send(update.clone())
                .map_err(|_| PropagationError::ChannelClosed)?;
        }
        state.subscribers.push(tx);
        Ok(rx)
    }
}
