//! Protocol message types

use crate::node::{Node, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role a connection plays once registered with the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    Agent,
    Client,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Agent => write!(f, "agent"),
            PeerRole::Client => write!(f, "client"),
        }
    }
}

/// First frame sent on a raw connection so the supplier can classify it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Handshake {
    /// Agent publishes its own descriptor and receives its clients'
    Agent { id: PeerId },
    /// Client is bound to `agent` for the lifetime of the connection
    Client { id: PeerId, agent: PeerId },
}

impl Handshake {
    pub fn role(&self) -> PeerRole {
        match self {
            Handshake::Agent { .. } => PeerRole::Agent,
            Handshake::Client { .. } => PeerRole::Client,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        match self {
            Handshake::Agent { id } | Handshake::Client { id, .. } => *id,
        }
    }
}

/// Payload of every frame after the handshake, in both directions.
///
/// Peer to coordinator: exactly one node, the sender's own descriptor.
/// Coordinator to peer: the full set the receiver currently needs.
pub type NodeSet = Vec<Node>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_accessors() {
        let agent = PeerId::new_v4();
        let client = PeerId::new_v4();

        let hs = Handshake::Client { id: client, agent };
        assert_eq!(hs.role(), PeerRole::Client);
        assert_eq!(hs.peer_id(), client);

        let hs = Handshake::Agent { id: agent };
        assert_eq!(hs.role(), PeerRole::Agent);
        assert_eq!(hs.peer_id(), agent);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(PeerRole::Agent.to_string(), "agent");
        assert_eq!(PeerRole::Client.to_string(), "client");
    }
}
