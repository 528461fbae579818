//! Node descriptors exchanged through the coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of one agent or one client.
///
/// Agents and clients share this namespace; the role is always explicit at
/// registration time.
pub type PeerId = uuid::Uuid;

/// Addressing and key material a peer publishes so others can tunnel to it.
///
/// The coordinator never interprets these fields. A newer descriptor fully
/// replaces the previous one for the same peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Tunnel-level node identifier chosen by the peer
    pub id: i64,
    /// When the peer produced this descriptor
    pub as_of: DateTime<Utc>,
    /// Public key of the tunnel endpoint
    pub key: String,
    /// Discovery key used for direct path probing
    pub disco: String,
    /// Relay region the peer prefers
    pub preferred_relay: i32,
    /// Measured latency per relay region, in seconds
    pub relay_latency: BTreeMap<String, f64>,
    /// Tunnel addresses assigned to the peer (CIDR notation)
    pub addresses: Vec<String>,
    /// Prefixes routed to the peer (CIDR notation)
    pub allowed_ips: Vec<String>,
    /// Reachable `ip:port` endpoints
    pub endpoints: Vec<String>,
}

impl Node {
    /// Create a descriptor with only the node id and key set
    pub fn new(id: i64, key: impl Into<String>) -> Self {
        Self {
            id,
            as_of: Utc::now(),
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }
}
