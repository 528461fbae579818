//! Node directory: the latest descriptor published by each peer
//!
//! Last write wins per identity. The directory does not decide who may write;
//! the coordinator only calls [`NodeDirectory::set`] on behalf of the session
//! currently registered for an identity, or for a remote instance's update.
//!
//! `set` and `remove` hand back the replaced entry rather than a list of peers
//! to notify. Who depends on an identity lives in the subscription registry,
//! so the coordinator pairs each write with `Inner::dependents_of` to build
//! the notify list.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use meshcoord_proto::{Node, PeerId};
use uuid::Uuid;

/// Identifier of one peer session inside a coordinator instance
pub type SessionId = u64;

/// Identifier of a coordinator instance in a multi-instance deployment
pub type InstanceId = Uuid;

/// Who wrote a directory entry or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A live session on this instance
    Local(SessionId),
    /// An update received from another coordinator instance
    Remote(InstanceId),
}

/// A directory entry with its provenance
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub node: Node,
    pub origin: Origin,
    /// When the writer produced this descriptor; orders writes across instances
    pub updated_at: DateTime<Utc>,
}

/// Concurrency-safe map from peer identity to its current descriptor
#[derive(Debug, Default)]
pub struct NodeDirectory {
    nodes: DashMap<PeerId, DirectoryEntry>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    /// Current descriptor for a peer, if it has published one
    pub fn get(&self, id: &PeerId) -> Option<Node> {
        self.nodes.get(id).map(|entry| entry.node.clone())
    }

    /// Current entry including provenance
    pub fn entry(&self, id: &PeerId) -> Option<DirectoryEntry> {
        self.nodes.get(id).map(|entry| entry.value().clone())
    }

    /// Store a descriptor written now, unconditionally replacing any previous one.
    ///
    /// Returns the replaced entry.
    pub fn set(&self, id: PeerId, node: Node, origin: Origin) -> Option<DirectoryEntry> {
        self.set_at(id, node, origin, Utc::now())
    }

    /// Store a descriptor with the time its writer produced it
    pub fn set_at(
        &self,
        id: PeerId,
        node: Node,
        origin: Origin,
        updated_at: DateTime<Utc>,
    ) -> Option<DirectoryEntry> {
        self.nodes.insert(
            id,
            DirectoryEntry {
                node,
                origin,
                updated_at,
            },
        )
    }

    /// Remove a peer's descriptor regardless of who wrote it
    pub fn remove(&self, id: &PeerId) -> Option<DirectoryEntry> {
        self.nodes.remove(id).map(|(_, entry)| entry)
    }

    /// Remove a peer's descriptor only if `origin` wrote it.
    ///
    /// A superseded session or a departed remote instance must not delete an
    /// entry that a newer writer has already replaced.
    pub fn remove_if_origin(&self, id: &PeerId, origin: Origin) -> Option<DirectoryEntry> {
        self.nodes
            .remove_if(id, |_, entry| entry.origin == origin)
            .map(|(_, entry)| entry)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let dir = NodeDirectory::new();
        let id = PeerId::new_v4();
        let node = Node::new(1, "key-1");

        assert!(dir.set(id, node.clone(), Origin::Local(1)).is_none());
        assert_eq!(dir.get(&id), Some(node));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_set_overwrites() {
        let dir = NodeDirectory::new();
        let id = PeerId::new_v4();

        dir.set(id, Node::new(1, "old"), Origin::Local(1));
        let previous = dir.set(id, Node::new(1, "new"), Origin::Local(1)).unwrap();

        assert_eq!(previous.node.key, "old");
        assert_eq!(dir.get(&id).unwrap().key, "new");
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_entry_keeps_writer_timestamp() {
        let dir = NodeDirectory::new();
        let id = PeerId::new_v4();
        let instance = Uuid::new_v4();
        let written = Utc::now() - chrono::Duration::seconds(30);

        dir.set_at(id, Node::new(1, "k"), Origin::Remote(instance), written);

        let entry = dir.entry(&id).unwrap();
        assert_eq!(entry.origin, Origin::Remote(instance));
        assert_eq!(entry.updated_at, written);
        assert!(dir.entry(&PeerId::new_v4()).is_none());
    }

    #[test]
    fn test_get_absent() {
        let dir = NodeDirectory::new();
        assert!(dir.get(&PeerId::new_v4()).is_none());
        assert!(dir.is_empty());
    }

    #[test]
    fn test_remove() {
        let dir = NodeDirectory::new();
        let id = PeerId::new_v4();
        dir.set(id, Node::new(1, "k"), Origin::Local(3));

        let removed = dir.remove(&id).unwrap();
        assert_eq!(removed.origin, Origin::Local(3));
        assert!(!dir.contains(&id));
        assert!(dir.remove(&id).is_none());
    }

    #[test]
    fn test_remove_if_origin_keeps_newer_writer() {
        let dir = NodeDirectory::new();
        let id = PeerId::new_v4();

        dir.set(id, Node::new(1, "from-session-1"), Origin::Local(1));
        dir.set(id, Node::new(1, "from-session-2"), Origin::Local(2));

        // The superseded session cleaning up must not remove its successor's entry
        assert!(dir.remove_if_origin(&id, Origin::Local(1)).is_none());
        assert_eq!(dir.get(&id).unwrap().key, "from-session-2");

        assert!(dir.remove_if_origin(&id, Origin::Local(2)).is_some());
        assert!(dir.get(&id).is_none());
    }

    #[test]
    fn test_remove_if_origin_distinguishes_instances() {
        let dir = NodeDirectory::new();
        let id = PeerId::new_v4();
        let instance_a = Uuid::new_v4();
        let instance_b = Uuid::new_v4();

        dir.set(id, Node::new(1, "k"), Origin::Remote(instance_b));

        assert!(dir.remove_if_origin(&id, Origin::Remote(instance_a)).is_none());
        assert!(dir.remove_if_origin(&id, Origin::Remote(instance_b)).is_some());
    }

    #[test]
    fn test_concurrent_writers_last_write_wins() {
        use std::sync::Arc;

        let dir = Arc::new(NodeDirectory::new());
        let ids: Vec<PeerId> = (0..8).map(|_| PeerId::new_v4()).collect();

        let handles: Vec<_> = ids
            .iter()
            .copied()
            .map(|id| {
                let dir = dir.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        dir.set(id, Node::new(i, format!("key-{}", i)), Origin::Local(1));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(dir.len(), ids.len());
        for id in ids {
            assert_eq!(dir.get(&id).unwrap().id, 99);
        }
    }
}
