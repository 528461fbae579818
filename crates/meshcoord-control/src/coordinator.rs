//! The coordinator: registry of live peer sessions and descriptor fan-out
//!
//! All mutation of the node directory and subscription registry goes through
//! the methods on [`Inner`]. Locks are never held across I/O; a session's
//! writes happen on its own write loop after it has been signalled.

use crate::config::CoordinatorConfig;
use crate::directory::{InstanceId, NodeDirectory, Origin};
use crate::error::CoordinatorError;
use crate::propagation::{Binding, PeerUpdate, Propagation};
use crate::session::{PeerSession, SessionHandle, SessionState};
use crate::subscriptions::SubscriptionRegistry;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use meshcoord_proto::{Node, NodeSet, PeerId, PeerRole};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Control-plane coordinator brokering node descriptors between agents and
/// clients.
///
/// Cheap to clone; clones share the same registry. Construct one per process
/// (or one per instance in tests) and hand it to whatever accepts
/// connections. Call [`Coordinator::close`] to shut it down: in-flight
/// `serve_*` calls then return `Ok(())` and new ones fail with
/// [`CoordinatorError::Closed`].
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) instance_id: InstanceId,
    pub(crate) config: CoordinatorConfig,
    directory: NodeDirectory,
    subscriptions: SubscriptionRegistry,
    agents: DashMap<PeerId, SessionHandle>,
    clients: DashMap<PeerId, SessionHandle>,
    next_session: AtomicU64,
    closed: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    /// Feeds the propagation publisher task; `None` in single-instance mode
    publisher: Option<mpsc::UnboundedSender<PeerUpdate>>,
}

impl Coordinator {
    /// Create a single-instance coordinator
    pub fn new(config: CoordinatorConfig) -> Self {
        let inner = Inner::new(config, None);
        info!(instance_id = %inner.instance_id, "Created coordinator");
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Create a coordinator that exchanges updates with other instances.
    ///
    /// Spawns the publisher and remote-update tasks, so it must be called
    /// from within a Tokio runtime.
    pub fn with_propagation(config: CoordinatorConfig, propagation: Arc<dyn Propagation>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner::new(config, Some(tx)));
        info!(instance_id = %inner.instance_id, "Created coordinator with propagation");

        tokio::spawn(publish_loop(inner.instance_id, propagation.clone(), rx));
        tokio::spawn(remote_update_loop(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            propagation,
        ));

        Self { inner }
    }

    /// Identity of this instance in a multi-instance deployment
    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Serve an agent connection until it closes.
    ///
    /// Returns `Ok(())` when the remote closes the stream, when a newer
    /// session for the same agent supersedes this one, or when the
    /// coordinator shuts down.
    pub async fn serve_agent<S>(&self, stream: S, id: PeerId) -> Result<(), CoordinatorError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = self.inner.register(id, PeerRole::Agent, None).await?;
        session.run(stream).await
    }

    /// Serve a client connection bound to `agent` until it closes.
    ///
    /// The client immediately receives the agent's descriptor if one is known.
    pub async fn serve_client<S>(
        &self,
        stream: S,
        id: PeerId,
        agent: PeerId,
    ) -> Result<(), CoordinatorError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = self
            .inner
            .register(id, PeerRole::Client, Some(agent))
            .await?;
        session.run(stream).await
    }

    /// Snapshot of a peer's current descriptor
    pub fn node(&self, id: &PeerId) -> Option<Node> {
        self.inner.directory.get(id)
    }

    /// Number of live sessions in a role
    pub fn session_count(&self, role: PeerRole) -> usize {
        self.inner.sessions(role).len()
    }

    /// Number of descriptors currently known, local and remote
    pub fn node_count(&self) -> usize {
        self.inner.directory.len()
    }

    /// Force-close every session. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            instance_id = %self.inner.instance_id,
            agents = self.inner.agents.len(),
            clients = self.inner.clients.len(),
            "Closing coordinator"
        );
        self.inner.shutdown.cancel();
    }

    /// Close and wait until every session has reached `Closed`
    pub async fn close_and_wait(&self) {
        self.close();

        let handles: Vec<SessionHandle> = self
            .inner
            .agents
            .iter()
            .chain(self.inner.clients.iter())
            .map(|entry| entry.value().clone())
            .filter(|handle| handle.state() != SessionState::Closed)
            .collect();

        for handle in handles {
            handle.closed().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn new(
        config: CoordinatorConfig,
        publisher: Option<mpsc::UnboundedSender<PeerUpdate>>,
    ) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            config,
            directory: NodeDirectory::new(),
            subscriptions: SubscriptionRegistry::new(),
            agents: DashMap::new(),
            clients: DashMap::new(),
            next_session: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            publisher,
        }
    }

    fn sessions(&self, role: PeerRole) -> &DashMap<PeerId, SessionHandle> {
        match role {
            PeerRole::Agent => &self.agents,
            PeerRole::Client => &self.clients,
        }
    }

    /// Validate and install a new session, superseding any predecessor.
    ///
    /// The predecessor is force-closed and its directory entry and
    /// subscription removed before this returns, so at no point do two
    /// sessions write for the same identity.
    pub(crate) async fn register(
        self: &Arc<Self>,
        peer: PeerId,
        role: PeerRole,
        agent: Option<PeerId>,
    ) -> Result<PeerSession, CoordinatorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Closed);
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session = PeerSession::new(self.clone(), id, peer, role, agent);

        if let Err(e) = validate_registration(peer, role, agent) {
            warn!(peer_id = %peer, role = %role, error = %e, "Rejected registration");
            session.reject();
            return Err(e);
        }

        let handle = session.handle().clone();
        let previous = self.sessions(role).insert(peer, handle.clone());

        if let Some(previous) = previous {
            info!(
                peer_id = %peer,
                role = %role,
                old_session = previous.id,
                new_session = id,
                "Superseding existing session"
            );
            previous.cancel.cancel();
            self.unregister(&previous);

            let timeout = self.config.supersede_timeout();
            if tokio::time::timeout(timeout, previous.closed()).await.is_err() {
                warn!(
                    peer_id = %peer,
                    old_session = previous.id,
                    "Superseded session did not close within {:?}",
                    timeout
                );
            }
        }

        if let Some(agent) = agent {
            let replaced = self
                .subscriptions
                .subscribe(peer, agent, Origin::Local(id));
            if let Some(replaced) = replaced {
                if replaced.agent != agent {
                    self.notify([replaced.agent]);
                }
            }
            debug!(client_id = %peer, agent_id = %agent, "Client bound to agent");
        }

        info!(peer_id = %peer, role = %role, session = id, "Registered peer session");

        // First gather: a client learns its agent's descriptor right away and a
        // reconnecting agent learns its existing clients.
        handle.signal();
        Ok(session)
    }

    /// Remove everything a session installed and notify its dependents.
    ///
    /// Idempotent; entries already replaced by a newer writer are left alone.
    pub(crate) fn unregister(&self, handle: &SessionHandle) {
        let removed_session = self
            .sessions(handle.role)
            .remove_if(&handle.peer, |_, current| current.id == handle.id)
            .is_some();

        let origin = Origin::Local(handle.id);
        let binding = binding_of(handle);
        let mut targets = Vec::new();

        if self
            .directory
            .remove_if_origin(&handle.peer, origin)
            .is_some()
        {
            targets.extend(self.dependents_of(&handle.peer, binding));
            self.publish(PeerUpdate {
                origin: self.instance_id,
                id: handle.peer,
                binding,
                node: None,
                published_at: Utc::now(),
            });
        }

        if handle.role == PeerRole::Client {
            if let Some(sub) = self.subscriptions.unsubscribe_if(&handle.peer, origin) {
                targets.push(sub.agent);
            }
        }

        if removed_session || !targets.is_empty() {
            debug!(
                peer_id = %handle.peer,
                session = handle.id,
                notified = targets.len(),
                "Unregistered peer session"
            );
        }
        self.notify(targets);
    }

    /// Store a descriptor published by a local session and fan it out.
    ///
    /// Returns `false` if `handle` is no longer the registered session for
    /// its identity; the write is then discarded.
    pub(crate) fn publish_local(&self, handle: &SessionHandle, node: Node) -> bool {
        let published_at = Utc::now();
        {
            let Some(current) = self.sessions(handle.role).get(&handle.peer) else {
                return false;
            };
            if current.id != handle.id {
                return false;
            }
            // Holding the session entry keeps a concurrent registration from
            // slipping in between the check and the write.
            self.directory.set_at(
                handle.peer,
                node.clone(),
                Origin::Local(handle.id),
                published_at,
            );
        }

        let binding = binding_of(handle);
        let targets = self.dependents_of(&handle.peer, binding);
        trace!(
            peer_id = %handle.peer,
            notified = targets.len(),
            "Fanning out node update"
        );
        self.notify(targets);

        self.publish(PeerUpdate {
            origin: self.instance_id,
            id: handle.peer,
            binding,
            node: Some(node),
            published_at,
        });
        true
    }

    /// Apply an update published by another instance.
    ///
    /// Writes for one identity are ordered by the time their origin accepted
    /// them. A newer remote descriptor takes the identity over from a local
    /// session, which is force-closed; an older one is dropped.
    pub(crate) fn apply_remote(&self, update: PeerUpdate) {
        if update.origin == self.instance_id {
            return;
        }
        let origin = Origin::Remote(update.origin);

        match update.node {
            Some(node) => {
                let sessions = match update.binding {
                    Binding::Agent => &self.agents,
                    Binding::Client { .. } => &self.clients,
                };

                let displaced = {
                    // Holding the session entry keeps a registration from
                    // slipping in between the ordering check and the write.
                    let local = sessions.entry(update.id);
                    let current = self.directory.entry(&update.id);
                    let written_at = match &local {
                        Entry::Occupied(session) => {
                            let session = session.get();
                            current
                                .filter(|entry| entry.origin == Origin::Local(session.id))
                                .map_or(session.registered_at, |entry| entry.updated_at)
                        }
                        Entry::Vacant(_) => match current {
                            Some(entry) => entry.updated_at,
                            None => update.published_at,
                        },
                    };
                    if update.published_at < written_at {
                        debug!(
                            peer_id = %update.id,
                            remote = %update.origin,
                            "Ignoring remote update older than the current writer"
                        );
                        return;
                    }

                    self.directory
                        .set_at(update.id, node, origin, update.published_at);
                    match local {
                        Entry::Occupied(session) => Some(session.remove()),
                        Entry::Vacant(_) => None,
                    }
                };

                if let Some(handle) = &displaced {
                    info!(
                        peer_id = %handle.peer,
                        session = handle.id,
                        remote = %update.origin,
                        "Peer moved to another instance, closing local session"
                    );
                    handle.cancel.cancel();
                }

                let mut targets = self.dependents_of(&update.id, update.binding);
                if let Binding::Client { agent } = update.binding {
                    if let Some(replaced) = self.subscriptions.subscribe(update.id, agent, origin) {
                        if replaced.agent != agent {
                            targets.push(replaced.agent);
                        }
                    }
                }
                trace!(peer_id = %update.id, remote = %update.origin, "Applied remote node");
                self.notify(targets);
            }
            None => {
                let mut targets = Vec::new();
                if self.directory.remove_if_origin(&update.id, origin).is_some() {
                    targets.extend(self.dependents_of(&update.id, update.binding));
                }
                if let Binding::Client { .. } = update.binding {
                    if let Some(sub) = self.subscriptions.unsubscribe_if(&update.id, origin) {
                        targets.push(sub.agent);
                    }
                }
                trace!(peer_id = %update.id, remote = %update.origin, "Applied remote removal");
                self.notify(targets);
            }
        }
    }

    /// Identities whose view depends on `peer`'s descriptor
    fn dependents_of(&self, peer: &PeerId, binding: Binding) -> Vec<PeerId> {
        match binding {
            Binding::Agent => self.subscriptions.subscribers_of(peer),
            Binding::Client { agent } => vec![agent],
        }
    }

    /// Signal the write loop of every local session among `ids`
    fn notify(&self, ids: impl IntoIterator<Item = PeerId>) {
        for id in ids {
            if let Some(handle) = self.agents.get(&id) {
                handle.signal();
            }
            if let Some(handle) = self.clients.get(&id) {
                handle.signal();
            }
        }
    }

    /// The descriptor set a session's peer should currently hold
    pub(crate) fn gather(&self, handle: &SessionHandle) -> NodeSet {
        match handle.agent {
            Some(agent) => self.directory.get(&agent).into_iter().collect(),
            None => self
                .subscriptions
                .subscribers_of(&handle.peer)
                .iter()
                .filter_map(|client| self.directory.get(client))
                .collect(),
        }
    }

    fn publish(&self, update: PeerUpdate) {
        if let Some(publisher) = &self.publisher {
            // The publisher task outlives every session, so this only fails
            // during runtime teardown.
            if publisher.send(update).is_err() {
                debug!("Propagation publisher is gone, dropping update");
            }
        }
    }
}

fn binding_of(handle: &SessionHandle) -> Binding {
    match handle.agent {
        Some(agent) => Binding::Client { agent },
        None => Binding::Agent,
    }
}

fn validate_registration(
    peer: PeerId,
    role: PeerRole,
    agent: Option<PeerId>,
) -> Result<(), CoordinatorError> {
    if peer.is_nil() {
        return Err(CoordinatorError::Protocol(format!(
            "{} identity must not be nil",
            role
        )));
    }
    match (role, agent) {
        (PeerRole::Agent, None) => Ok(()),
        (PeerRole::Agent, Some(_)) => Err(CoordinatorError::Protocol(
            "agent sessions cannot bind to an agent".to_string(),
        )),
        (PeerRole::Client, None) => Err(CoordinatorError::Protocol(
            "client sessions must bind to an agent".to_string(),
        )),
        (PeerRole::Client, Some(agent)) if agent.is_nil() => Err(CoordinatorError::Protocol(
            "agent identity must not be nil".to_string(),
        )),
        (PeerRole::Client, Some(agent)) if agent == peer => Err(CoordinatorError::Protocol(
            "client cannot bind to itself".to_string(),
        )),
        (PeerRole::Client, Some(_)) => Ok(()),
    }
}

/// Forward local changes to the propagation channel in order.
///
/// Failures are logged and dropped; they never reach the session that
/// produced the change.
async fn publish_loop(
    instance_id: InstanceId,
    propagation: Arc<dyn Propagation>,
    mut updates: mpsc::UnboundedReceiver<PeerUpdate>,
) {
    while let Some(update) = updates.recv().await {
        let peer_id = update.id;
        if let Err(e) = propagation.publish(update).await {
            warn!(
                instance_id = %instance_id,
                peer_id = %peer_id,
                error = %e,
                "Failed to propagate node update"
            );
        }
    }
    debug!(instance_id = %instance_id, "Propagation publisher stopped");
}

async fn remote_update_loop(
    inner: Weak<Inner>,
    shutdown: CancellationToken,
    propagation: Arc<dyn Propagation>,
) {
    let mut updates = match propagation.subscribe().await {
        Ok(updates) => updates,
        Err(e) => {
            warn!(error = %e, "Failed to subscribe to remote node updates");
            return;
        }
    };

    loop {
        let update = tokio::select! {
            _ = shutdown.cancelled() => break,
            update = updates.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply_remote(update);
    }
    debug!("Remote update listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::{MockPropagation, PropagationError};

    fn coordinator() -> Coordinator {
        Coordinator::new(CoordinatorConfig::default())
    }

    #[tokio::test]
    async fn test_rejects_invalid_registrations() {
        let coord = coordinator();
        let id = PeerId::new_v4();

        for (peer, role, agent) in [
            (PeerId::nil(), PeerRole::Agent, None),
            (id, PeerRole::Agent, Some(PeerId::new_v4())),
            (id, PeerRole::Client, None),
            (id, PeerRole::Client, Some(id)),
            (id, PeerRole::Client, Some(PeerId::nil())),
        ] {
            let result = coord.inner.register(peer, role, agent).await;
            assert!(
                matches!(result, Err(CoordinatorError::Protocol(_))),
                "{:?} {:?} {:?} should be rejected",
                peer,
                role,
                agent
            );
        }

        // Rejected registrations leave no trace
        assert_eq!(coord.session_count(PeerRole::Agent), 0);
        assert_eq!(coord.session_count(PeerRole::Client), 0);
        assert_eq!(coord.inner.subscriptions.count(), 0);
    }

    #[tokio::test]
    async fn test_register_after_close_fails() {
        let coord = coordinator();
        coord.close();
        coord.close();
        assert!(coord.is_closed());

        let (_a, b) = tokio::io::duplex(64);
        let result = coord.serve_agent(b, PeerId::new_v4()).await;
        assert!(matches!(result, Err(CoordinatorError::Closed)));
    }

    #[tokio::test]
    async fn test_publish_and_lookup() {
        let coord = coordinator();
        let agent = PeerId::new_v4();
        let session = coord
            .inner
            .register(agent, PeerRole::Agent, None)
            .await
            .unwrap();

        let node = Node::new(1, "agent-key");
        assert!(coord.inner.publish_local(session.handle(), node.clone()));
        assert_eq!(coord.node(&agent), Some(node));

        drop(session);
        assert!(coord.node(&agent).is_none());
        assert_eq!(coord.session_count(PeerRole::Agent), 0);
    }

    #[tokio::test]
    async fn test_superseded_session_cannot_write() {
        // The first session is never run, so it never reports `Closed`; keep
        // the supersede wait short.
        let coord = Coordinator::new(CoordinatorConfig {
            supersede_timeout_ms: 50,
            ..Default::default()
        });
        let agent = PeerId::new_v4();

        let first = coord
            .inner
            .register(agent, PeerRole::Agent, None)
            .await
            .unwrap();
        let first_handle = first.handle().clone();
        assert!(coord
            .inner
            .publish_local(&first_handle, Node::new(1, "first")));

        let second = coord
            .inner
            .register(agent, PeerRole::Agent, None)
            .await
            .unwrap();

        assert!(first_handle.cancel.is_cancelled());
        // The predecessor's descriptor is gone before the successor is usable
        assert!(coord.node(&agent).is_none());

        assert!(!coord
            .inner
            .publish_local(&first_handle, Node::new(1, "stale")));
        assert!(coord.node(&agent).is_none());

        assert!(coord
            .inner
            .publish_local(second.handle(), Node::new(2, "second")));
        assert_eq!(coord.node(&agent).unwrap().key, "second");

        // Dropping the stale session must not disturb its successor
        drop(first);
        assert_eq!(coord.node(&agent).unwrap().key, "second");
        assert_eq!(coord.session_count(PeerRole::Agent), 1);
    }

    #[tokio::test]
    async fn test_gather_for_agent_and_client() {
        let coord = coordinator();
        let agent = PeerId::new_v4();
        let client_a = PeerId::new_v4();
        let client_b = PeerId::new_v4();

        let agent_session = coord
            .inner
            .register(agent, PeerRole::Agent, None)
            .await
            .unwrap();
        let a = coord
            .inner
            .register(client_a, PeerRole::Client, Some(agent))
            .await
            .unwrap();
        let b = coord
            .inner
            .register(client_b, PeerRole::Client, Some(agent))
            .await
            .unwrap();

        // Subscribed but unpublished clients contribute nothing
        assert!(coord.inner.gather(agent_session.handle()).is_empty());
        assert!(coord.inner.gather(a.handle()).is_empty());

        let agent_node = Node::new(1, "agent");
        coord.inner.publish_local(a.handle(), Node::new(10, "a"));
        coord.inner.publish_local(b.handle(), Node::new(11, "b"));
        coord
            .inner
            .publish_local(agent_session.handle(), agent_node.clone());

        let for_agent = coord.inner.gather(agent_session.handle());
        assert_eq!(for_agent.len(), 2);
        assert_eq!(coord.inner.gather(a.handle()), vec![agent_node]);

        drop(b);
        assert_eq!(coord.inner.gather(agent_session.handle()).len(), 1);
    }

    fn remote_agent_update(origin: InstanceId, id: PeerId, node: Option<Node>) -> PeerUpdate {
        PeerUpdate {
            origin,
            id,
            binding: Binding::Agent,
            node,
            published_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_newer_remote_update_displaces_local_session() {
        let coord = coordinator();
        let remote = Uuid::new_v4();
        let agent = PeerId::new_v4();

        let session = coord
            .inner
            .register(agent, PeerRole::Agent, None)
            .await
            .unwrap();
        let handle = session.handle().clone();
        assert!(coord.inner.publish_local(&handle, Node::new(1, "local")));

        coord
            .inner
            .apply_remote(remote_agent_update(remote, agent, Some(Node::new(2, "remote"))));

        assert_eq!(coord.node(&agent).unwrap().key, "remote");
        assert_eq!(coord.session_count(PeerRole::Agent), 0);
        assert!(handle.cancel.is_cancelled());
        assert!(!coord.inner.publish_local(&handle, Node::new(1, "stale")));
        assert_eq!(coord.node(&agent).unwrap().key, "remote");

        // The displaced session's cleanup leaves the remote entry alone
        drop(session);
        assert_eq!(coord.node(&agent).unwrap().key, "remote");

        // Only the instance that wrote the entry can remove it
        coord
            .inner
            .apply_remote(remote_agent_update(Uuid::new_v4(), agent, None));
        assert!(coord.node(&agent).is_some());
        coord
            .inner
            .apply_remote(remote_agent_update(remote, agent, None));
        assert!(coord.node(&agent).is_none());
    }

    #[tokio::test]
    async fn test_stale_remote_update_is_ignored() {
        let coord = coordinator();
        let agent = PeerId::new_v4();

        let session = coord
            .inner
            .register(agent, PeerRole::Agent, None)
            .await
            .unwrap();
        coord.inner.publish_local(session.handle(), Node::new(1, "local"));

        let mut update = remote_agent_update(Uuid::new_v4(), agent, Some(Node::new(1, "old")));
        update.published_at = Utc::now() - chrono::Duration::seconds(60);
        coord.inner.apply_remote(update);

        assert_eq!(coord.node(&agent).unwrap().key, "local");
        assert_eq!(coord.session_count(PeerRole::Agent), 1);
        assert!(!session.handle().cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_remote_update_older_than_registration_leaves_no_entry() {
        let coord = coordinator();
        let agent = PeerId::new_v4();

        // Registered but not yet published
        let session = coord
            .inner
            .register(agent, PeerRole::Agent, None)
            .await
            .unwrap();

        let mut update = remote_agent_update(Uuid::new_v4(), agent, Some(Node::new(1, "old")));
        update.published_at = session.handle().registered_at - chrono::Duration::milliseconds(1);
        coord.inner.apply_remote(update);

        assert!(coord.node(&agent).is_none());
        assert_eq!(coord.session_count(PeerRole::Agent), 1);

        drop(session);
        assert!(coord.node(&agent).is_none());
    }

    #[tokio::test]
    async fn test_older_remote_update_loses_to_newer_remote() {
        let coord = coordinator();
        let agent = PeerId::new_v4();

        coord.inner.apply_remote(remote_agent_update(
            Uuid::new_v4(),
            agent,
            Some(Node::new(2, "newer")),
        ));

        let mut late = remote_agent_update(Uuid::new_v4(), agent, Some(Node::new(1, "older")));
        late.published_at = Utc::now() - chrono::Duration::seconds(5);
        coord.inner.apply_remote(late);

        assert_eq!(coord.node(&agent).unwrap().key, "newer");
    }

    #[tokio::test]
    async fn test_remote_client_binds_to_local_agent() {
        let coord = coordinator();
        let remote = Uuid::new_v4();
        let agent = PeerId::new_v4();
        let client = PeerId::new_v4();

        let agent_session = coord
            .inner
            .register(agent, PeerRole::Agent, None)
            .await
            .unwrap();

        coord.inner.apply_remote(PeerUpdate {
            origin: remote,
            id: client,
            binding: Binding::Client { agent },
            node: Some(Node::new(5, "remote-client")),
            published_at: Utc::now(),
        });
        assert_eq!(coord.inner.gather(agent_session.handle()).len(), 1);

        coord.inner.apply_remote(PeerUpdate {
            origin: remote,
            id: client,
            binding: Binding::Client { agent },
            node: None,
            published_at: Utc::now(),
        });
        assert!(coord.inner.gather(agent_session.handle()).is_empty());
        assert!(coord.node(&client).is_none());
    }

    #[tokio::test]
    async fn test_own_updates_are_ignored() {
        let coord = coordinator();
        let id = PeerId::new_v4();

        coord.inner.apply_remote(PeerUpdate {
            origin: coord.instance_id(),
            id,
            binding: Binding::Agent,
            node: Some(Node::new(1, "echo")),
            published_at: Utc::now(),
        });
        assert!(coord.node(&id).is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_block_local_fanout() {
        let mut mock = MockPropagation::new();
        mock.expect_publish()
            .returning(|_| Err(PropagationError::Publish("bus down".to_string())));
        mock.expect_subscribe().returning(|| {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        });

        let coord = Coordinator::with_propagation(CoordinatorConfig::default(), Arc::new(mock));
        let agent = PeerId::new_v4();
        let client = PeerId::new_v4();

        let agent_session = coord
            .inner
            .register(agent, PeerRole::Agent, None)
            .await
            .unwrap();
        let client_session = coord
            .inner
            .register(client, PeerRole::Client, Some(agent))
            .await
            .unwrap();

        assert!(coord
            .inner
            .publish_local(agent_session.handle(), Node::new(1, "agent")));
        assert_eq!(coord.node(&agent).unwrap().key, "agent");
        assert_eq!(coord.inner.gather(client_session.handle()).len(), 1);
    }

    #[tokio::test]
    async fn test_close_cancels_sessions() {
        let coord = coordinator();
        let session = coord
            .inner
            .register(PeerId::new_v4(), PeerRole::Agent, None)
            .await
            .unwrap();
        assert_eq!(session.handle().state(), SessionState::Registering);

        coord.close();
        assert!(session.handle().cancel.is_cancelled());
    }
}
