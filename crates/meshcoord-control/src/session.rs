//! Peer sessions: one per live agent or client connection
//!
//! A session moves through `Registering → Active → Closing → Closed`. While
//! active it runs a read loop (inbound descriptors) and a write loop
//! (outbound descriptor sets) concurrently. The write loop is woken through a
//! per-session [`Notify`]; wake-ups coalesce, so a slow peer only ever sees
//! the latest state.

use crate::coordinator::Inner;
use crate::directory::SessionId;
use crate::error::{fold_codec_error, CoordinatorError};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use meshcoord_proto::{FrameCodec, Node, NodeSet, PeerId, PeerRole};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Lifecycle state of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Registering,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Registering => "registering",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Shared view of a session held by the coordinator's session maps
#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    pub(crate) id: SessionId,
    pub(crate) peer: PeerId,
    pub(crate) role: PeerRole,
    /// Agent a client session is bound to
    pub(crate) agent: Option<PeerId>,
    /// Wakes the write loop when the relevant descriptor set may have changed
    pub(crate) notify: Arc<Notify>,
    /// Cancelled to force the session into `Closing`
    pub(crate) cancel: CancellationToken,
    pub(crate) state: watch::Receiver<SessionState>,
    /// Stands in for the write time of a session that has not published yet
    pub(crate) registered_at: DateTime<Utc>,
}

impl SessionHandle {
    /// Signal the write loop; repeated signals before it runs collapse into one
    pub(crate) fn signal(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session reports `Closed`
    pub(crate) async fn closed(&self) {
        let mut state = self.state.clone();
        // An error means the session was dropped, which also closes it.
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

type NodeReader<S> = FramedRead<ReadHalf<S>, FrameCodec<NodeSet>>;
type NodeWriter<S> = FramedWrite<WriteHalf<S>, FrameCodec<NodeSet>>;

/// A registered session that has not finished yet
pub(crate) struct PeerSession {
    handle: SessionHandle,
    state: watch::Sender<SessionState>,
    inner: Arc<Inner>,
}

impl PeerSession {
    pub(crate) fn new(
        inner: Arc<Inner>,
        id: SessionId,
        peer: PeerId,
        role: PeerRole,
        agent: Option<PeerId>,
    ) -> Self {
        let (state, state_rx) = watch::channel(SessionState::Registering);
        let handle = SessionHandle {
            id,
            peer,
            role,
            agent,
            notify: Arc::new(Notify::new()),
            cancel: inner.shutdown.child_token(),
            state: state_rx,
            registered_at: Utc::now(),
        };
        Self {
            handle,
            state,
            inner,
        }
    }

    pub(crate) fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        trace!(
            peer_id = %self.handle.peer,
            session = self.handle.id,
            from = %previous,
            to = %next,
            "Session state change"
        );
    }

    /// Abandon a session that failed registration
    pub(crate) fn reject(self) {
        self.transition(SessionState::Closed);
    }

    /// Run the session until its stream closes or it is force-closed
    pub(crate) async fn run<S>(self, stream: S) -> Result<(), CoordinatorError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = FrameCodec::<NodeSet>::with_max_frame_size(self.inner.config.max_frame_size);
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, codec.clone());
        let writer = FramedWrite::new(write_half, codec);

        self.transition(SessionState::Active);
        info!(
            peer_id = %self.handle.peer,
            role = %self.handle.role,
            session = self.handle.id,
            "Peer session active"
        );

        let write_task = tokio::spawn(write_loop(
            self.inner.clone(),
            self.handle.clone(),
            writer,
        ));

        let read_result = self.read_loop(&mut reader).await;

        self.transition(SessionState::Closing);
        self.handle.cancel.cancel();

        let (writer, write_result) = match write_task.await {
            Ok((writer, result)) => (Some(writer), result),
            Err(e) => (None, Err(CoordinatorError::TaskFailed(e.to_string()))),
        };

        self.inner.unregister(&self.handle);

        if let Some(writer) = writer {
            let mut write_half = writer.into_inner();
            // The remote may already be gone; closing is best effort.
            let _ = tokio::time::timeout(self.inner.config.write_timeout(), write_half.shutdown())
                .await;
            drop(write_half);
        }
        drop(reader);

        self.transition(SessionState::Closed);

        let result = read_result.and(write_result);
        match &result {
            Ok(()) => info!(
                peer_id = %self.handle.peer,
                role = %self.handle.role,
                session = self.handle.id,
                "Peer session closed"
            ),
            Err(e) => warn!(
                peer_id = %self.handle.peer,
                role = %self.handle.role,
                session = self.handle.id,
                error = %e,
                "Peer session closed with error"
            ),
        }
        result
    }

    async fn read_loop<S>(&self, reader: &mut NodeReader<S>) -> Result<(), CoordinatorError>
    where
        S: AsyncRead,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.handle.cancel.cancelled() => {
                    debug!(peer_id = %self.handle.peer, session = self.handle.id, "Read loop cancelled");
                    return Ok(());
                }
                next = reader.next() => next,
            };

            let set = match next {
                None => {
                    debug!(peer_id = %self.handle.peer, session = self.handle.id, "Peer closed stream");
                    return Ok(());
                }
                Some(Err(e)) => return fold_codec_error(e),
                Some(Ok(set)) => set,
            };

            let node = own_node(set)?;
            trace!(peer_id = %self.handle.peer, node_id = node.id, "Received node update");

            if !self.inner.publish_local(&self.handle, node) {
                debug!(
                    peer_id = %self.handle.peer,
                    session = self.handle.id,
                    "Dropped update from superseded session"
                );
                return Ok(());
            }
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        // Covers a serve future dropped mid-flight; a no-op after a normal close.
        if *self.state.borrow() != SessionState::Closed {
            self.handle.cancel.cancel();
            self.inner.unregister(&self.handle);
            self.state.send_replace(SessionState::Closed);
        }
    }
}

/// A peer publishes exactly one descriptor per frame: its own
fn own_node(mut set: NodeSet) -> Result<Node, CoordinatorError> {
    match set.len() {
        1 => Ok(set.remove(0)),
        n => Err(CoordinatorError::Protocol(format!(
            "expected exactly one node per update, got {}",
            n
        ))),
    }
}

async fn write_loop<S>(
    inner: Arc<Inner>,
    handle: SessionHandle,
    mut writer: NodeWriter<S>,
) -> (NodeWriter<S>, Result<(), CoordinatorError>)
where
    S: AsyncWrite,
{
    let write_timeout = inner.config.write_timeout();
    let mut last_sent: NodeSet = Vec::new();

    let result = loop {
        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => break Ok(()),
            _ = handle.notify.notified() => {}
        }

        let set = inner.gather(&handle);
        if set == last_sent {
            trace!(peer_id = %handle.peer, "Descriptor set unchanged, skipping write");
            continue;
        }

        debug!(
            peer_id = %handle.peer,
            role = %handle.role,
            nodes = set.len(),
            "Writing descriptor set"
        );

        let send = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => break Ok(()),
            sent = tokio::time::timeout(write_timeout, writer.send(set.clone())) => sent,
        };

        match send {
            Ok(Ok(())) => last_sent = set,
            Ok(Err(e)) => break fold_codec_error(e),
            Err(_) => break Err(CoordinatorError::WriteTimeout(write_timeout)),
        }
    };

    // Wake the read loop if the write side failed first.
    handle.cancel.cancel();
    (writer, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_node_accepts_single() {
        let node = own_node(vec![Node::new(1, "k")]).unwrap();
        assert_eq!(node.id, 1);
    }

    #[test]
    fn test_own_node_rejects_empty_and_multiple() {
        assert!(matches!(
            own_node(vec![]),
            Err(CoordinatorError::Protocol(_))
        ));
        assert!(matches!(
            own_node(vec![Node::new(1, "a"), Node::new(2, "b")]),
            Err(CoordinatorError::Protocol(_))
        ));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Registering.to_string(), "registering");
        assert_eq!(SessionState::Closed.to_string(), "closed");
    }
}
