//! Peer side of the coordination protocol
//!
//! Agents and clients run [`serve_coordinator`] over their end of the stream:
//! it publishes the peer's own descriptor and surfaces every descriptor set
//! the coordinator sends back.

use crate::error::{fold_codec_error, CoordinatorError};
use futures::{SinkExt, StreamExt};
use meshcoord_proto::{FrameCodec, Node, NodeSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Received descriptor sets buffered before the reader applies back-pressure
const UPDATE_BUFFER: usize = 16;

/// A running connection to a coordinator
pub struct PeerConnection {
    nodes: mpsc::UnboundedSender<Node>,
    updates: mpsc::Receiver<NodeSet>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), CoordinatorError>>,
}

impl PeerConnection {
    /// Queue this peer's current descriptor for publication
    pub fn send_node(&self, node: Node) -> Result<(), CoordinatorError> {
        self.nodes.send(node).map_err(|_| CoordinatorError::Closed)
    }

    /// Next descriptor set from the coordinator; `None` once the stream ends
    pub async fn recv(&mut self) -> Option<NodeSet> {
        self.updates.recv().await
    }

    /// Drop the stream, which the coordinator observes as a remote close
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait for the connection task to finish
    pub async fn wait(self) -> Result<(), CoordinatorError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(CoordinatorError::TaskFailed(e.to_string())),
        }
    }

    /// Close the stream and wait for the connection task
    pub async fn close_and_wait(self) -> Result<(), CoordinatorError> {
        self.close();
        self.wait().await
    }
}

/// Speak the peer side of the protocol over `stream`.
///
/// The returned connection resolves to `Ok(())` when the coordinator closes
/// the stream or [`PeerConnection::close`] is called, and to an error on a
/// malformed frame or unexpected I/O failure.
pub fn serve_coordinator<S>(stream: S) -> PeerConnection
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (node_tx, node_rx) = mpsc::unbounded_channel();
    let (update_tx, update_rx) = mpsc::channel(UPDATE_BUFFER);
    let cancel = CancellationToken::new();

    let task = tokio::spawn(run_peer(stream, node_rx, update_tx, cancel.clone()));

    PeerConnection {
        nodes: node_tx,
        updates: update_rx,
        cancel,
        task,
    }
}

async fn run_peer<S>(
    stream: S,
    mut nodes: mpsc::UnboundedReceiver<Node>,
    updates: mpsc::Sender<NodeSet>,
    cancel: CancellationToken,
) -> Result<(), CoordinatorError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, FrameCodec::<NodeSet>::new());
    let mut writer = FramedWrite::new(write_half, FrameCodec::<NodeSet>::new());
    let mut publishing = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Peer connection closed locally");
                return Ok(());
            }
            node = nodes.recv(), if publishing => match node {
                Some(node) => {
                    trace!(node_id = node.id, "Publishing own node");
                    if let Err(e) = writer.send(vec![node]).await {
                        return fold_codec_error(e);
                    }
                }
                None => publishing = false,
            },
            set = reader.next() => match set {
                Some(Ok(set)) => {
                    trace!(nodes = set.len(), "Received node set");
                    // A dropped receiver just means nobody is listening.
                    let _ = updates.send(set).await;
                }
                Some(Err(e)) => return fold_codec_error(e),
                None => {
                    debug!("Coordinator closed stream");
                    return Ok(());
                }
            },
        }
    }
}
