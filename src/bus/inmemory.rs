//! In-memory message bus over channels, for in-process clusters.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::traits::{BusError, MessageBus};
use crate::core::{Message, NodeId, Reply, SharedNode};

/// A request in flight to a node, with its reply channel.
pub struct BusRequest {
    pub message: Message,
    pub reply: oneshot::Sender<Reply>,
}

/// Bus endpoint for one node: senders to every other node's request
/// channel, with an optional per-request timeout.
pub struct InMemoryBus {
    senders: HashMap<NodeId, mpsc::Sender<BusRequest>>,
    timeout: Option<Duration>,
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn send(&self, to: &NodeId, message: Message) -> Result<Reply, BusError> {
        let sender = self.senders.get(to).ok_or(BusError::NodeNotFound)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(BusRequest {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BusError::ConnectionFailed)?;

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| BusError::Timeout)?
                .map_err(|_| BusError::ConnectionFailed),
            None => reply_rx.await.map_err(|_| BusError::ConnectionFailed),
        }
    }
}

/// Receiving side of a node's request channel.
pub struct NodeHandle {
    receiver: mpsc::Receiver<BusRequest>,
}

impl NodeHandle {
    /// Process one incoming request against a shared node. Returns
    /// false once the channel closes.
    pub async fn process_one(&mut self, node: &SharedNode) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                let reply = {
                    let mut node = node.lock().await;
                    node.handle_message(&request.message).await
                };
                // Storage errors abort the reply; the sender sees a
                // dropped message and retries later.
                if let Ok(reply) = reply {
                    let _ = request.reply.send(reply);
                }
                true
            }
            None => false,
        }
    }

    /// Serve requests until the channel closes.
    pub async fn serve(mut self, node: SharedNode) {
        while self.process_one(&node).await {}
    }
}

/// Create bus endpoints and request handles for a set of nodes.
pub fn create_cluster(
    node_ids: &[&str],
    timeout: Option<Duration>,
) -> (HashMap<NodeId, InMemoryBus>, HashMap<NodeId, NodeHandle>) {
    let mut senders: HashMap<NodeId, mpsc::Sender<BusRequest>> = HashMap::new();
    let mut handles: HashMap<NodeId, NodeHandle> = HashMap::new();

    for &id in node_ids {
        let (tx, rx) = mpsc::channel(32);
        senders.insert(id.to_string(), tx);
        handles.insert(id.to_string(), NodeHandle { receiver: rx });
    }

    let mut buses: HashMap<NodeId, InMemoryBus> = HashMap::new();
    for &id in node_ids {
        let other_senders = senders
            .iter()
            .filter(|(peer, _)| peer.as_str() != id)
            .map(|(peer, tx)| (peer.clone(), tx.clone()))
            .collect();
        buses.insert(
            id.to_string(),
            InMemoryBus {
                senders: other_senders,
                timeout,
            },
        );
    }

    (buses, handles)
}
