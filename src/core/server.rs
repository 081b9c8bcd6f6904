//! Event loop serializing everything that touches the node.
//!
//! One mailbox per node: client submissions, bus responses, and timer
//! ticks all funnel through `run`, and inbound RPCs lock the same
//! shared node, so term and vote updates are linearized. Outbound
//! messages go through the bus adapter, which cancels in-flight sends
//! when the node changes role.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::warn;

use super::config::RaftConfig;
use super::messages::{ClientResponse, MessageId, Outbound, Reply};
use super::node::{RaftNode, Role};
use crate::bus::{BusAdapter, MessageBus};
use crate::error::{Error, Result};
use crate::log::Command;

/// Shared reference to the node, used by the RPC surface.
pub type SharedNode = Arc<Mutex<RaftNode>>;

enum ServerCommand {
    Submit {
        command: Command,
        reply: oneshot::Sender<Result<ClientResponse>>,
    },
}

/// Handle for interacting with a running server.
#[derive(Clone)]
pub struct RaftHandle {
    command_tx: mpsc::Sender<ServerCommand>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RaftHandle {
    /// Submit a command; resolves once the entry commits.
    pub async fn submit(&self, command: Command) -> Result<ClientResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ServerCommand::Submit {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotLeader { leader_hint: None })?;
        reply_rx
            .await
            .map_err(|_| Error::NotLeader { leader_hint: None })?
    }

    /// Shut the server down gracefully.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

pub struct RaftServer {
    node: SharedNode,
    adapter: BusAdapter,
    responses_rx: mpsc::Receiver<(MessageId, Reply)>,
    command_rx: mpsc::Receiver<ServerCommand>,
    command_tx: mpsc::Sender<ServerCommand>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    config: RaftConfig,
    last_role: Role,
}

impl RaftServer {
    /// Wrap a node. Returns the server and the shared node the RPC
    /// surface hands inbound requests to.
    pub fn new(node: RaftNode, bus: Arc<dyn MessageBus>, config: RaftConfig) -> (Self, SharedNode) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (responses_tx, responses_rx) = mpsc::channel(128);
        let adapter = BusAdapter::new(bus, responses_tx);
        let node = Arc::new(Mutex::new(node));
        let shared = node.clone();
        let server = RaftServer {
            node,
            adapter,
            responses_rx,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            config,
            last_role: Role::Follower,
        };
        (server, shared)
    }

    /// Start the event loop and return a client handle.
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        };
        tokio::spawn(self.run());
        handle
    }

    async fn run(mut self) {
        let mut ticks = interval(self.config.tick_interval);
        // Delay behavior keeps a stalled loop from bursting ticks.
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                }
                Some((id, reply)) = self.responses_rx.recv() => {
                    let out = {
                        let mut node = self.node.lock().await;
                        node.handle_reply(id, reply).await.unwrap_or_else(|e| {
                            warn!("response handling failed: {e}");
                            Vec::new()
                        })
                    };
                    self.after_event(out).await;
                }
                _ = ticks.tick() => {
                    let out = {
                        let mut node = self.node.lock().await;
                        node.tick().await.unwrap_or_else(|e| {
                            warn!("tick failed: {e}");
                            Vec::new()
                        })
                    };
                    self.after_event(out).await;
                }
                else => break,
            }
        }
    }

    async fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Submit { command, reply } => {
                let result = {
                    let mut node = self.node.lock().await;
                    node.client_request(command).await
                };
                match result {
                    Ok((committed_rx, out)) => {
                        self.after_event(out).await;
                        // Reply from a task so a slow commit cannot
                        // stall the mailbox.
                        tokio::spawn(async move {
                            let response = committed_rx
                                .await
                                .map_err(|_| Error::NotLeader { leader_hint: None });
                            let _ = reply.send(response);
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    /// Dispatch new outbound messages, cancelling in-flight sends first
    /// when the event changed the node's role.
    async fn after_event(&mut self, out: Vec<Outbound>) {
        let role = self.node.lock().await.role();
        if role != self.last_role {
            self.adapter.cancel_all();
            self.last_role = role;
        }
        self.adapter.dispatch(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::bus::{create_cluster, NodeHandle};
    use crate::core::NodeId;
    use crate::log::{MemoryLog, Peer};
    use crate::props::MemoryProps;
    use crate::state_machine::{shared_register, SharedRegister};

    fn members(ids: &[&str]) -> BTreeMap<NodeId, Peer> {
        ids.iter()
            .map(|id| (id.to_string(), Peer::voting()))
            .collect()
    }

    async fn test_node(id: &str, ids: &[&str], config: &RaftConfig) -> (RaftNode, SharedRegister) {
        let register = shared_register();
        let log = MemoryLog::open(register.clone(), Some(members(ids)));
        let node = RaftNode::new(
            id.to_string(),
            config.clone(),
            Box::new(MemoryProps::ready()),
            Box::new(log),
            register.clone(),
        )
        .await
        .unwrap();
        (node, register)
    }

    fn spawn_peer(
        handles: &mut std::collections::HashMap<NodeId, NodeHandle>,
        id: &str,
        node: RaftNode,
    ) -> SharedNode {
        let shared: SharedNode = Arc::new(Mutex::new(node));
        let handle = handles.remove(id).unwrap();
        tokio::spawn(handle.serve(shared.clone()));
        shared
    }

    #[tokio::test]
    async fn test_submit_rejected_on_follower() {
        let config = RaftConfig::default();
        let ids = ["r0", "r1", "r2"];
        let (mut buses, _handles) = create_cluster(&ids, None);
        let (node, _) = test_node("r0", &ids, &config).await;

        let bus: Arc<dyn MessageBus> = Arc::new(buses.remove("r0").unwrap());
        let (server, _shared) = RaftServer::new(node, bus, config);
        let handle = server.start();

        let result = handle.submit(Command::User("foo".to_string())).await;
        assert!(matches!(result, Err(Error::NotLeader { .. })));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_election_and_submit_through_server() {
        let config = RaftConfig::default()
            .with_tick_range(3, 4)
            .with_tick_interval(Duration::from_millis(10));
        let ids = ["r0", "r1", "r2"];
        let (mut buses, mut handles) = create_cluster(&ids, None);

        let (node0, register0) = test_node("r0", &ids, &config).await;
        let (node1, register1) = test_node("r1", &ids, &config).await;
        let (node2, _register2) = test_node("r2", &ids, &config).await;

        let bus0: Arc<dyn MessageBus> = Arc::new(buses.remove("r0").unwrap());
        let (server, shared0) = RaftServer::new(node0, bus0, config.clone());
        let handle = server.start();

        let _shared1 = spawn_peer(&mut handles, "r1", node1);
        let _shared2 = spawn_peer(&mut handles, "r2", node2);

        // Let the ticker drive r0 through an election.
        for _ in 0..20 {
            tokio::time::advance(config.tick_interval).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(shared0.lock().await.role(), Role::Leader);

        let response = handle.submit(Command::User("foo".to_string())).await.unwrap();
        assert_eq!(response.leader_id, Some("r0".to_string()));
        assert_eq!(response.entry_index, 1);
        assert!(response.success);
        assert_eq!(register0.lock().data(), Some("foo".to_string()));

        // Followers execute once a later heartbeat carries the commit.
        for _ in 0..10 {
            tokio::time::advance(config.tick_interval).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(register1.lock().data(), Some("foo".to_string()));

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_election_before_timeout() {
        let config = RaftConfig::default()
            .with_tick_range(3, 4)
            .with_tick_interval(Duration::from_millis(10));
        let ids = ["r0", "r1"];
        let (mut buses, _handles) = create_cluster(&ids, None);
        let (node, _) = test_node("r0", &ids, &config).await;

        let bus: Arc<dyn MessageBus> = Arc::new(buses.remove("r0").unwrap());
        let (server, shared) = RaftServer::new(node, bus, config.clone());
        let handle = server.start();

        // Two ticks stay below the 3-tick minimum timeout.
        for _ in 0..2 {
            tokio::time::advance(config.tick_interval).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(shared.lock().await.role(), Role::Follower);
        assert_eq!(shared.lock().await.current_term(), 0);

        handle.shutdown().await;
    }
}
