//! Testing utilities for cluster integration tests.
//!
//! `TestCluster` runs an in-process cluster deterministically: nodes
//! are driven by explicit ticks, messages route through an ordered
//! queue with link-level partitions, and every delivery runs to
//! quiescence before `tick` returns. No timers, no real transport.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tokio::sync::oneshot;

use crate::core::{
    ClientResponse, MessageId, NodeId, Outbound, RaftConfig, RaftNode, Reply, Role,
};
use crate::error::Result;
use crate::log::{Command, MemoryLog, Peer};
use crate::props::MemoryProps;
use crate::state_machine::{shared_register, SharedRegister};

/// A queued message: a request on its way to a peer, or a reply on its
/// way back.
enum Envelope {
    Request { from: NodeId, outbound: Outbound },
    Reply { from: NodeId, to: NodeId, id: MessageId, reply: Reply },
}

pub struct TestNode {
    pub node: RaftNode,
    pub register: SharedRegister,
}

pub struct TestCluster {
    pub nodes: BTreeMap<NodeId, TestNode>,
    queue: VecDeque<Envelope>,
    /// Partition groups; messages cross only within a group.
    groups: Option<HashMap<NodeId, usize>>,
}

impl TestCluster {
    /// Create a cluster of voting members over in-memory stores.
    pub async fn new(ids: &[&str]) -> Self {
        let members: BTreeMap<NodeId, Peer> = ids
            .iter()
            .map(|id| (id.to_string(), Peer::voting()))
            .collect();

        let mut nodes = BTreeMap::new();
        for &id in ids {
            let register = shared_register();
            let log = MemoryLog::open(register.clone(), Some(members.clone()));
            let node = RaftNode::new(
                id.to_string(),
                RaftConfig::default(),
                Box::new(MemoryProps::ready()),
                Box::new(log),
                register.clone(),
            )
            .await
            .expect("node construction");
            nodes.insert(id.to_string(), TestNode { node, register });
        }
        TestCluster {
            nodes,
            queue: VecDeque::new(),
            groups: None,
        }
    }

    pub fn node(&self, id: &str) -> &RaftNode {
        &self.nodes[id].node
    }

    pub fn node_mut(&mut self, id: &str) -> &mut RaftNode {
        &mut self.nodes.get_mut(id).expect("unknown node").node
    }

    /// Last applied user payload on a node's state machine.
    pub fn data(&self, id: &str) -> Option<String> {
        self.nodes[id].register.lock().data()
    }

    /// Split the cluster. Every node in a listed group talks only to
    /// its group; unlisted nodes form one residual group together.
    pub fn partition(&mut self, groups: &[&[&str]]) {
        let mut assignment = HashMap::new();
        for (index, group) in groups.iter().enumerate() {
            for &id in *group {
                assignment.insert(id.to_string(), index);
            }
        }
        for id in self.nodes.keys() {
            if !assignment.contains_key(id) {
                assignment.insert(id.clone(), groups.len());
            }
        }
        self.groups = Some(assignment);
    }

    /// Remove all partitions.
    pub fn heal(&mut self) {
        self.groups = None;
    }

    fn connected(&self, a: &str, b: &str) -> bool {
        match &self.groups {
            None => true,
            Some(groups) => groups.get(a) == groups.get(b),
        }
    }

    /// Advance every node's timer by one tick, then deliver messages
    /// until the cluster goes quiet.
    pub async fn tick(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        for id in ids {
            let out = {
                let node = &mut self.nodes.get_mut(&id).unwrap().node;
                node.tick().await.unwrap_or_default()
            };
            self.enqueue(&id, out);
        }
        self.pump().await;
    }

    pub async fn tick_n(&mut self, n: usize) {
        for _ in 0..n {
            self.tick().await;
        }
    }

    /// Tick until `predicate` holds, up to `max` ticks. Returns whether
    /// it held.
    pub async fn tick_until<F>(&mut self, max: usize, predicate: F) -> bool
    where
        F: Fn(&TestCluster) -> bool,
    {
        for _ in 0..max {
            if predicate(self) {
                return true;
            }
            self.tick().await;
        }
        predicate(self)
    }

    /// Force `id` to win an election on the next ticks.
    pub async fn elect(&mut self, id: &str) {
        self.node_mut(id).set_leader_timeout(1);
        let won = self
            .tick_until(20, |cluster| cluster.node(id).role() == Role::Leader)
            .await;
        assert!(won, "{id} failed to win an election");
    }

    /// Submit a command to `id`; the receiver resolves when the entry
    /// commits. Delivery of the replication round happens before this
    /// returns.
    pub async fn submit(
        &mut self,
        id: &str,
        command: Command,
    ) -> Result<oneshot::Receiver<ClientResponse>> {
        let (rx, out) = {
            let node = &mut self.nodes.get_mut(id).expect("unknown node").node;
            node.client_request(command).await?
        };
        self.enqueue(id, out);
        self.pump().await;
        Ok(rx)
    }

    /// The leader each node currently believes in.
    pub fn leader_view(&self) -> BTreeMap<NodeId, Option<NodeId>> {
        self.nodes
            .iter()
            .map(|(id, n)| (id.clone(), n.node.leader_id().cloned()))
            .collect()
    }

    /// No two nodes may consider themselves leader in the same term.
    pub fn assert_single_leader_per_term(&self) {
        let mut leaders: HashMap<u64, NodeId> = HashMap::new();
        for (id, n) in &self.nodes {
            if n.node.role() == Role::Leader {
                if let Some(other) = leaders.insert(n.node.current_term(), id.clone()) {
                    panic!(
                        "two leaders in term {}: {other} and {id}",
                        n.node.current_term()
                    );
                }
            }
        }
    }

    fn enqueue(&mut self, from: &str, out: Vec<Outbound>) {
        for outbound in out {
            self.queue.push_back(Envelope::Request {
                from: from.to_string(),
                outbound,
            });
        }
    }

    /// Deliver queued messages in order until none remain. Messages
    /// crossing a partition are dropped.
    async fn pump(&mut self) {
        while let Some(envelope) = self.queue.pop_front() {
            match envelope {
                Envelope::Request { from, outbound } => {
                    let Outbound { id, to, message } = outbound;
                    if !self.connected(&from, &to) || !self.nodes.contains_key(&to) {
                        continue;
                    }
                    let reply = {
                        let node = &mut self.nodes.get_mut(&to).unwrap().node;
                        node.handle_message(&message).await
                    };
                    // A failed handler drops the message; the sender
                    // retries off its ticker.
                    if let Ok(reply) = reply {
                        self.queue.push_back(Envelope::Reply {
                            from: to,
                            to: from,
                            id,
                            reply,
                        });
                    }
                }
                Envelope::Reply { from, to, id, reply } => {
                    if !self.connected(&from, &to) || !self.nodes.contains_key(&to) {
                        continue;
                    }
                    let out = {
                        let node = &mut self.nodes.get_mut(&to).unwrap().node;
                        node.handle_reply(id, reply).await.unwrap_or_default()
                    };
                    self.enqueue(&to, out);
                }
            }
        }
    }
}
