//! The Raft role state machine.
//!
//! One `RaftNode` per process, driven by one event at a time: an
//! inbound RPC, a client submission, a tick, or a bus response. The
//! caller (the server loop, or a test harness) owns that serialization;
//! handlers take `&mut self` and run to completion, so term and vote
//! updates are linearized. Handlers return the outbound messages they
//! produce instead of sending them, which keeps the node deterministic
//! and lets the bus adapter own cancellation.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::config::RaftConfig;
use super::messages::{
    AppendEntriesReq, AppendEntriesResp, ClientResponse, InstallSnapshotReq, InstallSnapshotResp,
    Message, MessageId, NodeId, Outbound, Reply, RequestVoteReq, RequestVoteResp,
};
use super::ticker::Ticker;
use crate::error::{Error, Result};
use crate::log::{AppendRequest, ClusterConfig, Command, CommandLog, LogEntry};
use crate::props::Properties;
use crate::state_machine::SharedStateMachine;

const CURRENT_TERM: &str = "currentTerm";
const VOTED_FOR: &str = "votedFor";

/// Node roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Installs a snapshot stream received from the leader. After a
/// successful install the command log is reopened from the repopulated
/// store; that reopen is the installer's responsibility.
#[async_trait]
pub trait Snapshotter: Send {
    async fn install(&mut self, data: &[u8]) -> Result<()>;
}

/// Context kept per outbound message so the matching response can be
/// interpreted, and so cancelled or late responses are discarded.
enum Outstanding {
    Vote { peer: NodeId },
    Append { peer: NodeId, last_sent: u64 },
}

pub struct RaftNode {
    id: NodeId,
    config: RaftConfig,
    role: Role,
    leader_id: Option<NodeId>,
    current_term: u64,
    voted_for: Option<NodeId>,
    props: Box<dyn Properties>,
    clog: Box<dyn CommandLog>,
    state_machine: SharedStateMachine,
    snapshotter: Option<Box<dyn Snapshotter>>,
    ticker: Ticker,
    /// Leader-only: next index to send to each peer.
    peer_indexes: HashMap<NodeId, u64>,
    outstanding: HashMap<MessageId, Outstanding>,
    votes_received: BTreeSet<NodeId>,
    next_message_id: MessageId,
    /// Leader-only: submissions waiting for their entry to commit.
    pending_submits: Vec<(u64, u64, oneshot::Sender<ClientResponse>)>,
}

impl RaftNode {
    /// Build a node over an opened properties store and command log,
    /// recovering `currentTerm` and `votedFor`. Starts as Follower.
    pub async fn new(
        id: NodeId,
        config: RaftConfig,
        props: Box<dyn Properties>,
        clog: Box<dyn CommandLog>,
        state_machine: SharedStateMachine,
    ) -> Result<Self> {
        let current_term = props
            .get(CURRENT_TERM)
            .await?
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or(0);
        let voted_for: Option<NodeId> = match props.get(VOTED_FOR).await? {
            Some(value) => serde_json::from_value(value)?,
            None => None,
        };
        let ticker = Ticker::new(&config);
        Ok(RaftNode {
            id,
            config,
            role: Role::Follower,
            leader_id: None,
            current_term,
            voted_for,
            props,
            clog,
            state_machine,
            snapshotter: None,
            ticker,
            peer_indexes: HashMap::new(),
            outstanding: HashMap::new(),
            votes_received: BTreeSet::new(),
            next_message_id: 0,
            pending_submits: Vec::new(),
        })
    }

    pub fn with_snapshotter(mut self, snapshotter: Box<dyn Snapshotter>) -> Self {
        self.snapshotter = Some(snapshotter);
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn commit_index(&self) -> u64 {
        self.state_machine.lock().commit_index()
    }

    pub fn cluster_config(&self) -> Option<ClusterConfig> {
        self.clog.cluster_config()
    }

    pub fn clog(&self) -> &dyn CommandLog {
        &*self.clog
    }

    /// Remaining ticks before the timer expires; settable for
    /// deterministic tests.
    pub fn set_leader_timeout(&mut self, ticks: u64) {
        self.ticker.set_timeout(ticks);
    }

    // === Persistence ===

    async fn persist(&mut self, term: u64, voted_for: Option<NodeId>) -> Result<()> {
        self.props
            .write(vec![
                (CURRENT_TERM.to_string(), json!(term)),
                (VOTED_FOR.to_string(), serde_json::to_value(&voted_for)?),
            ])
            .await?;
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    // === Role transitions ===

    /// Entering any role cancels all outstanding outbound messages;
    /// their responses, if they arrive, are discarded.
    fn cancel_outstanding(&mut self) {
        self.outstanding.clear();
    }

    fn become_follower(&mut self) {
        if self.role != Role::Follower {
            info!("node {} became follower in term {}", self.id, self.current_term);
        }
        self.role = Role::Follower;
        self.cancel_outstanding();
        self.votes_received.clear();
        self.ticker.reset_follower(&self.config);
        self.fail_pending_submits();
    }

    /// Observed a term beyond ours: adopt it, clear the vote and the
    /// leader, fall back to Follower.
    async fn step_down(&mut self, term: u64) -> Result<()> {
        self.persist(term, None).await?;
        self.leader_id = None;
        self.become_follower();
        Ok(())
    }

    async fn transition_to_candidate(&mut self) -> Result<Vec<Outbound>> {
        let config = self.clog.cluster_config().ok_or(Error::NotReady)?;
        let last = self.clog.last().ok_or(Error::NotReady)?;
        let term = self.current_term + 1;
        self.persist(term, Some(self.id.clone())).await?;
        self.role = Role::Candidate;
        self.leader_id = None;
        self.cancel_outstanding();
        self.votes_received.clear();
        if config.is_voting(&self.id) {
            self.votes_received.insert(self.id.clone());
        }
        self.ticker.reset_follower(&self.config);
        info!("node {} became candidate for term {}", self.id, term);

        if self.votes_received.len() >= config.majority() {
            return self.become_leader().await;
        }

        let req = RequestVoteReq {
            term,
            candidate_id: self.id.clone(),
            last_log_index: last.index,
            last_log_term: last.term,
        };
        let mut out = Vec::new();
        for peer in config.voting_ids() {
            if peer == self.id {
                continue;
            }
            let context = Outstanding::Vote { peer: peer.clone() };
            out.push(self.send(peer, Message::RequestVote(req.clone()), context));
        }
        Ok(out)
    }

    async fn become_leader(&mut self) -> Result<Vec<Outbound>> {
        let config = self.clog.cluster_config().ok_or(Error::NotReady)?;
        let last = self.clog.last().ok_or(Error::NotReady)?;
        self.role = Role::Leader;
        self.leader_id = Some(self.id.clone());
        self.cancel_outstanding();
        self.votes_received.clear();
        self.peer_indexes.clear();
        for peer in config.members.keys() {
            if *peer != self.id {
                self.peer_indexes.insert(peer.clone(), last.index + 1);
            }
        }
        self.ticker.reset_leader(&self.config);
        info!("node {} became leader for term {}", self.id, self.current_term);
        self.broadcast_append().await
    }

    // === Inbound RPCs ===

    pub async fn handle_request_vote(&mut self, req: &RequestVoteReq) -> Result<RequestVoteResp> {
        let mut ct = self.current_term;
        let mut vf = self.voted_for.clone();

        if req.term < ct {
            return Ok(RequestVoteResp {
                term: ct,
                vote_granted: false,
            });
        }

        let term_changed = req.term > ct;
        if term_changed {
            ct = req.term;
            vf = None;
        }

        let grant = if vf.as_ref() == Some(&req.candidate_id) {
            true
        } else if vf.is_some() {
            false
        } else {
            let last = self.clog.last().ok_or(Error::NotReady)?;
            last.term < req.last_log_term
                || (last.term == req.last_log_term && last.index <= req.last_log_index)
        };
        if grant {
            vf = Some(req.candidate_id.clone());
        }

        if grant || term_changed {
            self.persist(ct, vf).await?;
        }
        if term_changed {
            self.leader_id = None;
            if self.role != Role::Follower {
                self.become_follower();
            }
        }
        if grant {
            debug!("node {} voted for {} in term {}", self.id, req.candidate_id, ct);
            self.ticker.reset_follower(&self.config);
        }
        Ok(RequestVoteResp {
            term: ct,
            vote_granted: grant,
        })
    }

    pub async fn handle_append_entries(
        &mut self,
        req: &AppendEntriesReq,
    ) -> Result<AppendEntriesResp> {
        // A stale leader gets our term back and steps down.
        if req.term < self.current_term {
            return Ok(AppendEntriesResp {
                term: self.current_term,
                success: false,
            });
        }
        if req.term > self.current_term {
            self.persist(req.term, None).await?;
        }
        if self.role != Role::Follower {
            self.become_follower();
        }
        self.leader_id = Some(req.leader_id.clone());
        self.ticker.reset_follower(&self.config);

        let append = AppendRequest {
            term: req.term,
            prev_index: req.prev_log_index,
            prev_term: req.prev_log_term,
            entries: req.entries.clone(),
            commit_index: req.commit_index,
        };
        match self.clog.append(append).await {
            Ok(()) => {}
            // The leader retries at a lower prev_index.
            Err(Error::TermMismatch(_)) | Err(Error::InvalidIndex(_)) => {
                return Ok(AppendEntriesResp {
                    term: self.current_term,
                    success: false,
                });
            }
            Err(e) => return Err(e),
        }

        if req.commit_index > self.commit_index() {
            self.apply_through(req.commit_index)?;
        }
        Ok(AppendEntriesResp {
            term: self.current_term,
            success: true,
        })
    }

    pub async fn handle_install_snapshot(
        &mut self,
        req: &InstallSnapshotReq,
    ) -> Result<InstallSnapshotResp> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResp {
                term: self.current_term,
                success: false,
            });
        }
        if req.term > self.current_term {
            self.persist(req.term, None).await?;
        }
        if self.role != Role::Follower {
            self.become_follower();
        }
        self.leader_id = Some(req.leader_id.clone());
        self.ticker.reset_follower(&self.config);

        let snapshotter = self
            .snapshotter
            .as_mut()
            .ok_or_else(|| Error::Internal("no snapshot installer configured".to_string()))?;
        snapshotter.install(&req.data).await?;
        Ok(InstallSnapshotResp {
            term: self.current_term,
            success: true,
        })
    }

    /// Dispatch an inbound request envelope and produce the reply.
    pub async fn handle_message(&mut self, message: &Message) -> Result<Reply> {
        match message {
            Message::AppendEntries(req) => {
                Ok(Reply::AppendEntries(self.handle_append_entries(req).await?))
            }
            Message::RequestVote(req) => {
                Ok(Reply::RequestVote(self.handle_request_vote(req).await?))
            }
            Message::InstallSnapshot(req) => Ok(Reply::InstallSnapshot(
                self.handle_install_snapshot(req).await?,
            )),
        }
    }

    // === Responses ===

    /// Process a bus response. Responses whose message id is no longer
    /// outstanding (cancelled by a role change, or duplicated) are
    /// dropped.
    pub async fn handle_reply(&mut self, id: MessageId, reply: Reply) -> Result<Vec<Outbound>> {
        let Some(context) = self.outstanding.remove(&id) else {
            debug!("node {} discarding response for cancelled message {}", self.id, id);
            return Ok(Vec::new());
        };
        match (context, reply) {
            (Outstanding::Vote { peer }, Reply::RequestVote(resp)) => {
                self.handle_vote_response(peer, resp).await
            }
            (Outstanding::Append { peer, last_sent }, Reply::AppendEntries(resp)) => {
                self.handle_append_response(peer, last_sent, resp).await
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn handle_vote_response(
        &mut self,
        peer: NodeId,
        resp: RequestVoteResp,
    ) -> Result<Vec<Outbound>> {
        if resp.term > self.current_term {
            self.step_down(resp.term).await?;
            return Ok(Vec::new());
        }
        if self.role != Role::Candidate || !resp.vote_granted {
            return Ok(Vec::new());
        }
        let config = self.clog.cluster_config().ok_or(Error::NotReady)?;
        if !config.is_voting(&peer) {
            return Ok(Vec::new());
        }
        self.votes_received.insert(peer);
        if self.votes_received.len() >= config.majority() {
            return self.become_leader().await;
        }
        Ok(Vec::new())
    }

    async fn handle_append_response(
        &mut self,
        peer: NodeId,
        last_sent: u64,
        resp: AppendEntriesResp,
    ) -> Result<Vec<Outbound>> {
        if resp.term > self.current_term {
            self.step_down(resp.term).await?;
            return Ok(Vec::new());
        }
        if self.role != Role::Leader {
            return Ok(Vec::new());
        }
        if !resp.success {
            // Walk back and retry at a lower prev_index. Index 0 is
            // the sentinel, so 1 is the floor.
            let next = self.peer_indexes.get(&peer).copied().unwrap_or(1);
            self.peer_indexes
                .insert(peer.clone(), next.saturating_sub(1).max(1));
            let retry = self.append_for(&peer).await?;
            return Ok(vec![retry]);
        }
        self.peer_indexes.insert(peer.clone(), last_sent + 1);
        self.advance_commit()?;
        Ok(Vec::new())
    }

    // === Client submissions ===

    /// Append a command locally and trigger replication. The returned
    /// receiver resolves once the entry commits, or with
    /// `success = false` if leadership is lost first.
    pub async fn client_request(
        &mut self,
        command: Command,
    ) -> Result<(oneshot::Receiver<ClientResponse>, Vec<Outbound>)> {
        if self.role != Role::Leader {
            return Err(Error::NotLeader {
                leader_hint: self.leader_id.clone(),
            });
        }
        let last = self.clog.last().ok_or(Error::NotReady)?;
        let index = last.index + 1;
        let term = self.current_term;
        let entry = LogEntry {
            index,
            term,
            command,
        };
        let commit_index = self.commit_index();
        self.clog
            .append(AppendRequest {
                term,
                prev_index: last.index,
                prev_term: last.term,
                entries: vec![entry],
                commit_index,
            })
            .await?;

        let (tx, rx) = oneshot::channel();
        self.pending_submits.push((index, term, tx));
        let out = self.broadcast_append().await?;
        // A single-voter cluster commits on the local append alone.
        self.advance_commit()?;
        Ok((rx, out))
    }

    // === Ticks ===

    /// Advance the timer. Expiry starts an election on non-leaders and
    /// fires the heartbeat/replication round on the leader.
    pub async fn tick(&mut self) -> Result<Vec<Outbound>> {
        if !self.ticker.tick() {
            return Ok(Vec::new());
        }
        match self.role {
            Role::Leader => {
                self.ticker.reset_leader(&self.config);
                self.broadcast_append().await
            }
            Role::Follower | Role::Candidate => self.transition_to_candidate().await,
        }
    }

    // === Replication driver ===

    /// Build one AppendEntries round for every peer in the current
    /// membership; demoted peers still receive entries.
    async fn broadcast_append(&mut self) -> Result<Vec<Outbound>> {
        let config = self.clog.cluster_config().ok_or(Error::NotReady)?;
        let mut out = Vec::new();
        for peer in config.members.keys() {
            if *peer == self.id {
                continue;
            }
            out.push(self.append_for(peer).await?);
        }
        Ok(out)
    }

    async fn append_for(&mut self, peer: &NodeId) -> Result<Outbound> {
        let last = self.clog.last().ok_or(Error::NotReady)?;
        let next = *self
            .peer_indexes
            .entry(peer.clone())
            .or_insert(last.index + 1);
        let prev_index = next - 1;
        let prev_term = self
            .clog
            .entry(prev_index)
            .await?
            .map(|e| e.term)
            .unwrap_or(0);
        let entries: Vec<LogEntry> = self.clog.slice(next, None)?.collect::<Result<_>>()?;
        let last_sent = entries.last().map(|e| e.index).unwrap_or(prev_index);
        let req = AppendEntriesReq {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries,
            commit_index: self.commit_index(),
        };
        let context = Outstanding::Append {
            peer: peer.clone(),
            last_sent,
        };
        Ok(self.send(peer.clone(), Message::AppendEntries(req), context))
    }

    /// Commit the highest index a majority of voting members has
    /// stored, then execute the newly committed range.
    fn advance_commit(&mut self) -> Result<()> {
        let config = self.clog.cluster_config().ok_or(Error::NotReady)?;
        let last = self.clog.last().ok_or(Error::NotReady)?;
        let mut matched: Vec<u64> = config
            .voting_ids()
            .into_iter()
            .map(|id| {
                if id == self.id {
                    last.index
                } else {
                    self.peer_indexes
                        .get(&id)
                        .map(|next| next.saturating_sub(1))
                        .unwrap_or(0)
                }
            })
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let majority = config.majority();
        if matched.len() < majority {
            return Ok(());
        }
        let n = matched[majority - 1];
        if n > self.commit_index() {
            self.apply_through(n)?;
        }
        Ok(())
    }

    /// Execute `(commit_index, n]` on the state machine in order, then
    /// resolve client submissions waiting at or below `n`.
    fn apply_through(&mut self, n: u64) -> Result<()> {
        {
            let mut sm = self.state_machine.lock();
            let from = sm.commit_index() + 1;
            if n < from {
                return Ok(());
            }
            let entries: Vec<LogEntry> =
                self.clog.slice(from, Some(n + 1))?.collect::<Result<_>>()?;
            sm.execute(&entries)?;
        }
        debug!("node {} committed through {}", self.id, n);

        let leader_id = self.leader_id.clone();
        let resolved = self
            .pending_submits
            .iter()
            .position(|(index, _, _)| *index > n)
            .unwrap_or(self.pending_submits.len());
        for (index, term, tx) in self.pending_submits.drain(..resolved) {
            let _ = tx.send(ClientResponse {
                leader_id: leader_id.clone(),
                entry_term: term,
                entry_index: index,
                success: true,
            });
        }
        Ok(())
    }

    /// Leadership lost with submissions in flight: answer them with the
    /// best-known leader so clients can redirect.
    fn fail_pending_submits(&mut self) {
        for (index, term, tx) in self.pending_submits.drain(..) {
            let _ = tx.send(ClientResponse {
                leader_id: self.leader_id.clone(),
                entry_term: term,
                entry_index: index,
                success: false,
            });
        }
    }

    fn send(&mut self, to: NodeId, message: Message, context: Outstanding) -> Outbound {
        self.next_message_id += 1;
        let id = self.next_message_id;
        self.outstanding.insert(id, context);
        Outbound { id, to, message }
    }
}
