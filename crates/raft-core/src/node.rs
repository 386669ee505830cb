//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs/meta.rs for durability, client.rs for peers
//! what: NodeState enum, RaftCore (timing loop, elections, replication, inbound handlers)
//!
//! all mutable node state, the peer table included, lives behind one
//! `parking_lot::RwLock`. every entry point (timer fire, inbound rpc, fan-out
//! callback) takes the lock for its whole read-modify-write and releases it
//! before any `.await`. outbound rpcs run on their own spawned tasks, and their
//! responses are checked against the current term and role before being folded in.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use raft_storage::{FileKvStore, KvStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::{PeerClient, PeerTable};
use crate::log::{LogEntry, RaftLog};
use crate::message::{AppendEntryRequest, AppendEntryResponse, VoteRequest, VoteResponse};
use crate::meta::{MetaStore, PersistentState};
use crate::timer::{ElectionDelay, RandomDelay};
use crate::transport::{Connector, RaftService};
use crate::{RaftConfig, RaftError, Result};

/// peer ids index per-peer arrays directly, so keep them small
const MAX_PEER_ID: u64 = 1024;

/// the three possible states a raft node can be in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// transitional state - requesting votes to become leader
    Candidate,
    /// active state - manages log replication, sends heartbeats
    Leader,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// leader-side state of the replication task for one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Replication {
    #[default]
    Idle,
    Running,
    /// another round was asked for while one was running
    Pending,
}

/// point-in-time view of a node, for operators and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: u64,
    pub role: NodeState,
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub leader_id: Option<u64>,
    pub count_vote: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub first_index: u64,
    pub last_index: u64,
    pub last_term: u64,
    pub dead: bool,
}

/// everything guarded by the node lock
struct RaftState {
    role: NodeState,
    persistent: PersistentState,
    leader_id: Option<u64>,
    count_vote: u64,
    commit_index: u64,
    /// indexed by peer id, meaningful only while leader
    next_index: Vec<u64>,
    match_index: Vec<u64>,
    /// at most one replication task per peer
    replication: Vec<Replication>,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    log: RaftLog,
    meta: MetaStore,
    peers: PeerTable,
}

impl RaftState {
    fn majority_reached(&self) -> bool {
        self.count_vote > self.peers.len() as u64 / 2
    }

    /// candidate's log is at least as up to date as ours
    fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> Result<bool> {
        let our_term = self.log.last_term()?;
        let our_index = self.log.last_index();
        Ok(last_log_term > our_term || (last_log_term == our_term && last_log_index >= our_index))
    }
}

struct Inner {
    id: u64,
    config: RaftConfig,
    delay: Arc<dyn ElectionDelay>,
    connector: Arc<dyn Connector>,
    state: RwLock<RaftState>,
    /// wakes the timing loop after a role change or shutdown
    wake: Notify,
    dead: AtomicBool,
    commit_tx: watch::Sender<u64>,
}

/// a single raft node
///
/// cheap to clone; clones share the same node.
#[derive(Clone)]
pub struct RaftCore {
    inner: Arc<Inner>,
}

/// construction interface for the process layer: node id, membership, engine
pub struct RaftCoreBuilder {
    id: u64,
    peers: BTreeMap<u64, String>,
    config: RaftConfig,
    engine: Option<Arc<dyn KvStore>>,
    engine_dir: Option<PathBuf>,
    connector: Option<Arc<dyn Connector>>,
    delay: Option<Arc<dyn ElectionDelay>>,
}

impl RaftCoreBuilder {
    pub fn config(mut self, config: RaftConfig) -> Self {
        self.config = config;
        self
    }

    /// use an already opened engine
    pub fn engine(mut self, engine: Arc<dyn KvStore>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// open a file engine rooted at `dir` during `build`
    pub fn engine_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.engine_dir = Some(dir.into());
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// replace the randomized election delay, mostly for deterministic tests
    pub fn election_delay(mut self, delay: Arc<dyn ElectionDelay>) -> Self {
        self.delay = Some(delay);
        self
    }

    /// recover persisted state, dial peers and return a follower
    ///
    /// failing to open the engine or read its state aborts construction; failing
    /// to reach a peer does not.
    pub async fn build(self) -> Result<RaftCore> {
        self.config.validate()?;
        if !self.peers.contains_key(&self.id) {
            return Err(RaftError::Config(format!(
                "node {} is not in its own membership map",
                self.id
            )));
        }
        if let Some(max) = self.peers.keys().next_back().filter(|max| **max > MAX_PEER_ID) {
            return Err(RaftError::Config(format!(
                "peer id {max} exceeds the limit of {MAX_PEER_ID}"
            )));
        }
        let connector = self
            .connector
            .ok_or_else(|| RaftError::Config("no connector configured".into()))?;
        let engine: Arc<dyn KvStore> = match (self.engine, self.engine_dir) {
            (Some(engine), _) => engine,
            (None, Some(dir)) => Arc::new(FileKvStore::open(dir)?),
            (None, None) => return Err(RaftError::Config("no storage engine configured".into())),
        };
        let delay: Arc<dyn ElectionDelay> = match self.delay {
            Some(delay) => delay,
            None => Arc::new(RandomDelay::from_config(&self.config)),
        };

        let log = RaftLog::open(engine.clone())?;
        let meta = MetaStore::new(engine);
        let persistent = meta.load()?;
        let peers = PeerTable::dial(&self.peers, self.id, connector.as_ref()).await;

        let now = Instant::now();
        let slots = peers.capacity();
        let state = RaftState {
            role: NodeState::Follower,
            persistent,
            leader_id: None,
            count_vote: 0,
            commit_index: 0,
            next_index: vec![0; slots],
            match_index: vec![0; slots],
            replication: vec![Replication::Idle; slots],
            election_deadline: now + delay.next_election_delay(),
            heartbeat_deadline: now,
            log,
            meta,
            peers,
        };

        tracing::info!(
            node_id = self.id,
            term = persistent.current_term,
            voted_for = ?persistent.voted_for,
            last_index = state.log.last_index(),
            members = state.peers.len(),
            "raft node recovered"
        );

        let (commit_tx, _) = watch::channel(0);
        Ok(RaftCore {
            inner: Arc::new(Inner {
                id: self.id,
                config: self.config,
                delay,
                connector,
                state: RwLock::new(state),
                wake: Notify::new(),
                dead: AtomicBool::new(false),
                commit_tx,
            }),
        })
    }
}

impl RaftCore {
    /// start configuring node `id` of the cluster described by `peers` (id -> address, self included)
    pub fn builder(id: u64, peers: BTreeMap<u64, String>) -> RaftCoreBuilder {
        RaftCoreBuilder {
            id,
            peers,
            config: RaftConfig::default(),
            engine: None,
            engine_dir: None,
            connector: None,
            delay: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_dead(&self) -> bool {
        self.inner.dead.load(Ordering::Acquire)
    }

    /// mark the node dead; terminal, the timing loop exits and handlers refuse work
    pub fn kill(&self) {
        self.inner.dead.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }

    pub fn is_leader(&self) -> bool {
        self.inner.state.read().role == NodeState::Leader
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.inner.state.read();
        NodeStatus {
            id: self.inner.id,
            role: state.role,
            current_term: state.persistent.current_term,
            voted_for: state.persistent.voted_for,
            leader_id: state.leader_id,
            count_vote: state.count_vote,
            commit_index: state.commit_index,
            applied_index: state.persistent.applied_index,
            first_index: state.log.first_index(),
            last_index: state.log.last_index(),
            last_term: state.log.last_term().unwrap_or(0),
            dead: self.is_dead(),
        }
    }

    /// leader-side `(next_index, match_index)` for `peer`, None unless leader
    pub fn progress(&self, peer: u64) -> Option<(u64, u64)> {
        let state = self.inner.state.read();
        if state.role != NodeState::Leader || peer == self.inner.id {
            return None;
        }
        state.peers.get(peer)?;
        let slot = peer as usize;
        Some((state.next_index[slot], state.match_index[slot]))
    }

    /// read `[first, last]` of this node's log
    pub fn log_entries(&self, first: u64, last: u64) -> Result<Vec<LogEntry>> {
        self.inner.state.read().log.get_entries(first, last)
    }

    /// observe commit index advances
    pub fn subscribe_commit(&self) -> watch::Receiver<u64> {
        self.inner.commit_tx.subscribe()
    }

    /// record that the layer above applied everything up to `index`
    pub fn record_applied(&self, index: u64) -> Result<()> {
        let mut state = self.inner.state.write();
        self.ensure_alive()?;
        let index = index.min(state.commit_index);
        if index <= state.persistent.applied_index {
            return Ok(());
        }
        state.persistent.applied_index = index;
        self.persist(&state)
    }

    /// start the timing loop on the current tokio runtime
    pub fn spawn(&self) -> JoinHandle<()> {
        tokio::spawn(self.clone().run())
    }

    /// drive election and heartbeat timers until the node is killed
    pub async fn run(self) {
        tracing::info!(node_id = self.inner.id, "timing loop started");
        while !self.is_dead() {
            let (role, election_at, heartbeat_at) = {
                let state = self.inner.state.read();
                (state.role, state.election_deadline, state.heartbeat_deadline)
            };

            tokio::select! {
                _ = tokio::time::sleep_until(election_at), if role != NodeState::Leader => {
                    self.on_election_timeout();
                }
                _ = tokio::time::sleep_until(heartbeat_at), if role == NodeState::Leader => {
                    self.on_heartbeat_timeout();
                }
                _ = self.inner.wake.notified() => {}
            }
        }
        tracing::info!(node_id = self.inner.id, "timing loop stopped");
    }

    fn on_election_timeout(&self) {
        {
            let state = self.inner.state.read();
            // the deadline moved while we slept, or we won meanwhile
            if state.role == NodeState::Leader || Instant::now() < state.election_deadline {
                return;
            }
        }
        tracing::info!(node_id = self.inner.id, "election timeout, starting election");
        if let Err(e) = self.campaign() {
            tracing::error!(node_id = self.inner.id, error = %e, "failed to start election");
        }
    }

    fn on_heartbeat_timeout(&self) {
        {
            let mut state = self.inner.state.write();
            if state.role != NodeState::Leader || Instant::now() < state.heartbeat_deadline {
                return;
            }
            state.heartbeat_deadline = Instant::now() + self.inner.config.heartbeat();
        }
        self.broadcast_append();
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_dead() {
            return Err(RaftError::Dead(self.inner.id));
        }
        Ok(())
    }

    /// a write that cannot be made durable stops the node: it may not claim a vote or term it did not persist
    fn fail_stop(&self, err: RaftError) -> RaftError {
        tracing::error!(node_id = self.inner.id, error = %err, "persistence failure, stopping node");
        self.kill();
        err
    }

    fn persist(&self, state: &RaftState) -> Result<()> {
        state
            .meta
            .save(&state.persistent)
            .map_err(|e| self.fail_stop(e))
    }

    fn reset_election_timer(&self, state: &mut RaftState) {
        state.election_deadline = Instant::now() + self.inner.delay.next_election_delay();
    }

    /// move to follower at `term` (never lower than the current term)
    fn become_follower(&self, state: &mut RaftState, term: u64, leader: Option<u64>) -> Result<()> {
        debug_assert!(term >= state.persistent.current_term);
        let previous = (state.role, state.persistent.current_term);
        if term > state.persistent.current_term {
            state.persistent.current_term = term;
            state.persistent.voted_for = None;
        }
        state.role = NodeState::Follower;
        state.leader_id = leader;
        state.count_vote = 0;
        self.reset_election_timer(state);
        self.persist(state)?;

        if previous != (NodeState::Follower, term) {
            tracing::info!(
                node_id = self.inner.id,
                from = %previous.0,
                old_term = previous.1,
                term,
                leader = ?leader,
                "became follower"
            );
            self.inner.wake.notify_one();
        }
        Ok(())
    }

    fn become_leader(&self, state: &mut RaftState) -> Result<()> {
        state.role = NodeState::Leader;
        state.leader_id = Some(self.inner.id);
        let next = state.log.last_index() + 1;
        state.next_index.iter_mut().for_each(|n| *n = next);
        state.match_index.iter_mut().for_each(|m| *m = 0);
        state.replication.iter_mut().for_each(|r| *r = Replication::Idle);
        state.heartbeat_deadline = Instant::now() + self.inner.config.heartbeat();
        self.persist(state)?;

        tracing::info!(
            node_id = self.inner.id,
            term = state.persistent.current_term,
            votes = state.count_vote,
            "became leader"
        );
        self.inner.wake.notify_one();
        Ok(())
    }

    // -- leader election --

    /// start a new election round now
    ///
    /// a leader ignores the call. votes are requested on spawned tasks, so this
    /// returns as soon as the candidacy is persisted.
    pub fn campaign(&self) -> Result<()> {
        let (req, targets, won) = {
            let mut state = self.inner.state.write();
            self.ensure_alive()?;
            if state.role == NodeState::Leader {
                return Ok(());
            }

            state.persistent.current_term += 1;
            state.persistent.voted_for = Some(self.inner.id);
            state.role = NodeState::Candidate;
            state.leader_id = None;
            state.count_vote = 1;
            self.reset_election_timer(&mut state);
            self.persist(&state)?;

            let term = state.persistent.current_term;
            tracing::info!(node_id = self.inner.id, term, "became candidate");

            // a single-member cluster elects itself
            let won = state.majority_reached();
            if won {
                self.become_leader(&mut state)?;
            }

            let req = VoteRequest {
                term,
                candidate_id: self.inner.id,
                last_log_index: state.log.last_index(),
                last_log_term: state.log.last_term()?,
            };
            (req, self.other_peers(&state), won)
        };
        self.inner.wake.notify_one();

        if won {
            self.broadcast_append();
            return Ok(());
        }
        for peer in targets {
            let core = self.clone();
            let req = req.clone();
            tokio::spawn(async move { core.solicit_vote(peer, req).await });
        }
        Ok(())
    }

    fn other_peers(&self, state: &RaftState) -> Vec<PeerClient> {
        state
            .peers
            .ids()
            .filter(|id| *id != self.inner.id)
            .filter_map(|id| state.peers.get(id).cloned())
            .collect()
    }

    async fn solicit_vote(&self, peer: PeerClient, req: VoteRequest) {
        let peer_id = peer.id();
        let resp = match peer.request_vote(req.clone(), self.inner.config.rpc_deadline()).await {
            Ok(resp) => resp,
            Err(e) => {
                // unreachable peers simply do not count this round
                tracing::debug!(node_id = self.inner.id, peer_id, error = %e, "vote request failed");
                return;
            }
        };

        let won = {
            let mut state = self.inner.state.write();
            if self.is_dead() {
                return;
            }
            if resp.term > state.persistent.current_term {
                tracing::info!(
                    node_id = self.inner.id,
                    peer_id,
                    term = resp.term,
                    "vote response carries higher term"
                );
                if let Err(e) = self.become_follower(&mut state, resp.term, None) {
                    tracing::debug!(node_id = self.inner.id, error = %e, "step down after vote response failed");
                }
                return;
            }
            if state.persistent.current_term != req.term || state.role == NodeState::Follower {
                tracing::debug!(node_id = self.inner.id, peer_id, term = req.term, "stale vote response");
                return;
            }
            if !resp.vote_granted {
                tracing::debug!(node_id = self.inner.id, peer_id, term = req.term, "vote denied");
                return;
            }

            state.count_vote += 1;
            tracing::debug!(
                node_id = self.inner.id,
                peer_id,
                votes = state.count_vote,
                "received vote"
            );
            if state.role == NodeState::Candidate && state.majority_reached() {
                self.become_leader(&mut state).is_ok()
            } else {
                false
            }
        };

        if won {
            self.broadcast_append();
        }
    }

    // -- log replication --

    /// append a command to the leader's log and start replicating it
    pub fn propose(&self, command: Vec<u8>) -> Result<u64> {
        let index = {
            let mut state = self.inner.state.write();
            self.ensure_alive()?;
            if state.role != NodeState::Leader {
                return Err(RaftError::NotLeader(state.leader_id));
            }
            let entry = LogEntry::new(
                state.persistent.current_term,
                state.log.last_index() + 1,
                command,
            );
            let index = entry.index;
            state
                .log
                .append(&[entry])
                .map_err(|e| self.fail_stop(e))?;
            tracing::debug!(node_id = self.inner.id, index, "appended command to log");
            self.advance_commit(&mut state);
            index
        };
        self.broadcast_append();
        Ok(index)
    }

    /// one replication round: an AppendEntry task per peer
    ///
    /// a peer whose previous round is still running is not given a second task;
    /// the running one is told to go round again instead.
    pub fn broadcast_append(&self) {
        let (term, targets) = {
            let mut state = self.inner.state.write();
            if state.role != NodeState::Leader || self.is_dead() {
                return;
            }
            let peers: Vec<u64> = state
                .peers
                .ids()
                .filter(|id| *id != self.inner.id)
                .collect();
            let mut targets = Vec::new();
            for id in peers {
                let slot = &mut state.replication[id as usize];
                if *slot == Replication::Idle {
                    *slot = Replication::Running;
                    targets.push(id);
                } else {
                    *slot = Replication::Pending;
                }
            }
            (state.persistent.current_term, targets)
        };

        for peer_id in targets {
            let core = self.clone();
            tokio::spawn(async move { core.replicate(peer_id, term).await });
        }
    }

    fn build_append(&self, state: &RaftState, peer_id: u64) -> Result<AppendEntryRequest> {
        let next = state.next_index[peer_id as usize].max(state.log.first_index() + 1);
        let prev_log_index = next - 1;
        let prev_log_term = state.log.term_at(prev_log_index)?.ok_or_else(|| {
            RaftError::CorruptLog(format!("no entry at prev_log_index {prev_log_index}"))
        })?;
        Ok(AppendEntryRequest {
            term: state.persistent.current_term,
            leader_id: self.inner.id,
            prev_log_index,
            prev_log_term,
            entries: state.log.entries_from(next)?,
            leader_commit: state.commit_index,
        })
    }

    async fn replicate(&self, peer_id: u64, term: u64) {
        loop {
            self.replicate_round(peer_id, term).await;
            if !self.finish_round(peer_id, term) {
                return;
            }
        }
    }

    /// release the peer's replication slot, or claim it again if a round is pending
    fn finish_round(&self, peer_id: u64, term: u64) -> bool {
        let mut state = self.inner.state.write();
        if self.is_dead()
            || state.role != NodeState::Leader
            || state.persistent.current_term != term
        {
            // a later leadership resets the slots itself
            return false;
        }
        let slot = &mut state.replication[peer_id as usize];
        if *slot == Replication::Pending {
            *slot = Replication::Running;
            true
        } else {
            *slot = Replication::Idle;
            false
        }
    }

    async fn replicate_round(&self, peer_id: u64, term: u64) {
        let mut reconnected = false;
        loop {
            let (peer, req) = {
                let state = self.inner.state.read();
                if self.is_dead()
                    || state.role != NodeState::Leader
                    || state.persistent.current_term != term
                {
                    return;
                }
                let Some(peer) = state.peers.get(peer_id).cloned() else {
                    return;
                };
                match self.build_append(&state, peer_id) {
                    Ok(req) => (peer, req),
                    Err(e) => {
                        tracing::error!(node_id = self.inner.id, peer_id, error = %e, "cannot build append request");
                        return;
                    }
                }
            };

            let resp = match peer.append_entry(req.clone(), self.inner.config.rpc_deadline()).await {
                Ok(resp) => resp,
                Err(e) if !reconnected => {
                    tracing::warn!(node_id = self.inner.id, peer_id, error = %e, "append failed, reconnecting");
                    self.reconnect(&peer).await;
                    reconnected = true;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(node_id = self.inner.id, peer_id, error = %e, "append failed after reconnect");
                    return;
                }
            };

            if !self.handle_append_response(peer_id, term, &req, resp) {
                return;
            }
        }
    }

    /// fold one AppendEntry response into leader state; true means retry now
    fn handle_append_response(
        &self,
        peer_id: u64,
        term: u64,
        req: &AppendEntryRequest,
        resp: AppendEntryResponse,
    ) -> bool {
        let mut state = self.inner.state.write();
        if self.is_dead() {
            return false;
        }
        if resp.term > state.persistent.current_term {
            tracing::info!(
                node_id = self.inner.id,
                peer_id,
                term = resp.term,
                "append response carries higher term, stepping down"
            );
            if let Err(e) = self.become_follower(&mut state, resp.term, None) {
                tracing::debug!(node_id = self.inner.id, error = %e, "step down after append response failed");
            }
            return false;
        }
        if state.role != NodeState::Leader || state.persistent.current_term != term {
            return false;
        }

        let slot = peer_id as usize;
        if resp.success {
            let matched = req.prev_log_index + req.entries.len() as u64;
            // responses can arrive out of order; never move match_index backwards
            if matched > state.match_index[slot] {
                state.match_index[slot] = matched;
            }
            state.next_index[slot] = state.match_index[slot] + 1;
            tracing::trace!(
                node_id = self.inner.id,
                peer_id,
                match_index = state.match_index[slot],
                "append accepted"
            );
            self.advance_commit(&mut state);
            return false;
        }

        let current = state.next_index[slot];
        if resp.conflict_index < state.log.first_index() || current <= 1 {
            tracing::warn!(
                node_id = self.inner.id,
                peer_id,
                conflict_index = resp.conflict_index,
                next_index = current,
                "append rejected with no room to back off"
            );
            return false;
        }
        let next = resp.conflict_index.min(current - 1).max(1);
        state.next_index[slot] = next;
        tracing::debug!(
            node_id = self.inner.id,
            peer_id,
            conflict_index = resp.conflict_index,
            conflict_term = resp.conflict_term,
            next_index = next,
            "append rejected, backing off"
        );
        true
    }

    /// commit the highest index stored on a majority, if it belongs to the current term
    fn advance_commit(&self, state: &mut RaftState) {
        let mut matched: Vec<u64> = state
            .peers
            .ids()
            .map(|id| {
                if id == self.inner.id {
                    state.log.last_index()
                } else {
                    state.match_index[id as usize]
                }
            })
            .collect();
        if matched.is_empty() {
            return;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[matched.len() / 2];

        if candidate <= state.commit_index {
            return;
        }
        match state.log.term_at(candidate) {
            Ok(Some(t)) if t == state.persistent.current_term => {
                state.commit_index = candidate;
                self.inner.commit_tx.send_replace(candidate);
                tracing::debug!(node_id = self.inner.id, commit_index = candidate, "advanced commit index");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(node_id = self.inner.id, index = candidate, error = %e, "cannot read entry term");
            }
        }
    }

    /// tear down and rebuild the connection `failed` was using
    ///
    /// the dial is bounded by the rpc timeout. if the slot was already rebuilt by
    /// someone else meanwhile, the fresh connection is closed and the slot kept.
    async fn reconnect(&self, failed: &PeerClient) {
        let peer_id = failed.id();
        let limit = self.inner.config.rpc_deadline();
        let dial = self.inner.connector.connect(peer_id, failed.addr());
        let service = match tokio::time::timeout(limit, dial).await {
            Ok(Ok(service)) => Some(service),
            Ok(Err(e)) => {
                tracing::warn!(node_id = self.inner.id, peer_id, addr = %failed.addr(), error = %e, "reconnect failed");
                None
            }
            Err(_) => {
                tracing::warn!(
                    node_id = self.inner.id,
                    peer_id,
                    addr = %failed.addr(),
                    millis = limit.as_millis() as u64,
                    "reconnect timed out"
                );
                None
            }
        };

        let swapped = self.inner.state.write().peers.replace_if_current(failed, service);
        match swapped {
            Ok(Some(old)) => old.close().await,
            Ok(None) => {}
            Err(Some(fresh)) => {
                tracing::debug!(node_id = self.inner.id, peer_id, "peer already reconnected, dropping new connection");
                fresh.close().await;
            }
            Err(None) => {}
        }
    }

    // -- inbound rpcs --

    /// RequestVote handler
    ///
    /// grants at most one vote per term, and only to a candidate whose log is at
    /// least as up to date as ours. granting resets our election timer.
    pub fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let mut state = self.inner.state.write();
        self.ensure_alive()?;

        if req.term < state.persistent.current_term {
            tracing::debug!(
                node_id = self.inner.id,
                candidate = req.candidate_id,
                term = req.term,
                current_term = state.persistent.current_term,
                "rejecting vote for stale term"
            );
            return Ok(VoteResponse {
                term: state.persistent.current_term,
                vote_granted: false,
            });
        }
        if req.term > state.persistent.current_term {
            self.become_follower(&mut state, req.term, None)?;
        }

        let free = match state.persistent.voted_for {
            None => true,
            Some(id) => id == req.candidate_id,
        };
        let vote_granted = free && state.is_log_up_to_date(req.last_log_index, req.last_log_term)?;

        if vote_granted {
            state.persistent.voted_for = Some(req.candidate_id);
            state.role = NodeState::Follower;
            self.reset_election_timer(&mut state);
            self.persist(&state)?;
        }

        tracing::debug!(
            node_id = self.inner.id,
            candidate = req.candidate_id,
            term = req.term,
            granted = vote_granted,
            "RequestVote response"
        );
        Ok(VoteResponse {
            term: state.persistent.current_term,
            vote_granted,
        })
    }

    /// AppendEntry handler
    ///
    /// a request from an older term is rejected without touching term, vote,
    /// role or timers. otherwise the sender is accepted as leader, the election
    /// timer is reset, and the entries are spliced in after `prev_log_index` if
    /// our entry there carries `prev_log_term`.
    pub fn handle_append_entry(&self, req: AppendEntryRequest) -> Result<AppendEntryResponse> {
        let mut state = self.inner.state.write();
        self.ensure_alive()?;

        if req.term < state.persistent.current_term {
            tracing::debug!(
                node_id = self.inner.id,
                leader = req.leader_id,
                term = req.term,
                current_term = state.persistent.current_term,
                "rejecting append for stale term"
            );
            return Self::rejection(&state);
        }

        if req.term > state.persistent.current_term || state.role != NodeState::Follower {
            self.become_follower(&mut state, req.term, Some(req.leader_id))?;
        } else {
            state.leader_id = Some(req.leader_id);
            self.reset_election_timer(&mut state);
        }

        // entries must run densely from prev_log_index + 1; anything else is refused
        // here, before the log is touched, so a bad request can never stop the node
        let well_formed = req.entries.iter().enumerate().all(|(i, entry)| {
            req.prev_log_index.checked_add(1 + i as u64) == Some(entry.index)
        });
        if !well_formed {
            tracing::warn!(
                node_id = self.inner.id,
                leader = req.leader_id,
                prev_log_index = req.prev_log_index,
                first_entry = ?req.entries.first().map(|e| e.index),
                "malformed append, entries do not follow prev_log_index"
            );
            return Self::rejection(&state);
        }

        let consistent = req.prev_log_index <= state.log.last_index()
            && state.log.term_at(req.prev_log_index)? == Some(req.prev_log_term);
        if !consistent {
            tracing::debug!(
                node_id = self.inner.id,
                prev_log_index = req.prev_log_index,
                prev_log_term = req.prev_log_term,
                last_index = state.log.last_index(),
                "log mismatch, rejecting append"
            );
            return Self::rejection(&state);
        }

        let mut fresh = Vec::new();
        for entry in &req.entries {
            if !fresh.is_empty() {
                fresh.push(entry.clone());
                continue;
            }
            match state.log.term_at(entry.index)? {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    if entry.index <= state.commit_index {
                        tracing::warn!(
                            node_id = self.inner.id,
                            index = entry.index,
                            commit_index = state.commit_index,
                            "leader overwrites a committed entry"
                        );
                    }
                    state
                        .log
                        .truncate_from(entry.index)
                        .map_err(|e| self.fail_stop(e))?;
                    fresh.push(entry.clone());
                }
                None => fresh.push(entry.clone()),
            }
        }
        if !fresh.is_empty() {
            state.log.append(&fresh).map_err(|e| self.fail_stop(e))?;
            tracing::debug!(
                node_id = self.inner.id,
                entries_appended = fresh.len(),
                new_last_index = state.log.last_index(),
                "appended entries"
            );
        }

        let last_new = req.prev_log_index + req.entries.len() as u64;
        if req.leader_commit > state.commit_index {
            let commit = req.leader_commit.min(last_new);
            if commit > state.commit_index {
                state.commit_index = commit;
                self.inner.commit_tx.send_replace(commit);
            }
        }

        Ok(AppendEntryResponse {
            term: state.persistent.current_term,
            success: true,
            conflict_index: state.log.last_index(),
            conflict_term: state.log.last_term()?,
        })
    }
}

impl RaftCore {
    /// failed AppendEntry response carrying our last index/term as the conflict hint
    fn rejection(state: &RaftState) -> Result<AppendEntryResponse> {
        Ok(AppendEntryResponse {
            term: state.persistent.current_term,
            success: false,
            conflict_index: state.log.last_index(),
            conflict_term: state.log.last_term()?,
        })
    }
}

/// lets an rpc server, or an in-process network, hand requests straight to the node
#[async_trait]
impl RaftService for RaftCore {
    async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.handle_request_vote(req)
    }

    async fn append_entry(&self, req: AppendEntryRequest) -> Result<AppendEntryResponse> {
        self.handle_append_entry(req)
    }
}
