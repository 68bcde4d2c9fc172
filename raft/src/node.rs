//! The running node: one mutex-guarded [`RaftState`] plus the threads that
//! drive it.
//!
//! Threading layout:
//!
//! - an election watcher, parked on a rearm channel with a randomised
//!   timeout; any valid leader contact or granted vote rearms it
//! - a heartbeat ticker, active only while leading
//! - one short-lived thread per outbound `AppendEntries`/`RequestVote`
//!
//! The mutex is never held across network I/O: every outbound call snapshots
//! what it needs, releases the lock, and re-checks role and term once the
//! response arrives.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Config;
use crate::message::{
    AppendRequest, AppendResponse, ExecuteRequest, ExecuteResponse, JoinRequest, JoinResponse,
    JoinStatus, LogEntry, LogIndex, LogResponse, Method, NodeAddr, Term, VoteRequest, VoteResponse,
};
use crate::stable::StableStore;
use crate::state::{RaftState, Role};
use crate::state_machine::StateMachine;
use crate::transport::Transport;

/// Everything needed to boot a node.
pub struct NodeOptions<S, T> {
    /// This node's own `host:port` identity.
    pub addr: NodeAddr,
    /// Address of an existing cluster member to join through, or `None` to
    /// bootstrap as the leader of a singleton cluster.
    pub seed: Option<NodeAddr>,
    pub machine: S,
    pub transport: T,
    pub config: Config,
    /// Election timeout randomness. Defaults to an entropy-seeded generator;
    /// peers must not share a seed.
    pub rng: Option<Box<dyn RngCore + Send>>,
    /// Optional stable storage for `(currentTerm, votedFor, log)`.
    pub stable: Option<StableStore>,
}

pub struct RaftNode<T, S> {
    addr: NodeAddr,
    config: Config,
    transport: T,
    state: Mutex<RaftState<S>>,
    rearm_tx: Sender<()>,
    rearm_rx: Receiver<()>,
    stopped: AtomicBool,
    weak: Weak<Self>,
}

impl<T, S> RaftNode<T, S>
where
    T: Transport + 'static,
    S: StateMachine + 'static,
{
    /// Boots a node: joins through the seed (blocking until admitted) or
    /// bootstraps a singleton cluster, then starts the timer threads.
    pub fn launch(opts: NodeOptions<S, T>) -> Arc<Self> {
        let rng = opts
            .rng
            .unwrap_or_else(|| Box::new(SmallRng::from_entropy()));
        let state = RaftState::new(
            opts.addr.clone(),
            opts.machine,
            opts.config.clone(),
            rng,
            opts.stable,
        );
        let (rearm_tx, rearm_rx) = unbounded();
        let node = Arc::new_cyclic(|weak| RaftNode {
            addr: opts.addr,
            config: opts.config,
            transport: opts.transport,
            state: Mutex::new(state),
            rearm_tx,
            rearm_rx,
            stopped: AtomicBool::new(false),
            weak: weak.clone(),
        });

        match opts.seed {
            None => node.lock().bootstrap_leader(),
            Some(seed) => node.join_cluster(seed),
        }

        node.spawn_election_watcher();
        node.spawn_heartbeat_loop();
        node
    }

    /// Stops the timer threads. In-flight RPCs finish on their own.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.rearm_tx.send(());
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, RaftState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rearm_election_timer(&self) {
        let _ = self.rearm_tx.send(());
    }

    /// A strong handle on this node for a spawned thread to own.
    fn handle(&self) -> Option<Arc<Self>> {
        self.weak.upgrade()
    }

    //
    // inbound RPC entry points
    //

    /// Decodes `body`, runs the handler for `method` and encodes the reply.
    pub fn serve(&self, method: Method, body: &[u8]) -> io::Result<Bytes> {
        match method {
            Method::RequestVote => {
                let req: VoteRequest = decode(body)?;
                encode(&self.request_vote(req))
            }
            Method::AppendEntries => {
                let req: AppendRequest = decode(body)?;
                encode(&self.append_entries(req))
            }
            Method::ApplyMembership => {
                let req: JoinRequest = decode(body)?;
                encode(&self.apply_membership(req))
            }
            Method::Execute => {
                let req: ExecuteRequest = decode(body)?;
                encode(&self.execute(req.command))
            }
            Method::RequestLog => encode(&self.request_log()),
        }
    }

    pub fn request_vote(&self, req: VoteRequest) -> VoteResponse {
        let (resp, rearm) = self.lock().handle_vote_request(&req);
        if rearm {
            self.rearm_election_timer();
        }
        resp
    }

    pub fn append_entries(&self, req: AppendRequest) -> AppendResponse {
        let (resp, rearm) = self.lock().handle_append_request(req);
        if rearm {
            self.rearm_election_timer();
        }
        resp
    }

    pub fn apply_membership(&self, req: JoinRequest) -> JoinResponse {
        self.lock().handle_join(&req)
    }

    /// Leader-only diagnostic: the whole log.
    pub fn request_log(&self) -> LogResponse {
        let state = self.lock();
        if state.is_leader() {
            LogResponse::Entries {
                log: state.log().entries().to_vec(),
            }
        } else {
            LogResponse::Failed {
                error: "Not leader".to_owned(),
                leader_addr: state.leader_hint().cloned(),
            }
        }
    }

    /// Client command pipeline: append locally, fan out to every peer, wait
    /// for a strict majority (the local append is the first ack), commit and
    /// reply with the applied result.
    pub fn execute(&self, command: String) -> ExecuteResponse {
        let (index, term, outcome_rx, cluster_size) = {
            let mut state = self.lock();
            if !state.is_leader() {
                return ExecuteResponse::Failed {
                    error: "Not leader".to_owned(),
                    leader_addr: state.leader_hint().cloned(),
                };
            }
            let (index, term, rx) = state.leader_append(command);
            (index, term, rx, state.peers().len())
        };

        let (ack_tx, ack_rx) = bounded(cluster_size.max(1));
        self.replicate_round(Some(ack_tx));

        let mut acks = 1usize; // self
        while acks <= cluster_size / 2 {
            match ack_rx.recv() {
                Ok(()) => acks += 1,
                Err(_) => break, // every replication task gave up
            }
        }

        {
            let mut state = self.lock();
            if acks <= cluster_size / 2 {
                warn!(
                    "[{}] no majority for index {} ({}/{} acks)",
                    self.addr, index, acks, cluster_size
                );
                state.abandon_pending(index);
                return ExecuteResponse::Failed {
                    error: "replication failed".to_owned(),
                    leader_addr: state.leader_hint().cloned(),
                };
            }
            if !state.is_leader() || state.current_term() != term {
                state.abandon_pending(index);
                return ExecuteResponse::Failed {
                    error: "Not leader".to_owned(),
                    leader_addr: state.leader_hint().cloned(),
                };
            }
            state.commit_to(index);
        }

        match outcome_rx.recv_timeout(self.config.rpc_timeout) {
            Ok(outcome) => ExecuteResponse::Done {
                result: outcome.result,
                ok: outcome.ok,
            },
            Err(_) => {
                error!(
                    "[{}] applied outcome for index {} never arrived",
                    self.addr, index
                );
                ExecuteResponse::Failed {
                    error: "apply failed".to_owned(),
                    leader_addr: Some(self.addr.clone()),
                }
            }
        }
    }

    //
    // timers
    //

    fn spawn_election_watcher(&self) {
        let node = match self.handle() {
            Some(node) => node,
            None => return,
        };
        let rearm_rx = self.rearm_rx.clone();
        let _ = thread::Builder::new()
            .name(format!("election-{}", self.addr))
            .spawn(move || loop {
                if node.stopped() {
                    return;
                }
                let timeout = node.lock().random_election_timeout();
                match rearm_rx.recv_timeout(timeout) {
                    Ok(()) => continue, // fresh random draw on every rearm
                    Err(RecvTimeoutError::Timeout) => node.campaign(),
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            })
            .expect("spawn election watcher");
    }

    fn spawn_heartbeat_loop(&self) {
        let node = match self.handle() {
            Some(node) => node,
            None => return,
        };
        let _ = thread::Builder::new()
            .name(format!("heartbeat-{}", self.addr))
            .spawn(move || {
                let ticker = crossbeam_channel::tick(node.config.heartbeat_interval);
                loop {
                    if ticker.recv().is_err() || node.stopped() {
                        return;
                    }
                    if node.lock().is_leader() {
                        debug!("[{}] sending heartbeat", node.addr);
                        node.replicate_round(None);
                    }
                }
            })
            .expect("spawn heartbeat loop");
    }

    //
    // elections
    //

    fn campaign(&self) {
        let mut state = self.lock();
        let request = match state.start_election() {
            Some(request) => request,
            None => return, // leaders ignore the election timer
        };
        let won_alone = state.try_become_leader();
        let peers = state.peers_except_self();
        drop(state);

        if won_alone {
            self.replicate_round(None);
            return;
        }

        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(err) => {
                error!("[{}] could not encode {}: {}", self.addr, request, err);
                return;
            }
        };

        for peer in peers {
            let node = match self.handle() {
                Some(node) => node,
                None => return,
            };
            let body = body.clone();
            let spawned = thread::Builder::new()
                .name(format!("solicit-{}", peer))
                .spawn(move || node.solicit_vote(&peer, &body));
            if let Err(err) = spawned {
                error!("[{}] could not spawn vote solicitation: {}", self.addr, err);
            }
        }
    }

    fn solicit_vote(&self, peer: &NodeAddr, body: &[u8]) {
        let bytes = match self.transport.call(Method::RequestVote, peer, body) {
            Ok(bytes) => bytes,
            Err(err) => {
                // counted as a missing vote
                debug!("[{}] vote request to {} failed: {}", self.addr, peer, err);
                return;
            }
        };
        let resp: VoteResponse = match serde_json::from_slice(&bytes) {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    "[{}] undecodable vote response from {}: {}",
                    self.addr, peer, err
                );
                return;
            }
        };
        let won = self.lock().handle_vote_response(&resp);
        if won {
            // assert authority right away instead of waiting a heartbeat tick
            self.replicate_round(None);
        }
    }

    //
    // replication
    //

    /// Sends one `AppendEntries` round to every other peer, each on its own
    /// thread. `acks` receives one message per successful append.
    fn replicate_round(&self, acks: Option<Sender<()>>) {
        let peers = {
            let state = self.lock();
            if !state.is_leader() {
                return;
            }
            state.peers_except_self()
        };
        for peer in peers {
            let node = match self.handle() {
                Some(node) => node,
                None => return,
            };
            let ack = acks.clone();
            let spawned = thread::Builder::new()
                .name(format!("replicate-{}", peer))
                .spawn(move || node.replicate_to(peer, ack));
            if let Err(err) = spawned {
                error!("[{}] could not spawn replication: {}", self.addr, err);
            }
        }
    }

    /// Drives one peer to accept the leader's log: on a consistency
    /// rejection, back off one index and retry with the earlier prefix until
    /// the peer accepts, the transport fails, or this node stops leading.
    fn replicate_to(&self, peer: NodeAddr, ack: Option<Sender<()>>) {
        loop {
            if self.stopped() {
                return;
            }
            let (request, prev, sent) = match self.lock().append_request_for(&peer) {
                Some(snapshot) => snapshot,
                None => return, // not leading anymore
            };
            let term = request.term;
            let body = match serde_json::to_vec(&request) {
                Ok(body) => body,
                Err(err) => {
                    error!("[{}] could not encode {}: {}", self.addr, request, err);
                    return;
                }
            };

            let bytes = match self.transport.call(Method::AppendEntries, &peer, &body) {
                Ok(bytes) => bytes,
                Err(err) => {
                    // retried by the next heartbeat at the same prefix
                    debug!("[{}] append to {} failed: {}", self.addr, peer, err);
                    return;
                }
            };
            let resp: AppendResponse = match serde_json::from_slice(&bytes) {
                Ok(resp) => resp,
                Err(err) => {
                    warn!(
                        "[{}] undecodable append response from {}: {}",
                        self.addr, peer, err
                    );
                    return;
                }
            };

            let mut state = self.lock();
            if state.observe_term(resp.term) {
                return;
            }
            if !state.is_leader() || state.current_term() != term {
                return;
            }
            if resp.success {
                state.record_append_success(&peer, prev, sent);
                drop(state);
                if let Some(ack) = &ack {
                    let _ = ack.send(());
                }
                return;
            }
            state.record_append_conflict(&peer);
        }
    }

    //
    // membership
    //

    /// Asks `seed` for admission, following redirects until some node
    /// answers with the cluster view. Retries failed contacts forever.
    fn join_cluster(&self, seed: NodeAddr) {
        let request = JoinRequest {
            candidate_address: self.addr.clone(),
        };
        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(err) => {
                error!("[{}] could not encode join request: {}", self.addr, err);
                return;
            }
        };
        let mut contact = seed;
        loop {
            if self.stopped() {
                return;
            }
            let bytes = match self.transport.call(Method::ApplyMembership, &contact, &body) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(
                        "[{}] membership request to {} failed: {}",
                        self.addr, contact, err
                    );
                    thread::sleep(self.config.heartbeat_interval);
                    continue;
                }
            };
            let resp: JoinResponse = match serde_json::from_slice(&bytes) {
                Ok(resp) => resp,
                Err(err) => {
                    warn!(
                        "[{}] undecodable join response from {}: {}",
                        self.addr, contact, err
                    );
                    thread::sleep(self.config.heartbeat_interval);
                    continue;
                }
            };
            match resp.status {
                JoinStatus::Redirected => match resp.address {
                    Some(addr) => {
                        info!("[{}] membership redirected to {}", self.addr, addr);
                        contact = addr;
                    }
                    None => {
                        warn!(
                            "[{}] redirect without an address from {}",
                            self.addr, contact
                        );
                        thread::sleep(self.config.heartbeat_interval);
                    }
                },
                JoinStatus::Success => {
                    self.lock()
                        .install_membership(resp.cluster_addr_list, resp.cluster_leader);
                    return;
                }
            }
        }
    }

    //
    // observers
    //

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.lock().role()
    }

    pub fn is_leader(&self) -> bool {
        self.lock().is_leader()
    }

    pub fn current_term(&self) -> Term {
        self.lock().current_term()
    }

    pub fn leader_hint(&self) -> Option<NodeAddr> {
        self.lock().leader_hint().cloned()
    }

    pub fn peers(&self) -> Vec<NodeAddr> {
        self.lock().peers().to_vec()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.lock().commit_index()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.lock().last_applied()
    }

    pub fn log_snapshot(&self) -> Vec<LogEntry> {
        self.lock().log().entries().to_vec()
    }
}

fn decode<R: DeserializeOwned>(body: &[u8]) -> io::Result<R> {
    serde_json::from_slice(body).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn encode<R: Serialize>(resp: &R) -> io::Result<Bytes> {
    serde_json::to_vec(resp)
        .map(Bytes::from)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}
