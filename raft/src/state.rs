//! The complete mutable state of a node and its protocol transitions.
//!
//! Everything here runs under the node's single mutex. The functions are pure
//! transitions: they never touch the network, and they hand back whatever the
//! threaded shell needs to act on (replies, rearm signals, won elections).

use std::collections::HashMap;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use rand::RngCore;

use crate::config::Config;
use crate::log::RaftLog;
use crate::message::{
    AppendRequest, AppendResponse, JoinRequest, JoinResponse, JoinStatus, LogEntry, LogIndex,
    NodeAddr, Term, VoteRequest, VoteResponse,
};
use crate::stable::StableStore;
use crate::state_machine::{Applied, StateMachine};

/// The role a node currently plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Per-follower replication bookkeeping, kept only while leading.
#[derive(Debug)]
pub(crate) struct Progress {
    /// The next log index to send to this peer.
    pub next_index: LogIndex,
    /// The highest index known replicated on this peer.
    pub match_index: LogIndex,
}

pub(crate) struct RaftState<S> {
    addr: NodeAddr,
    role: Role,
    config: Config,
    rng: Box<dyn RngCore + Send>,

    // conceptually persistent
    current_term: Term,
    voted_for: Option<NodeAddr>,
    log: RaftLog,

    // volatile
    commit_index: LogIndex,
    last_applied: LogIndex,
    peers: Vec<NodeAddr>,
    leader_hint: Option<NodeAddr>,

    // leader volatile
    progress: HashMap<NodeAddr, Progress>,
    votes_granted: usize,

    // clients blocked in Execute, woken when their entry applies
    pending: HashMap<LogIndex, Sender<Applied>>,

    machine: S,
    stable: Option<StableStore>,
}

impl<S: StateMachine> RaftState<S> {
    pub fn new(
        addr: NodeAddr,
        machine: S,
        config: Config,
        rng: Box<dyn RngCore + Send>,
        stable: Option<StableStore>,
    ) -> Self {
        let (current_term, voted_for, entries) = match &stable {
            Some(store) => store.load().unwrap_or_else(|err| {
                warn!("[{}] could not load stable state: {}", addr, err);
                (0, None, Vec::new())
            }),
            None => (0, None, Vec::new()),
        };
        RaftState {
            addr: addr.clone(),
            role: Role::Follower,
            config,
            rng,
            current_term,
            voted_for,
            log: RaftLog::from_entries(entries),
            commit_index: -1,
            last_applied: -1,
            peers: vec![addr],
            leader_hint: None,
            progress: HashMap::new(),
            votes_granted: 0,
            pending: HashMap::new(),
            machine,
            stable,
        }
    }

    //
    // accessors
    //

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn leader_hint(&self) -> Option<&NodeAddr> {
        self.leader_hint.as_ref()
    }

    pub fn peers(&self) -> &[NodeAddr] {
        &self.peers
    }

    pub fn peers_except_self(&self) -> Vec<NodeAddr> {
        self.peers
            .iter()
            .filter(|peer| **peer != self.addr)
            .cloned()
            .collect()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn random_election_timeout(&mut self) -> std::time::Duration {
        self.config.random_election_timeout(self.rng.as_mut())
    }

    //
    // role transitions
    //

    /// Adopts `term` and falls back to follower when the term is newer than
    /// ours. Returns whether a step-down happened.
    pub fn observe_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            true
        } else {
            false
        }
    }

    fn become_follower(&mut self, term: Term) {
        if self.role != Role::Follower {
            info!("[{}] stepping down to follower at term {}", self.addr, term);
        }
        self.role = Role::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.leader_hint = None;
        self.votes_granted = 0;
        self.persist_meta();
    }

    /// Boots this node as the leader of a singleton cluster (no seed given).
    pub fn bootstrap_leader(&mut self) {
        info!("[{}] bootstrapping as singleton cluster leader", self.addr);
        self.role = Role::Leader;
        self.leader_hint = Some(self.addr.clone());
    }

    /// The follower/candidate election timeout fired: move to candidate and
    /// produce the vote solicitation to broadcast. Leaders ignore the timer.
    pub fn start_election(&mut self) -> Option<VoteRequest> {
        if self.role == Role::Leader {
            return None;
        }
        self.current_term += 1;
        self.voted_for = Some(self.addr.clone());
        self.role = Role::Candidate;
        self.leader_hint = None;
        self.votes_granted = 1;
        self.persist_meta();
        info!(
            "[{}] became candidate at term {}",
            self.addr, self.current_term
        );
        Some(VoteRequest {
            term: self.current_term,
            candidate_id: self.addr.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }

    /// Promotes a candidate holding a strict majority. Returns whether the
    /// promotion happened on this call.
    pub fn try_become_leader(&mut self) -> bool {
        if self.role != Role::Candidate || self.votes_granted <= self.peers.len() / 2 {
            return false;
        }
        info!(
            "[{}] won election at term {} with {} votes",
            self.addr, self.current_term, self.votes_granted
        );
        self.role = Role::Leader;
        self.leader_hint = Some(self.addr.clone());
        self.progress = self
            .peers
            .iter()
            .filter(|peer| **peer != self.addr)
            .map(|peer| {
                (
                    peer.clone(),
                    Progress {
                        next_index: self.log.len(),
                        match_index: -1,
                    },
                )
            })
            .collect();
        true
    }

    //
    // elections
    //

    /// Returns the reply plus whether the election timer must be rearmed
    /// (granted votes rearm it).
    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> (VoteResponse, bool) {
        if req.term < self.current_term {
            info!(
                "[{}] rejecting vote for {}: stale term {} < {}",
                self.addr, req.candidate_id, req.term, self.current_term
            );
            return (
                VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                },
                false,
            );
        }
        self.observe_term(req.term);

        let up_to_date = req.last_log_term > self.log.last_term()
            || (req.last_log_term == self.log.last_term()
                && req.last_log_index >= self.log.last_index());
        let free_to_vote = match &self.voted_for {
            None => true,
            Some(vote) => *vote == req.candidate_id,
        };

        if free_to_vote && up_to_date {
            info!(
                "[{}] voting for {} at term {}",
                self.addr, req.candidate_id, self.current_term
            );
            self.voted_for = Some(req.candidate_id.clone());
            self.persist_meta();
            (
                VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                },
                true,
            )
        } else {
            info!(
                "[{}] rejecting vote for {}: already voted or log behind ({})",
                self.addr, req.candidate_id, req
            );
            (
                VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                },
                false,
            )
        }
    }

    /// Tallies one vote response. Returns whether this response won the
    /// election.
    pub fn handle_vote_response(&mut self, resp: &VoteResponse) -> bool {
        if self.observe_term(resp.term) {
            return false;
        }
        if self.role != Role::Candidate || resp.term != self.current_term || !resp.vote_granted {
            return false;
        }
        self.votes_granted += 1;
        self.try_become_leader()
    }

    //
    // replication
    //

    /// Follower/candidate side of `AppendEntries`. Returns the reply plus
    /// whether the election timer must be rearmed (any append that is not
    /// rejected for term rearms it).
    pub fn handle_append_request(&mut self, req: AppendRequest) -> (AppendResponse, bool) {
        if req.term < self.current_term {
            info!(
                "[{}] rejecting append from {}: stale term {} < {}",
                self.addr, req.leader_id, req.term, self.current_term
            );
            return (
                AppendResponse {
                    term: self.current_term,
                    success: false,
                },
                false,
            );
        }
        self.observe_term(req.term);
        // a live leader in our term asserted authority
        self.role = Role::Follower;
        self.leader_hint = Some(req.leader_id.clone());

        let consistent = req.prev_log_index == -1
            || (req.prev_log_index < self.log.len()
                && self.log.term_at(req.prev_log_index) == req.prev_log_term);
        if !consistent {
            warn!(
                "[{}] rejecting append from {}: no entry {}@{} (log len {})",
                self.addr,
                req.leader_id,
                req.prev_log_index,
                req.prev_log_term,
                self.log.len()
            );
            return (
                AppendResponse {
                    term: self.current_term,
                    success: false,
                },
                true,
            );
        }

        if !req.entries.is_empty() {
            debug!(
                "[{}] appending {} entries from {} after index {}",
                self.addr,
                req.entries.len(),
                req.leader_id,
                req.prev_log_index
            );
            self.log.truncate_and_append(req.prev_log_index, req.entries);
            self.persist_log();
        }

        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(self.log.len() - 1);
        }
        self.apply_committed();

        (
            AppendResponse {
                term: self.current_term,
                success: true,
            },
            true,
        )
    }

    /// Builds the next `AppendEntries` for `peer` from its replication
    /// progress, or `None` when this node is not leading. Also returns the
    /// anchor index and entry count so the caller can record the outcome.
    pub fn append_request_for(&self, peer: &NodeAddr) -> Option<(AppendRequest, LogIndex, usize)> {
        if self.role != Role::Leader {
            return None;
        }
        let progress = self.progress.get(peer)?;
        let prev = progress.next_index - 1;
        let entries = self.log.slice(progress.next_index);
        let sent = entries.len();
        let request = AppendRequest {
            term: self.current_term,
            leader_id: self.addr.clone(),
            prev_log_index: prev,
            prev_log_term: self.log.term_at(prev),
            entries,
            leader_commit: self.commit_index,
        };
        Some((request, prev, sent))
    }

    /// Records a successful append on `peer` and advances the commit index if
    /// a majority now holds new entries.
    pub fn record_append_success(&mut self, peer: &NodeAddr, prev: LogIndex, sent: usize) {
        if self.role != Role::Leader {
            return;
        }
        if let Some(progress) = self.progress.get_mut(peer) {
            let matched = prev + sent as LogIndex;
            if matched > progress.match_index {
                progress.match_index = matched;
            }
            progress.next_index = progress.match_index + 1;
        }
        self.advance_commit();
    }

    /// Backs off one index for `peer` after a consistency rejection.
    pub fn record_append_conflict(&mut self, peer: &NodeAddr) {
        if self.role != Role::Leader {
            return;
        }
        if let Some(progress) = self.progress.get_mut(peer) {
            progress.next_index = (progress.next_index - 1).max(0);
            debug!(
                "[{}] backing off to index {} for {}",
                self.addr, progress.next_index, peer
            );
        }
    }

    /// Advances `commitIndex` to the highest index stored on a strict
    /// majority, provided that entry was appended in the current term.
    fn advance_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let mut match_indices: Vec<LogIndex> =
            self.progress.values().map(|p| p.match_index).collect();
        match_indices.push(self.log.last_index());
        match_indices.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = match match_indices.get(self.peers.len() / 2) {
            Some(candidate) => *candidate,
            None => return,
        };
        if candidate > self.commit_index && self.log.term_at(candidate) == self.current_term {
            debug!(
                "[{}] commit index {} -> {}",
                self.addr, self.commit_index, candidate
            );
            self.commit_index = candidate;
            self.apply_committed();
        }
    }

    //
    // client commands
    //

    /// Appends a client command to the leader's log and registers a waiter
    /// that is woken with the applied outcome.
    pub fn leader_append(&mut self, command: String) -> (LogIndex, Term, Receiver<Applied>) {
        self.log.append(LogEntry {
            term: self.current_term,
            command,
        });
        self.persist_log();
        let index = self.log.last_index();
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.pending.insert(index, tx);
        (index, self.current_term, rx)
    }

    /// Forgets the waiter for `index` after a failed replication round.
    pub fn abandon_pending(&mut self, index: LogIndex) {
        self.pending.remove(&index);
    }

    /// Majority acknowledged `index`: commit it and apply in order.
    pub fn commit_to(&mut self, index: LogIndex) {
        if index > self.commit_index {
            self.commit_index = index;
        }
        self.apply_committed();
    }

    fn apply_committed(&mut self) {
        while self.commit_index > self.last_applied {
            let next = self.last_applied + 1;
            let command = match self.log.get(next) {
                Some(entry) => entry.command.clone(),
                None => {
                    error!(
                        "[{}] commit index {} runs past the log (len {})",
                        self.addr,
                        self.commit_index,
                        self.log.len()
                    );
                    break;
                }
            };
            let outcome = self.machine.apply(&command);
            self.last_applied = next;
            debug!(
                "[{}] applied index {}: {:?} -> {:?}",
                self.addr, next, command, outcome.result
            );
            if let Some(waiter) = self.pending.remove(&next) {
                let _ = waiter.send(outcome);
            }
        }
    }

    //
    // membership
    //

    pub fn handle_join(&mut self, req: &JoinRequest) -> JoinResponse {
        if self.role != Role::Leader {
            if let Some(leader) = &self.leader_hint {
                if *leader != self.addr {
                    return JoinResponse {
                        status: JoinStatus::Redirected,
                        cluster_addr_list: Vec::new(),
                        cluster_leader: None,
                        address: Some(leader.clone()),
                    };
                }
            }
            // no better address known: admit optimistically
        }
        if !self.peers.contains(&req.candidate_address) {
            info!(
                "[{}] admitting {} to the cluster ({} members)",
                self.addr,
                req.candidate_address,
                self.peers.len() + 1
            );
            self.peers.push(req.candidate_address.clone());
            if self.role == Role::Leader {
                self.progress.insert(
                    req.candidate_address.clone(),
                    Progress {
                        next_index: self.log.len(),
                        match_index: -1,
                    },
                );
            }
        }
        JoinResponse {
            status: JoinStatus::Success,
            cluster_addr_list: self.peers.clone(),
            cluster_leader: self.leader_hint.clone(),
            address: None,
        }
    }

    /// Installs the cluster view returned by a successful join.
    pub fn install_membership(&mut self, mut peers: Vec<NodeAddr>, leader: Option<NodeAddr>) {
        if !peers.contains(&self.addr) {
            peers.push(self.addr.clone());
        }
        info!(
            "[{}] joined cluster of {} nodes, leader {:?}",
            self.addr,
            peers.len(),
            leader.as_ref().map(NodeAddr::as_str)
        );
        self.peers = peers;
        self.leader_hint = leader;
    }

    //
    // persistence
    //

    fn persist_meta(&mut self) {
        if let Some(stable) = &self.stable {
            if let Err(err) = stable.save_meta(self.current_term, self.voted_for.as_ref()) {
                error!("[{}] could not persist term/vote: {}", self.addr, err);
            }
        }
    }

    fn persist_log(&mut self) {
        if let Some(stable) = &self.stable {
            if let Err(err) = stable.save_log(self.log.entries()) {
                error!("[{}] could not persist log: {}", self.addr, err);
            }
        }
    }
}
