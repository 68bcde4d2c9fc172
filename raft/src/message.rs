//! Message types exchanged between nodes and clients.
//!
//! Every request and response body is encoded as self-describing JSON with
//! `camelCase` field names, so a reply can be inspected with nothing more than
//! a text decoder. The top-level RPC method set is fixed by [`Method`].

use core::fmt;

use serde::{Deserialize, Serialize};

/// A leadership term. Term `0` is the sentinel for "before any entry".
pub type Term = u64;

/// A 0-based position in the replicated log. `-1` is the sentinel for the
/// empty prefix, and appears on the wire as `prevLogIndex: -1`.
pub type LogIndex = i64;

/// The network identity of a node, in canonical `host:port` form.
///
/// Addresses are compared and hashed textually; resolving them to sockets is
/// the transport's business.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddr(String);

impl NodeAddr {
    pub fn new<T: Into<String>>(addr: T) -> Self {
        NodeAddr(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddr {
    fn from(addr: &str) -> Self {
        NodeAddr(addr.to_owned())
    }
}

/// The RPC methods a node serves. Variant names are the on-wire method names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    RequestVote,
    AppendEntries,
    ApplyMembership,
    Execute,
    RequestLog,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One replicated command, identified by its position in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub command: String,
}

/// A candidate's request for a vote in `term`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeAddr,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Log replication from a leader: entries to append after the
/// `(prevLogIndex, prevLogTerm)` anchor, plus the leader's commit index.
/// An empty `entries` list is a heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendRequest {
    pub term: Term,
    pub leader_id: NodeAddr,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResponse {
    pub term: Term,
    pub success: bool,
}

/// A new node asking to be admitted to the cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub candidate_address: NodeAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinStatus {
    Success,
    Redirected,
}

/// Reply to [`JoinRequest`]: either the accepted cluster view, or a redirect
/// to the address that should be asked instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub status: JoinStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_addr_list: Vec<NodeAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_leader: Option<NodeAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<NodeAddr>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub command: String,
}

/// Reply to [`ExecuteRequest`]: the applied result on the leader, or an error
/// carrying the best-known leader address for the client to retry against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecuteResponse {
    Done {
        result: String,
        ok: bool,
    },
    Failed {
        error: String,
        #[serde(rename = "leaderAddr")]
        leader_addr: Option<NodeAddr>,
    },
}

/// Reply to a `RequestLog` diagnostic call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogResponse {
    Entries {
        log: Vec<LogEntry>,
    },
    Failed {
        error: String,
        #[serde(rename = "leaderAddr")]
        leader_addr: Option<NodeAddr>,
    },
}

impl fmt::Display for VoteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VoteRequest(term {}, candidate {}, last log {}@{})",
            self.term, self.candidate_id, self.last_log_index, self.last_log_term
        )
    }
}

impl fmt::Display for AppendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AppendRequest(term {}, leader {}, prev {}@{}, {} entries, commit {})",
            self.term,
            self.leader_id,
            self.prev_log_index,
            self.prev_log_term,
            self.entries.len(),
            self.leader_commit
        )
    }
}
