//! A leader-based consensus engine for replicating a log of textual commands
//! across a cluster of peers.
//!
//! One node per term is elected leader; clients send commands to it, the
//! leader replicates them to every follower, and once a strict majority holds
//! an entry it is committed and applied, in log order, to a deterministic
//! state machine on every replica. Followers that diverge are walked back to
//! the leader's log one index at a time.
//!
//! The engine owns the protocol only. Two collaborators are consumed through
//! traits: a [`Transport`](transport::Transport) delivering one-shot
//! request/response calls, and a [`StateMachine`](state_machine::StateMachine)
//! applying committed commands.

pub mod config;
pub mod log;
pub mod message;
pub mod node;
pub mod stable;
mod state;
pub mod state_machine;
pub mod transport;

pub use config::Config;
pub use message::{Method, NodeAddr};
pub use node::{NodeOptions, RaftNode};
pub use stable::StableStore;
pub use state::Role;
pub use state_machine::{Applied, StateMachine};
pub use transport::{Transport, TransportError};
