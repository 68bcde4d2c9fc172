//! Timing parameters of a node.

use std::time::Duration;

use rand::RngCore;

/// Configurable timing of a node. Every node in a cluster must run with the
/// same values.
///
/// The election timeout must stay well above several heartbeat intervals, or
/// followers will start elections against a healthy leader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Interval between leader heartbeats.
    pub heartbeat_interval: Duration,

    /// Lower bound (inclusive) of the randomised election timeout.
    pub election_timeout_min: Duration,

    /// Upper bound (exclusive) of the randomised election timeout.
    pub election_timeout_max: Duration,

    /// Deadline for a single outbound RPC.
    pub rpc_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            heartbeat_interval: Duration::from_secs(1),
            election_timeout_min: Duration::from_secs(6),
            election_timeout_max: Duration::from_secs(9),
            rpc_timeout: Duration::from_secs(6),
        }
    }
}

impl Config {
    /// Draws a fresh election timeout from `[min, max)`.
    pub fn random_election_timeout(&self, rng: &mut (dyn RngCore + Send)) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        let offset = match max.checked_sub(min) {
            Some(span) if span > 0 => rng.next_u64() % span,
            _ => 0,
        };
        Duration::from_millis(min + offset)
    }
}
