//! The deterministic applier consumed by the commit pipeline.

/// Outcome of applying one command.
///
/// `ok = false` marks a command the machine refused (unknown verb, missing
/// arguments); the entry stays committed and the pipeline moves on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    pub result: String,
    pub ok: bool,
}

/// A deterministic state machine over textual commands.
///
/// Replicas apply the same committed prefix in the same order, so any two
/// machines fed identical inputs must produce identical results.
pub trait StateMachine: Send {
    fn apply(&mut self, command: &str) -> Applied;
}
