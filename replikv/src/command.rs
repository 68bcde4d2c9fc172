//! The whitespace-tokenised command grammar and the state machine that
//! applies it.
//!
//! Commands are replicated through the consensus log as plain text and only
//! parsed at apply time, so every replica makes the same accept/reject
//! decision. A malformed command applies as a no-op with a failure result;
//! surplus tokens after a complete command are ignored.

use core::fmt;

use log::warn;

use raft::{Applied, StateMachine};

use crate::store::KvStore;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Get(String),
    Set(String, String),
    Append(String, String),
    Del(String),
    Strlen(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum CommandError {
    Empty,
    MissingArguments(&'static str),
    UnknownVerb(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Empty => write!(f, "empty command"),
            CommandError::MissingArguments(verb) => {
                write!(f, "not enough arguments for {}", verb)
            }
            CommandError::UnknownVerb(verb) => write!(f, "unknown command: {}", verb),
        }
    }
}

impl Command {
    pub fn parse(input: &str) -> Result<Command, CommandError> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let verb = *parts.first().ok_or(CommandError::Empty)?;
        let arg = |index: usize, verb: &'static str| {
            parts
                .get(index)
                .map(|part| (*part).to_owned())
                .ok_or(CommandError::MissingArguments(verb))
        };
        match verb {
            "get" => Ok(Command::Get(arg(1, "get")?)),
            "set" => Ok(Command::Set(arg(1, "set")?, arg(2, "set")?)),
            "append" => Ok(Command::Append(arg(1, "append")?, arg(2, "append")?)),
            "del" => Ok(Command::Del(arg(1, "del")?)),
            "strlen" => Ok(Command::Strlen(arg(1, "strlen")?)),
            other => Err(CommandError::UnknownVerb(other.to_owned())),
        }
    }
}

/// The deterministic applier handed to the consensus engine.
pub struct KvMachine {
    store: KvStore,
}

impl KvMachine {
    pub fn new(store: KvStore) -> Self {
        KvMachine { store }
    }

    fn run(&self, command: Command) -> String {
        match command {
            Command::Get(key) => self.store.get(&key),
            Command::Set(key, value) => {
                self.store.set(&key, &value);
                "OK".to_owned()
            }
            Command::Append(key, value) => {
                self.store.append(&key, &value);
                "OK".to_owned()
            }
            Command::Del(key) => self.store.delete(&key),
            Command::Strlen(key) => self.store.len(&key).to_string(),
        }
    }
}

impl StateMachine for KvMachine {
    fn apply(&mut self, command: &str) -> Applied {
        match Command::parse(command) {
            Ok(parsed) => Applied {
                result: self.run(parsed),
                ok: true,
            },
            Err(err) => {
                warn!("ignoring malformed command {:?}: {}", command, err);
                Applied {
                    result: String::new(),
                    ok: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_full_grammar() {
        assert_eq!(Command::parse("get k"), Ok(Command::Get("k".into())));
        assert_eq!(
            Command::parse("set k v"),
            Ok(Command::Set("k".into(), "v".into()))
        );
        assert_eq!(
            Command::parse("append k v"),
            Ok(Command::Append("k".into(), "v".into()))
        );
        assert_eq!(Command::parse("del k"), Ok(Command::Del("k".into())));
        assert_eq!(Command::parse("strlen k"), Ok(Command::Strlen("k".into())));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(Command::parse(""), Err(CommandError::Empty));
        assert_eq!(Command::parse("   "), Err(CommandError::Empty));
        assert_eq!(
            Command::parse("set k"),
            Err(CommandError::MissingArguments("set"))
        );
        assert_eq!(
            Command::parse("incr k"),
            Err(CommandError::UnknownVerb("incr".into()))
        );
    }

    #[test]
    fn surplus_tokens_are_ignored() {
        assert_eq!(
            Command::parse("set k v extra"),
            Ok(Command::Set("k".into(), "v".into()))
        );
    }

    #[test]
    fn applies_the_grammar_against_the_store() {
        let store = KvStore::new();
        let mut machine = KvMachine::new(store.clone());

        assert_eq!(machine.apply("set x 1").result, "OK");
        assert_eq!(machine.apply("append x a").result, "OK");
        assert_eq!(machine.apply("append x b").result, "OK");
        assert_eq!(machine.apply("get x").result, "1ab");
        assert_eq!(machine.apply("strlen x").result, "3");
        assert_eq!(machine.apply("del x").result, "1ab");
        assert_eq!(machine.apply("get x").result, "");
        assert_eq!(machine.apply("strlen x").result, "0");
        assert_eq!(store.get("x"), "");
    }

    #[test]
    fn malformed_commands_apply_as_failed_noops() {
        let store = KvStore::new();
        let mut machine = KvMachine::new(store.clone());
        machine.apply("set x 1");

        let outcome = machine.apply("frobnicate x");
        assert!(!outcome.ok);
        assert_eq!(outcome.result, "");

        let outcome = machine.apply("del");
        assert!(!outcome.ok);

        // nothing was mutated
        assert_eq!(store.get("x"), "1");
    }
}
