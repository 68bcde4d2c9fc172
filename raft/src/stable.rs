//! Optional file persistence of `(currentTerm, votedFor, log)`.
//!
//! Nothing in the protocol requires this; a node that restarts without its
//! stable state simply rejoins with an empty log. Writes go to a temp file
//! first and are renamed into place so a crash never leaves a torn file.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::message::{LogEntry, NodeAddr, Term};

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";

#[derive(Serialize, Deserialize, Default)]
struct Meta {
    current_term: Term,
    voted_for: Option<NodeAddr>,
}

pub struct StableStore {
    dir: PathBuf,
}

impl StableStore {
    /// Opens (creating if needed) a state directory.
    pub fn open<P: Into<PathBuf>>(dir: P) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(StableStore { dir })
    }

    pub fn save_meta(&self, current_term: Term, voted_for: Option<&NodeAddr>) -> io::Result<()> {
        let meta = Meta {
            current_term,
            voted_for: voted_for.cloned(),
        };
        let json = serde_json::to_vec(&meta)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.write_atomic(META_FILE, &json)
    }

    pub fn save_log(&self, entries: &[LogEntry]) -> io::Result<()> {
        let json = serde_json::to_vec(entries)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.write_atomic(LOG_FILE, &json)
    }

    /// Loads persisted state, defaulting each missing file.
    pub fn load(&self) -> io::Result<(Term, Option<NodeAddr>, Vec<LogEntry>)> {
        let meta: Meta = match self.read(META_FILE)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?,
            None => Meta::default(),
        };
        let entries: Vec<LogEntry> = match self.read(LOG_FILE)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?,
            None => Vec::new(),
        };
        Ok((meta.current_term, meta.voted_for, entries))
    }

    fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        Ok(Some(bytes))
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", name));
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(tmp, self.dir.join(name))
    }
}
