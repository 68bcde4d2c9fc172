#![allow(dead_code)]

//! In-process cluster harness.
//!
//! Nodes run with their real threads and timers, but outbound calls travel
//! through [`Fabric`], an in-memory transport that routes serialized requests
//! to the destination node's dispatcher. Traffic can be cut per direction to
//! simulate partitions and crashes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use raft::config::Config;
use raft::message::{ExecuteResponse, Method, NodeAddr};
use raft::node::{NodeOptions, RaftNode};
use raft::state_machine::{Applied, StateMachine};
use raft::transport::{Transport, TransportError};

pub const CONFIG: Config = Config {
    heartbeat_interval: Duration::from_millis(40),
    election_timeout_min: Duration::from_millis(150),
    election_timeout_max: Duration::from_millis(300),
    rpc_timeout: Duration::from_millis(150),
};

pub type TestNode = Arc<RaftNode<FabricTransport, RecordingMachine>>;
pub type AppliedLog = Arc<Mutex<Vec<String>>>;

/// Echoes every command and records the apply order for assertions.
pub struct RecordingMachine {
    applied: AppliedLog,
}

impl RecordingMachine {
    pub fn new(applied: AppliedLog) -> Self {
        RecordingMachine { applied }
    }
}

impl StateMachine for RecordingMachine {
    fn apply(&mut self, command: &str) -> Applied {
        self.applied.lock().unwrap().push(command.to_owned());
        Applied {
            result: command.to_owned(),
            ok: true,
        }
    }
}

#[derive(Default)]
struct FabricInner {
    nodes: Mutex<HashMap<NodeAddr, Weak<RaftNode<FabricTransport, RecordingMachine>>>>,
    cuts: Mutex<HashSet<(NodeAddr, NodeAddr)>>,
}

impl FabricInner {
    fn lookup(&self, addr: &NodeAddr) -> Option<TestNode> {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(addr).and_then(Weak::upgrade)
    }

    fn is_cut(&self, from: &NodeAddr, to: &NodeAddr) -> bool {
        let cuts = self.cuts.lock().unwrap();
        cuts.contains(&(from.clone(), to.clone()))
    }
}

/// The shared in-memory network.
#[derive(Clone, Default)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl Fabric {
    pub fn new() -> Self {
        Fabric::default()
    }

    pub fn transport(&self, from: NodeAddr) -> FabricTransport {
        FabricTransport {
            from,
            inner: self.inner.clone(),
        }
    }

    pub fn register(&self, node: &TestNode) {
        self.inner
            .nodes
            .lock()
            .unwrap()
            .insert(node.addr().clone(), Arc::downgrade(node));
    }

    pub fn deregister(&self, addr: &NodeAddr) {
        self.inner.nodes.lock().unwrap().remove(addr);
    }

    pub fn cut_both(&self, a: &NodeAddr, b: &NodeAddr) {
        let mut cuts = self.inner.cuts.lock().unwrap();
        cuts.insert((a.clone(), b.clone()));
        cuts.insert((b.clone(), a.clone()));
    }

    pub fn heal(&self) {
        self.inner.cuts.lock().unwrap().clear();
    }
}

pub struct FabricTransport {
    from: NodeAddr,
    inner: Arc<FabricInner>,
}

impl Transport for FabricTransport {
    fn call(
        &self,
        method: Method,
        addr: &NodeAddr,
        request: &[u8],
    ) -> Result<Bytes, TransportError> {
        if self.inner.is_cut(&self.from, addr) {
            return Err(TransportError::Timeout);
        }
        let node = self.inner.lookup(addr).ok_or(TransportError::Timeout)?;
        let response = node
            .serve(method, request)
            .map_err(|err| TransportError::Codec(err.to_string()))?;
        // the reply crosses the network too
        if self.inner.is_cut(addr, &self.from) {
            return Err(TransportError::Timeout);
        }
        Ok(response)
    }
}

pub struct TestCluster {
    pub fabric: Fabric,
    pub nodes: Vec<TestNode>,
    pub applied: Vec<AppliedLog>,
}

impl TestCluster {
    /// Node 0 bootstraps alone; every later node joins through node 0.
    pub fn launch(size: usize) -> TestCluster {
        TestCluster::launch_with(size, |i| if i == 0 { None } else { Some(0) })
    }

    pub fn launch_with(size: usize, seed_for: impl Fn(usize) -> Option<usize>) -> TestCluster {
        init_logger();
        let fabric = Fabric::new();
        let mut cluster = TestCluster {
            fabric,
            nodes: Vec::new(),
            applied: Vec::new(),
        };
        for i in 0..size {
            let applied: AppliedLog = Arc::new(Mutex::new(Vec::new()));
            let node = RaftNode::launch(NodeOptions {
                addr: test_addr(i),
                seed: seed_for(i).map(test_addr),
                machine: RecordingMachine::new(applied.clone()),
                transport: cluster.fabric.transport(test_addr(i)),
                config: CONFIG,
                rng: Some(Box::new(ChaCha8Rng::seed_from_u64(0xC0FFEE + i as u64))),
                stable: None,
            });
            cluster.fabric.register(&node);
            cluster.nodes.push(node);
            cluster.applied.push(applied);
        }
        cluster
    }

    pub fn leader(&self) -> Option<TestNode> {
        self.nodes.iter().find(|node| node.is_leader()).cloned()
    }

    /// Waits until one of `candidates` leads, panicking after `timeout`.
    pub fn wait_for_leader_among(&self, candidates: &[usize], timeout: Duration) -> TestNode {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(node) = candidates
                .iter()
                .map(|i| &self.nodes[*i])
                .find(|node| node.is_leader())
            {
                return node.clone();
            }
            if Instant::now() >= deadline {
                panic!("no leader among {:?} after {:?}", candidates, timeout);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Simulates a crash: the node stops its timers and leaves the network.
    pub fn stop(&self, i: usize) {
        self.fabric.deregister(self.nodes[i].addr());
        self.nodes[i].shutdown();
    }

    /// Cuts both directions between node `i` and everyone else.
    pub fn isolate(&self, i: usize) {
        for (j, node) in self.nodes.iter().enumerate() {
            if j != i {
                self.fabric.cut_both(self.nodes[i].addr(), node.addr());
            }
        }
    }

    pub fn heal(&self) {
        self.fabric.heal();
    }

    pub fn applied_log(&self, i: usize) -> Vec<String> {
        self.applied[i].lock().unwrap().clone()
    }

    /// Keeps offering `command` to whichever of `candidates` currently leads
    /// until some leader commits it. Survives leadership churn; panics after
    /// `timeout`.
    pub fn execute_until_committed(
        &self,
        candidates: &[usize],
        command: &str,
        timeout: Duration,
    ) -> TestNode {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let leader = candidates
                .iter()
                .map(|i| &self.nodes[*i])
                .find(|node| node.is_leader());
            match leader {
                Some(node) => match node.execute(command.to_owned()) {
                    ExecuteResponse::Done { ok, .. } => {
                        assert!(ok, "command {:?} was refused", command);
                        return node.clone();
                    }
                    ExecuteResponse::Failed { .. } => thread::sleep(Duration::from_millis(50)),
                },
                None => thread::sleep(Duration::from_millis(20)),
            }
        }
        panic!(
            "no leader among {:?} committed {:?} within {:?}",
            candidates, command, timeout
        );
    }
}

pub fn test_addr(i: usize) -> NodeAddr {
    NodeAddr::new(format!("10.83.0.{}:7000", i + 1))
}

/// Polls `check` every 10 ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

struct TestLogger;

static LOGGER: TestLogger = TestLogger;

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        eprintln!("{:<5} {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

pub fn init_logger() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}
