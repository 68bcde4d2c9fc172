//! The TCP front door of a node.
//!
//! A nonblocking accept loop hands each connection to a small worker pool;
//! workers decode one envelope, run the node's handler and write the reply.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use log::{debug, error, info};
use rayon::ThreadPoolBuilder;

use raft::node::{NodeOptions, RaftNode};
use raft::{Config, NodeAddr, StableStore, StateMachine, Transport};

use crate::command::KvMachine;
use crate::error::PoolBuildError;
use crate::rpc::{read_frame, write_frame, Envelope, TcpTransport};
use crate::store::KvStore;

pub struct Server {
    stop_tx: Sender<()>,
}

impl Server {
    /// Binds the node's own address and starts serving its five RPC methods.
    pub fn start<T, S>(node: Arc<RaftNode<T, S>>) -> io::Result<Server>
    where
        T: Transport + 'static,
        S: StateMachine + 'static,
    {
        let addr = node.addr().as_str().to_owned();
        let listener = TcpListener::bind(&addr)?;
        listener.set_nonblocking(true)?;

        let pool = ThreadPoolBuilder::new()
            .thread_name(|_| "rpc handler".to_string())
            .num_threads(4)
            .build()
            .map_err(|err| io::Error::from(PoolBuildError(err)))?;

        let (stop_tx, stop_rx) = bounded(1);
        let rpc_timeout = node.config().rpc_timeout;

        thread::Builder::new()
            .name(format!("listener-{}", addr))
            .spawn(move || {
                info!("serving on {}", addr);
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let node = node.clone();
                            pool.spawn(move || {
                                if let Err(err) = handle_connection(&node, stream, rpc_timeout) {
                                    debug!("connection error: {}", err);
                                }
                            });
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(10));
                        }
                        Err(err) => {
                            error!("accept failed on {}: {}", addr, err);
                            break;
                        }
                    }
                    if stop_requested(&stop_rx) {
                        break;
                    }
                }
            })?;

        Ok(Server { stop_tx })
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    match stop_rx.try_recv() {
        Ok(()) | Err(TryRecvError::Disconnected) => true,
        Err(TryRecvError::Empty) => false,
    }
}

fn handle_connection<T, S>(
    node: &Arc<RaftNode<T, S>>,
    mut stream: TcpStream,
    rpc_timeout: Duration,
) -> io::Result<()>
where
    T: Transport + 'static,
    S: StateMachine + 'static,
{
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(rpc_timeout))?;

    let frame = read_frame(&mut stream)?;
    let envelope: Envelope = serde_json::from_slice(&frame)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let response = node.serve(envelope.method, envelope.body.get().as_bytes())?;
    write_frame(&mut stream, &response)
}

/// Boots a complete key-value node: shared store, state machine, TCP
/// transport, consensus engine and RPC server. Returns the store handle so an
/// embedding process can read what has been applied locally.
pub fn spawn_node(
    addr: NodeAddr,
    seed: Option<NodeAddr>,
    config: Config,
    data_dir: Option<PathBuf>,
) -> io::Result<(Arc<RaftNode<TcpTransport, KvMachine>>, Server, KvStore)> {
    let store = KvStore::new();
    let stable = match data_dir {
        Some(dir) => Some(StableStore::open(dir)?),
        None => None,
    };
    let node = RaftNode::launch(NodeOptions {
        addr,
        seed,
        machine: KvMachine::new(store.clone()),
        transport: TcpTransport::new(config.rpc_timeout),
        config,
        rng: None,
        stable,
    });
    let server = Server::start(node.clone())?;
    Ok((node, server, store))
}
