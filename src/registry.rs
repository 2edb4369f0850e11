//! Live data nodes and their persistent sessions.
//!
//! A node's session carries both solicited acknowledgements and unsolicited
//! replies on one TCP stream, so each session owns a single reader task
//! that hands every inbound line to whichever waiter registered interest in
//! its leading token. Requestors never read the stream themselves; they
//! subscribe, send their directive, and await their line under a deadline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::protocol;

struct Waiter {
    tokens: Vec<&'static str>,
    tx: oneshot::Sender<String>,
}

/// One joined data node: its write half, inbound demultiplexer, and the
/// controller's running estimate of how many files it holds.
pub struct NodeSession {
    port: u16,
    writer: Mutex<OwnedWriteHalf>,
    waiters: Mutex<Vec<Waiter>>,
    file_count: AtomicUsize,
    alive: AtomicBool,
}

impl NodeSession {
    /// Takes ownership of a connection's halves and spawns the session's
    /// reader task.
    pub fn spawn(port: u16, reader: BufReader<OwnedReadHalf>, writer: OwnedWriteHalf) -> Arc<Self> {
        let session = Arc::new(NodeSession {
            port,
            writer: Mutex::new(writer),
            waiters: Mutex::new(Vec::new()),
            file_count: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
        });
        tokio::spawn(read_loop(Arc::clone(&session), reader));
        session
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn file_count(&self) -> usize {
        self.file_count.load(Ordering::Relaxed)
    }

    pub fn increment_file_count(&self) {
        self.file_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_file_count(&self) {
        let _ = self
            .file_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                Some(count.saturating_sub(1))
            });
    }

    pub fn set_file_count(&self, count: usize) {
        self.file_count.store(count, Ordering::Relaxed);
    }

    /// Registers interest in the next inbound line led by one of `tokens`.
    /// The receiver resolves with the full line, or errors once the session
    /// is gone.
    pub async fn subscribe(&self, tokens: &[&'static str]) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        if self.is_alive() {
            self.waiters.lock().await.push(Waiter {
                tokens: tokens.to_vec(),
                tx,
            });
        }
        rx
    }

    /// Best-effort write of one line to the node; a failure marks the
    /// session broken so the next liveness check evicts it.
    pub async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        match protocol::write_line(&mut *writer, line).await {
            Ok(()) => {
                debug!(port = self.port, line, "sent to data node");
                Ok(())
            }
            Err(err) => {
                warn!(port = self.port, error = %err, "write to data node failed");
                self.alive.store(false, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    async fn dispatch(&self, line: String) {
        let token = line.split_whitespace().next().unwrap_or("");
        let mut waiters = self.waiters.lock().await;
        match waiters.iter().position(|w| w.tokens.contains(&token)) {
            Some(pos) => {
                let waiter = waiters.remove(pos);
                let _ = waiter.tx.send(line);
            }
            None => {
                debug!(port = self.port, line, "discarding unsolicited message");
            }
        }
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);
        // Dropping the senders resolves every pending wait as closed.
        self.waiters.lock().await.clear();
    }
}

async fn read_loop(session: Arc<NodeSession>, mut reader: BufReader<OwnedReadHalf>) {
    loop {
        match protocol::read_line(&mut reader).await {
            Ok(Some(line)) => {
                debug!(port = session.port, line, "received from data node");
                session.dispatch(line).await;
            }
            Ok(None) => {
                debug!(port = session.port, "data node closed its session");
                break;
            }
            Err(err) => {
                warn!(port = session.port, error = %err, "data-node session read failed");
                break;
            }
        }
    }
    session.close().await;
}

/// Raised when fewer live nodes exist than replicas required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotEnoughNodes;

impl std::fmt::Display for NotEnoughNodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fewer live data nodes than required replicas")
    }
}

impl std::error::Error for NotEnoughNodes {}

/// All currently joined data nodes, keyed by their advertised port.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: Mutex<BTreeMap<u16, Arc<NodeSession>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a joining node, returning any session it replaced.
    pub async fn join(&self, session: Arc<NodeSession>) -> Option<Arc<NodeSession>> {
        self.nodes.lock().await.insert(session.port(), session)
    }

    pub async fn count(&self) -> usize {
        self.nodes.lock().await.len()
    }

    pub async fn get(&self, port: u16) -> Option<Arc<NodeSession>> {
        self.nodes.lock().await.get(&port).cloned()
    }

    /// Snapshot in ascending port order.
    pub async fn snapshot(&self) -> Vec<Arc<NodeSession>> {
        self.nodes.lock().await.values().cloned().collect()
    }

    pub async fn remove(&self, port: u16) -> Option<Arc<NodeSession>> {
        self.nodes.lock().await.remove(&port)
    }

    /// Drops every session whose reader or writer has failed, returning the
    /// evicted ports so the caller can scrub replica sets.
    pub async fn prune_dead(&self) -> Vec<u16> {
        let mut nodes = self.nodes.lock().await;
        let dead: Vec<u16> = nodes
            .iter()
            .filter(|(_, session)| !session.is_alive())
            .map(|(port, _)| *port)
            .collect();
        for port in &dead {
            nodes.remove(port);
        }
        dead
    }

    /// The `r` nodes holding the fewest files, ties broken by ascending
    /// port for reproducible placement.
    pub async fn select_least_loaded(
        &self,
        r: usize,
    ) -> Result<Vec<Arc<NodeSession>>, NotEnoughNodes> {
        let mut nodes = self.snapshot().await;
        if nodes.len() < r {
            return Err(NotEnoughNodes);
        }
        nodes.sort_by_key(|session| (session.file_count(), session.port()));
        nodes.truncate(r);
        Ok(nodes)
    }
}
