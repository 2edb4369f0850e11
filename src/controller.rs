//! The coordinating controller.
//!
//! One task per connection: a connection is a client session until it sends
//! `JOIN`, at which point its halves are handed to the node registry and it
//! becomes that data node's persistent session. Stores and removes fan out
//! directives to the chosen nodes and collect acknowledgements under a
//! single deadline; loads hand the client a node to contact directly. A
//! dedicated driver task runs the rebalance on a fixed period and
//! immediately after every join, serialized against client operations by
//! the gate.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::balance::{self, IndexView, PlanState};
use crate::gate::OpGate;
use crate::index::FileIndex;
use crate::protocol::{self, NodeCommand, NodeReply, Request, Response};
use crate::registry::{NodeRegistry, NodeSession};

#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Replicas kept for every file.
    pub replication: usize,
    /// Deadline for every acknowledgement wait.
    pub timeout: Duration,
    /// Delay between periodic rebalance passes.
    pub rebalance_period: Duration,
}

pub struct Controller {
    listener: TcpListener,
    state: Arc<ControllerState>,
    trigger_rx: mpsc::Receiver<()>,
}

impl Controller {
    pub fn new(listener: TcpListener, config: ControllerConfig) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let state = Arc::new(ControllerState {
            config,
            index: Mutex::new(FileIndex::new()),
            registry: NodeRegistry::new(),
            gate: OpGate::new(),
            trigger_tx,
        });
        Controller {
            listener,
            state,
            trigger_rx,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Controller {
            listener,
            state,
            trigger_rx,
        } = self;
        let driver = tokio::spawn(rebalance_driver(Arc::clone(&state), trigger_rx));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("controller shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&state);
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, peer, state).await {
                                    debug!(peer = %peer, error = ?err, "connection closed with error");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(error = ?err, "failed to accept connection");
                        }
                    }
                }
            }
        }

        driver.abort();
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

struct ControllerState {
    config: ControllerConfig,
    index: Mutex<FileIndex>,
    registry: NodeRegistry,
    gate: OpGate,
    trigger_tx: mpsc::Sender<()>,
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ControllerState>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;
    // Ports already offered to this client for the file it is loading.
    let mut recent_loads: Vec<u16> = Vec::new();

    let joined = loop {
        let Some(line) = protocol::read_line(&mut reader).await? else {
            break None;
        };
        debug!(peer = %peer, line, "received");

        let request = match Request::parse(&line) {
            Ok(request) => request,
            Err(err) => {
                // A broken JOIN leaves the session's role unknown; cut it.
                if Request::first_token(&line) == protocol::JOIN {
                    warn!(peer = %peer, error = %err, "malformed join, closing session");
                    return Ok(());
                }
                warn!(peer = %peer, error = %err, "discarding malformed line");
                continue;
            }
        };

        // A load sequence ends at the first command that is not a retry.
        if !matches!(request, Request::Reload { .. }) {
            recent_loads.clear();
        }

        match request {
            Request::Join { port } => break Some(port),
            Request::Store { name, size } => {
                state.gate.begin_op().await;
                let result = state.store(&mut writer, &name, size).await;
                state.gate.end_op().await;
                result?;
            }
            Request::Remove { name } => {
                state.gate.begin_op().await;
                let result = state.remove(&mut writer, &name).await;
                state.gate.end_op().await;
                result?;
            }
            Request::Load { name } | Request::Reload { name } => {
                state.gate.wait_admitted().await;
                state.load(&mut writer, &name, &mut recent_loads).await?;
            }
            Request::List => {
                state.gate.wait_admitted().await;
                state.list(&mut writer).await?;
            }
        }
    };

    if let Some(port) = joined {
        info!(port, peer = %peer, "data node joined");
        let session = NodeSession::spawn(port, reader, writer);
        if state.registry.join(session).await.is_some() {
            warn!(port, "replaced an existing session for this node");
        }
        state.request_rebalance();
    }
    Ok(())
}

async fn reply(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let line = response.to_string();
    protocol::write_line(writer, &line).await?;
    debug!(line, "replied");
    Ok(())
}

impl ControllerState {
    fn request_rebalance(&self) {
        // A full channel means a pass is already pending; the extra request
        // is dropped.
        let _ = self.trigger_tx.try_send(());
    }

    async fn store(&self, writer: &mut OwnedWriteHalf, name: &str, size: u64) -> Result<()> {
        if self.registry.count().await < self.config.replication {
            return reply(writer, &Response::NotEnoughNodes).await;
        }
        if self.index.lock().await.admit_store(name, size).is_err() {
            return reply(writer, &Response::FileAlreadyExists).await;
        }
        let nodes = match self.registry.select_least_loaded(self.config.replication).await {
            Ok(nodes) => nodes,
            Err(_) => {
                // A node died between the guard and the selection.
                self.index.lock().await.drop_entry(name);
                return reply(writer, &Response::NotEnoughNodes).await;
            }
        };
        let ports: Vec<u16> = nodes.iter().map(|node| node.port()).collect();
        self.index.lock().await.set_replicas(name, &ports);

        // Subscribe before the client learns the targets: the first ack can
        // arrive as soon as the client reaches any node.
        let mut waits = Vec::with_capacity(nodes.len());
        for node in &nodes {
            waits.push((
                Arc::clone(node),
                node.subscribe(&[protocol::STORE_ACK]).await,
            ));
        }
        if let Err(err) = reply(writer, &Response::StoreTo(ports)).await {
            // The client is gone before learning the targets; nothing will
            // be uploaded, so the admission is undone.
            self.index.lock().await.drop_entry(name);
            return Err(err);
        }

        let deadline = Instant::now() + self.config.timeout;
        let expected = format!("{} {name}", protocol::STORE_ACK);
        let mut complete = true;
        for (node, rx) in waits {
            match timeout_at(deadline, rx).await {
                Ok(Ok(line)) if line == expected => node.increment_file_count(),
                Ok(Ok(line)) => {
                    warn!(port = node.port(), line, expected, "unexpected store ack");
                    complete = false;
                }
                Ok(Err(_)) => {
                    warn!(port = node.port(), "node session closed before store ack");
                    complete = false;
                }
                Err(_) => {
                    warn!(port = node.port(), file = name, "store ack timed out");
                    complete = false;
                }
            }
        }

        if complete {
            self.index.lock().await.mark_store_complete(name);
            reply(writer, &Response::StoreComplete).await
        } else {
            // The client hears nothing and times out on its own side. Any
            // copies that did land are reconciled as phantoms by the next
            // rebalance.
            self.index.lock().await.drop_entry(name);
            Ok(())
        }
    }

    async fn remove(&self, writer: &mut OwnedWriteHalf, name: &str) -> Result<()> {
        if self.registry.count().await < self.config.replication {
            return reply(writer, &Response::NotEnoughNodes).await;
        }
        let replicas = match self.index.lock().await.admit_remove(name) {
            Ok(replicas) => replicas,
            Err(_) => return reply(writer, &Response::FileDoesNotExist).await,
        };

        let mut waits = Vec::with_capacity(replicas.len());
        let mut complete = true;
        for port in replicas {
            let Some(node) = self.registry.get(port).await else {
                warn!(port, file = name, "replica node is no longer registered");
                complete = false;
                continue;
            };
            let rx = node
                .subscribe(&[protocol::REMOVE_ACK, protocol::ERROR_FILE_DOES_NOT_EXIST])
                .await;
            let _ = node
                .write_line(
                    &NodeCommand::Remove {
                        name: name.to_string(),
                    }
                    .to_string(),
                )
                .await;
            waits.push((node, rx));
        }

        let deadline = Instant::now() + self.config.timeout;
        let acked = format!("{} {name}", protocol::REMOVE_ACK);
        let missing = format!("{} {name}", protocol::ERROR_FILE_DOES_NOT_EXIST);
        for (node, rx) in waits {
            match timeout_at(deadline, rx).await {
                Ok(Ok(line)) if line == acked => node.decrement_file_count(),
                Ok(Ok(line)) if line == missing => {
                    // The replica is already gone; that still completes the
                    // remove.
                }
                Ok(Ok(line)) => {
                    warn!(port = node.port(), line, "unexpected remove ack");
                    complete = false;
                }
                Ok(Err(_)) => {
                    warn!(port = node.port(), "node session closed before remove ack");
                    complete = false;
                }
                Err(_) => {
                    warn!(port = node.port(), file = name, "remove ack timed out");
                    complete = false;
                }
            }
        }

        if complete {
            self.index.lock().await.drop_entry(name);
            reply(writer, &Response::RemoveComplete).await
        } else {
            // The entry stays in its removing state; the next rebalance
            // deletes leftover copies and retires it.
            Ok(())
        }
    }

    async fn load(
        &self,
        writer: &mut OwnedWriteHalf,
        name: &str,
        recent: &mut Vec<u16>,
    ) -> Result<()> {
        if self.registry.count().await < self.config.replication {
            return reply(writer, &Response::NotEnoughNodes).await;
        }
        let Some((size, replicas)) = self.index.lock().await.visible(name) else {
            return reply(writer, &Response::FileDoesNotExist).await;
        };
        for port in replicas {
            if !recent.contains(&port) {
                recent.push(port);
                return reply(writer, &Response::LoadFrom { port, size }).await;
            }
        }
        // Every replica has been offered already.
        reply(writer, &Response::LoadFailed).await
    }

    async fn list(&self, writer: &mut OwnedWriteHalf) -> Result<()> {
        if self.registry.count().await < self.config.replication {
            return reply(writer, &Response::NotEnoughNodes).await;
        }
        let names = self.index.lock().await.snapshot_visible();
        reply(writer, &Response::List(names)).await
    }

    async fn rebalance_pass(&self) {
        info!("rebalance started");
        self.gate.begin_exclusive().await;
        self.run_rebalance().await;
        self.gate.end_exclusive().await;
        info!("rebalance finished");
    }

    async fn run_rebalance(&self) {
        let evicted = self.registry.prune_dead().await;
        if !evicted.is_empty() {
            info!(ports = ?evicted, "evicted dead data nodes");
            let mut index = self.index.lock().await;
            for port in &evicted {
                index.scrub_node(*port);
            }
        }

        let r = self.config.replication;
        let nodes = self.registry.snapshot().await;
        if nodes.len() < r {
            info!(live = nodes.len(), required = r, "not enough data nodes to rebalance");
            return;
        }

        // Ask every node what it actually holds.
        let mut waits = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let rx = node.subscribe(&[protocol::LIST]).await;
            let _ = node.write_line(protocol::LIST).await;
            waits.push((Arc::clone(node), rx));
        }
        let deadline = Instant::now() + self.config.timeout;
        let mut reports: BTreeMap<u16, Vec<String>> = BTreeMap::new();
        for (node, rx) in waits {
            match timeout_at(deadline, rx).await {
                Ok(Ok(line)) => match NodeReply::parse(&line) {
                    Ok(NodeReply::List(names)) => {
                        reports.insert(node.port(), names);
                    }
                    _ => warn!(port = node.port(), line, "unexpected reply to list"),
                },
                Ok(Err(_)) | Err(_) => {
                    warn!(port = node.port(), "node did not report its files; excluded from this pass");
                }
            }
        }
        if reports.len() < r {
            info!(responding = reports.len(), required = r, "not enough nodes responded; skipping this pass");
            return;
        }

        let (view, visible) = {
            let index = self.index.lock().await;
            (
                IndexView {
                    known: index.known_names(),
                    removing: index.removing_names(),
                },
                index.visible_len(),
            )
        };
        let (min, max) = balance::thresholds(r, visible, reports.len());
        let reported: BTreeSet<String> = reports.values().flatten().cloned().collect();
        let responding: Vec<u16> = reports.keys().copied().collect();

        let mut plan = PlanState::from_reports(reports, &view);
        plan.repair_replication(r);
        plan.balance_loads(min, max);

        // A pending remove with no surviving copy has nothing left to
        // reconcile; retire it now.
        {
            let mut index = self.index.lock().await;
            for name in &view.removing {
                if !reported.contains(name) {
                    index.drop_entry(name);
                }
            }
        }

        if !plan.has_changes() {
            debug!("placement already satisfies the invariants");
            self.commit_file_counts(&responding, &plan).await;
            return;
        }

        // One directive per node with work to do.
        let mut waits = Vec::new();
        for port in &responding {
            let Some(payload) = plan.instruction_for(*port) else {
                continue;
            };
            let Some(node) = self.registry.get(*port).await else {
                continue;
            };
            let rx = node.subscribe(&[protocol::REBALANCE_COMPLETE]).await;
            let _ = node
                .write_line(&NodeCommand::Rebalance(payload).to_string())
                .await;
            waits.push((node, rx));
        }

        let deadline = Instant::now() + self.config.timeout;
        let mut complete = true;
        for (node, rx) in waits {
            match timeout_at(deadline, rx).await {
                Ok(Ok(line)) if line == protocol::REBALANCE_COMPLETE => {
                    node.set_file_count(plan.planned_count(node.port()));
                }
                Ok(Ok(line)) => {
                    warn!(port = node.port(), line, "unexpected rebalance confirmation");
                    complete = false;
                }
                Ok(Err(_)) => {
                    warn!(port = node.port(), "node session closed during rebalance");
                    complete = false;
                }
                Err(_) => {
                    warn!(port = node.port(), "rebalance confirmation timed out");
                    complete = false;
                }
            }
        }

        if complete {
            info!("all nodes completed the rebalance");
            {
                let mut index = self.index.lock().await;
                for (name, holders) in plan.placements() {
                    index.set_replicas(name, holders);
                }
                for name in &view.removing {
                    index.drop_entry(name);
                }
            }
            self.commit_file_counts(&responding, &plan).await;
        } else {
            warn!("rebalance incomplete; invariants will be restored on a later pass");
        }
    }

    /// Resets every responding node's file-count estimate to its planned
    /// holdings.
    async fn commit_file_counts(&self, responding: &[u16], plan: &PlanState) {
        for port in responding {
            if let Some(node) = self.registry.get(*port).await {
                node.set_file_count(plan.planned_count(*port));
            }
        }
    }
}

async fn rebalance_driver(state: Arc<ControllerState>, mut trigger: mpsc::Receiver<()>) {
    let period = state.config.rebalance_period;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            received = trigger.recv() => {
                if received.is_none() {
                    return;
                }
            }
        }
        state.rebalance_pass().await;
        // Requests that arrived while the pass ran are dropped, not queued.
        while trigger.try_recv().is_ok() {}
    }
}
