//! Controller scenarios driven over real sockets against scripted data
//! nodes. The scripts answer file-list and rebalance traffic on their own
//! so passes complete, while store and remove acknowledgements stay under
//! test control.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use replistore::controller::{Controller, ControllerConfig};
use replistore::protocol::{self, NodeCommand, RebalancePayload};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

type ClusterFiles = Arc<Mutex<BTreeMap<u16, Vec<String>>>>;

struct TestController {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl TestController {
    async fn start(replication: usize, timeout_ms: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let controller = Controller::new(
            listener,
            ControllerConfig {
                replication,
                timeout: Duration::from_millis(timeout_ms),
                // Long enough that only join-triggered passes run during a
                // test.
                rebalance_period: Duration::from_secs(3600),
            },
        );
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = controller.run_until(shutdown).await;
        });
        TestController {
            addr,
            shutdown: Some(shutdown_tx),
            server: Some(server),
        }
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
    }
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        TestClient {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        protocol::write_line(&mut self.writer, line)
            .await
            .expect("send");
    }

    async fn recv(&mut self) -> String {
        timeout(WAIT, protocol::read_line(&mut self.reader))
            .await
            .expect("timed out waiting for a reply")
            .expect("read")
            .expect("controller closed the session")
    }

    async fn expect(&mut self, want: &str) {
        let got = self.recv().await;
        assert_eq!(got, want);
    }

    /// Polls `LIST` until the registry holds enough nodes to serve it.
    async fn await_ready(&mut self) {
        timeout(Duration::from_secs(5), async {
            loop {
                self.send(protocol::LIST).await;
                if self.recv().await.starts_with(protocol::LIST) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("controller never became ready");
    }
}

struct ScriptedNode {
    port: u16,
    to_controller: mpsc::UnboundedSender<String>,
    rebalances: mpsc::UnboundedReceiver<RebalancePayload>,
}

impl ScriptedNode {
    fn send(&self, line: String) {
        self.to_controller.send(line).expect("node task is alive");
    }

    fn store_ack(&self, name: &str) {
        self.send(format!("{} {name}", protocol::STORE_ACK));
    }

    async fn next_rebalance(&mut self) -> RebalancePayload {
        timeout(Duration::from_secs(5), self.rebalances.recv())
            .await
            .expect("timed out waiting for a rebalance directive")
            .expect("node task is alive")
    }
}

/// Connects a scripted node: joins the controller and answers file-list,
/// remove, and rebalance traffic from the shared cluster file map.
/// Rebalance directives are also applied to the map, standing in for the
/// real node-to-node transfers.
async fn join_node(
    addr: SocketAddr,
    port: u16,
    files: &ClusterFiles,
    auto_remove_ack: bool,
) -> ScriptedNode {
    files.lock().expect("files lock").entry(port).or_default();

    let stream = TcpStream::connect(addr).await.expect("connect");
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    {
        let mut writer = writer.lock().await;
        protocol::write_line(&mut *writer, &format!("{} {port}", protocol::JOIN))
            .await
            .expect("join");
    }

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<String>();
    let (reb_tx, reb_rx) = mpsc::unbounded_channel::<RebalancePayload>();

    {
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            while let Some(line) = cmd_rx.recv().await {
                let mut writer = writer.lock().await;
                if protocol::write_line(&mut *writer, &line).await.is_err() {
                    break;
                }
            }
        });
    }

    let files = Arc::clone(files);
    tokio::spawn(async move {
        while let Ok(Some(line)) = protocol::read_line(&mut reader).await {
            let reply = match NodeCommand::parse(&line) {
                Ok(NodeCommand::List) => {
                    let names = files
                        .lock()
                        .expect("files lock")
                        .get(&port)
                        .cloned()
                        .unwrap_or_default();
                    let mut reply = String::from(protocol::LIST);
                    for name in names {
                        reply.push(' ');
                        reply.push_str(&name);
                    }
                    Some(reply)
                }
                Ok(NodeCommand::Remove { name }) => {
                    if auto_remove_ack {
                        if let Some(list) = files.lock().expect("files lock").get_mut(&port) {
                            list.retain(|f| *f != name);
                        }
                        Some(format!("{} {name}", protocol::REMOVE_ACK))
                    } else {
                        None
                    }
                }
                Ok(NodeCommand::Rebalance(payload)) => {
                    {
                        let mut files = files.lock().expect("files lock");
                        for (name, dests) in &payload.sends {
                            for dest in dests {
                                let list = files.entry(*dest).or_default();
                                if !list.contains(name) {
                                    list.push(name.clone());
                                }
                            }
                        }
                        if let Some(list) = files.get_mut(&port) {
                            list.retain(|f| !payload.removals.contains(f));
                        }
                    }
                    let _ = reb_tx.send(payload);
                    Some(protocol::REBALANCE_COMPLETE.to_string())
                }
                Err(_) => None,
            };
            if let Some(reply) = reply {
                let mut writer = writer.lock().await;
                if protocol::write_line(&mut *writer, &reply).await.is_err() {
                    break;
                }
            }
        }
    });

    ScriptedNode {
        port,
        to_controller: cmd_tx,
        rebalances: reb_rx,
    }
}

/// Stores a file through the full handshake, marking the acking nodes'
/// scripted holdings so later passes see the copies.
async fn store_file(
    client: &mut TestClient,
    nodes: &[&ScriptedNode],
    files: &ClusterFiles,
    name: &str,
    size: u64,
) {
    client.send(&format!("{} {name} {size}", protocol::STORE)).await;
    let reply = client.recv().await;
    let ports: Vec<u16> = reply
        .strip_prefix("STORE_TO ")
        .unwrap_or_else(|| panic!("expected STORE_TO, got '{reply}'"))
        .split(' ')
        .map(|p| p.parse().expect("port"))
        .collect();
    for port in &ports {
        let node = nodes
            .iter()
            .find(|n| n.port == *port)
            .unwrap_or_else(|| panic!("no scripted node on port {port}"));
        files
            .lock()
            .expect("files lock")
            .entry(*port)
            .or_default()
            .push(name.to_string());
        node.store_ack(name);
    }
    client.expect(protocol::STORE_COMPLETE).await;
}

#[tokio::test]
async fn store_happy_path_makes_the_file_visible() -> Result<()> {
    let controller = TestController::start(2, 1000).await;
    let files: ClusterFiles = Default::default();
    let a = join_node(controller.addr, 4001, &files, true).await;
    let b = join_node(controller.addr, 4002, &files, true).await;

    let mut client = TestClient::connect(controller.addr).await;
    client.await_ready().await;

    client.send("STORE a.txt 5").await;
    client.expect("STORE_TO 4001 4002").await;
    files.lock().expect("files lock").get_mut(&4001).expect("node").push("a.txt".into());
    files.lock().expect("files lock").get_mut(&4002).expect("node").push("a.txt".into());
    a.store_ack("a.txt");
    b.store_ack("a.txt");
    client.expect("STORE_COMPLETE").await;

    // Visible to any other client.
    let mut other = TestClient::connect(controller.addr).await;
    other.send("LIST").await;
    other.expect("LIST a.txt").await;

    controller.stop().await;
    Ok(())
}

#[tokio::test]
async fn store_timeout_discards_the_entry_and_readmits_the_name() -> Result<()> {
    let controller = TestController::start(2, 200).await;
    let files: ClusterFiles = Default::default();
    let a = join_node(controller.addr, 4001, &files, true).await;
    let _b = join_node(controller.addr, 4002, &files, true).await;

    let mut client = TestClient::connect(controller.addr).await;
    client.await_ready().await;

    client.send("STORE a.txt 5").await;
    client.expect("STORE_TO 4001 4002").await;
    // Only one node acknowledges; the controller stays silent toward the
    // client and forgets the file.
    a.store_ack("a.txt");
    tokio::time::sleep(Duration::from_millis(600)).await;

    let mut other = TestClient::connect(controller.addr).await;
    other.send("LIST").await;
    other.expect("LIST").await;

    other.send("STORE a.txt 5").await;
    let reply = other.recv().await;
    assert!(reply.starts_with("STORE_TO"), "store was not readmitted: {reply}");

    controller.stop().await;
    Ok(())
}

#[tokio::test]
async fn load_offers_each_replica_once_then_fails() -> Result<()> {
    let controller = TestController::start(2, 1000).await;
    let files: ClusterFiles = Default::default();
    let a = join_node(controller.addr, 4001, &files, true).await;
    let b = join_node(controller.addr, 4002, &files, true).await;

    let mut client = TestClient::connect(controller.addr).await;
    client.await_ready().await;
    store_file(&mut client, &[&a, &b], &files, "a.txt", 5).await;

    client.send("LOAD a.txt").await;
    client.expect("LOAD_FROM 4001 5").await;
    client.send("RELOAD a.txt").await;
    client.expect("LOAD_FROM 4002 5").await;
    client.send("RELOAD a.txt").await;
    client.expect("ERROR_LOAD").await;

    // Any non-retry command resets the offer sequence.
    client.send("LIST").await;
    client.expect("LIST a.txt").await;
    client.send("LOAD a.txt").await;
    client.expect("LOAD_FROM 4001 5").await;

    // The sequence is per client: a fresh session starts from the first
    // replica even while another session is mid-sequence.
    client.send("LOAD a.txt").await;
    client.expect("LOAD_FROM 4001 5").await;
    client.send("RELOAD a.txt").await;
    client.expect("LOAD_FROM 4002 5").await;
    let mut other = TestClient::connect(controller.addr).await;
    other.send("LOAD a.txt").await;
    other.expect("LOAD_FROM 4001 5").await;

    client.send("LOAD missing.txt").await;
    client.expect("ERROR_FILE_DOES_NOT_EXIST").await;

    controller.stop().await;
    Ok(())
}

#[tokio::test]
async fn remove_contacts_every_replica_and_readmits_the_name() -> Result<()> {
    let controller = TestController::start(2, 1000).await;
    let files: ClusterFiles = Default::default();
    let a = join_node(controller.addr, 4001, &files, true).await;
    let b = join_node(controller.addr, 4002, &files, true).await;

    let mut client = TestClient::connect(controller.addr).await;
    client.await_ready().await;
    store_file(&mut client, &[&a, &b], &files, "a.txt", 5).await;

    client.send("REMOVE a.txt").await;
    client.expect("REMOVE_COMPLETE").await;

    client.send("LIST").await;
    client.expect("LIST").await;

    // A fully removed name is gone: removing it again is an error and
    // storing it again is admitted.
    client.send("REMOVE a.txt").await;
    client.expect("ERROR_FILE_DOES_NOT_EXIST").await;
    store_file(&mut client, &[&a, &b], &files, "a.txt", 5).await;

    controller.stop().await;
    Ok(())
}

#[tokio::test]
async fn every_command_is_rejected_without_enough_nodes() -> Result<()> {
    let controller = TestController::start(2, 1000).await;
    let files: ClusterFiles = Default::default();
    let _only = join_node(controller.addr, 4001, &files, true).await;

    // Give the join a moment to register; one node is still not enough.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TestClient::connect(controller.addr).await;
    for command in ["STORE a 1", "LOAD a", "REMOVE a", "LIST"] {
        client.send(command).await;
        client.expect("ERROR_NOT_ENOUGH_DSTORES").await;
    }

    controller.stop().await;
    Ok(())
}

#[tokio::test]
async fn joining_node_triggers_a_balancing_pass() -> Result<()> {
    let controller = TestController::start(2, 1000).await;
    let files: ClusterFiles = Default::default();
    let mut a = join_node(controller.addr, 4001, &files, true).await;
    let mut b = join_node(controller.addr, 4002, &files, true).await;

    let mut client = TestClient::connect(controller.addr).await;
    client.await_ready().await;
    for name in ["a.txt", "b.txt", "c.txt"] {
        store_file(&mut client, &[&a, &b], &files, name, 5).await;
    }

    let _c = join_node(controller.addr, 4003, &files, true).await;

    // Both original holders are told to hand one file to the newcomer.
    let to_a = a.next_rebalance().await;
    let to_b = b.next_rebalance().await;
    assert_eq!(to_a.sends.len(), 1);
    assert_eq!(to_b.sends.len(), 1);

    // Every file still has two replicas and every node now holds exactly
    // two files.
    timeout(Duration::from_secs(5), async {
        loop {
            {
                let files = files.lock().expect("files lock");
                let balanced = files.len() == 3
                    && files.values().all(|list| list.len() == 2)
                    && ["a.txt", "b.txt", "c.txt"].iter().all(|name| {
                        files.values().filter(|list| list.contains(&name.to_string())).count()
                            == 2
                    });
                if balanced {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("cluster never rebalanced");

    client.send("LIST").await;
    client.expect("LIST a.txt b.txt c.txt").await;

    // The index follows the new placement: a.txt moved off 4001, so a load
    // is directed at its surviving replicas.
    timeout(Duration::from_secs(5), async {
        loop {
            client.send("LOAD a.txt").await;
            if client.recv().await == "LOAD_FROM 4002 5" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("replica set was never committed");

    controller.stop().await;
    Ok(())
}

#[tokio::test]
async fn rebalance_deletes_files_the_index_does_not_know() -> Result<()> {
    let controller = TestController::start(2, 1000).await;
    let files: ClusterFiles = Default::default();
    let mut a = join_node(controller.addr, 4001, &files, true).await;
    let _b = join_node(controller.addr, 4002, &files, true).await;

    let mut client = TestClient::connect(controller.addr).await;
    client.await_ready().await;

    // The node holds bytes from a store the controller never completed.
    files
        .lock()
        .expect("files lock")
        .get_mut(&4001)
        .expect("node")
        .push("orphan.txt".into());

    // A third node joining triggers the reconciling pass.
    let _c = join_node(controller.addr, 4003, &files, true).await;

    let directive = a.next_rebalance().await;
    assert_eq!(directive.removals, vec!["orphan.txt".to_string()]);
    assert!(directive.sends.is_empty());
    assert!(files
        .lock()
        .expect("files lock")
        .get(&4001)
        .expect("node")
        .is_empty());

    controller.stop().await;
    Ok(())
}
