//! A data node: serves one file folder and executes controller directives.
//!
//! On startup the node empties its folder, connects to the controller, and
//! announces itself with `JOIN`; that connection stays open as the
//! controller session, carrying directives down and acknowledgements up.
//! File bytes never touch the controller: clients and peer nodes connect to
//! the node's own listener to push and pull payloads directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cli::DatanodeArgs;
use crate::protocol::{self, NodeCommand, NodeReply, RebalancePayload};

pub async fn run(args: DatanodeArgs) -> Result<()> {
    reset_folder(&args.file_folder).await?;

    let listener = TcpListener::bind(("127.0.0.1", args.port))
        .await
        .with_context(|| format!("failed to bind port {}", args.port))?;
    let controller = TcpStream::connect(("127.0.0.1", args.cport))
        .await
        .with_context(|| format!("failed to reach controller on port {}", args.cport))?;
    let (controller_reader, mut controller_writer) = controller.into_split();
    protocol::write_line(
        &mut controller_writer,
        &format!("{} {}", protocol::JOIN, args.port),
    )
    .await?;
    info!(port = args.port, cport = args.cport, "joined controller");

    let state = Arc::new(NodeState {
        folder: args.file_folder,
        timeout: Duration::from_millis(args.timeout_ms),
        controller: Mutex::new(controller_writer),
    });

    let mut controller_task = tokio::spawn(serve_controller(
        BufReader::new(controller_reader),
        Arc::clone(&state),
    ));

    loop {
        tokio::select! {
            ended = &mut controller_task => {
                if let Ok(Err(err)) = ended {
                    warn!(error = ?err, "controller session failed");
                }
                info!("controller session ended; shutting down");
                return Ok(());
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(err) = handle_transfer(stream, state).await {
                                debug!(peer = %peer, error = ?err, "transfer connection closed with error");
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
}

/// Empties the node's folder so stale files from an earlier run are not
/// reported to the controller as current.
async fn reset_folder(folder: &Path) -> Result<()> {
    if fs::metadata(folder).await.is_ok() {
        fs::remove_dir_all(folder)
            .await
            .with_context(|| format!("failed to clear {}", folder.display()))?;
    }
    fs::create_dir_all(folder)
        .await
        .with_context(|| format!("failed to create {}", folder.display()))
}

/// File names are opaque single tokens; anything path-like is refused
/// rather than resolved outside the folder.
fn local_path(folder: &Path, name: &str) -> Option<PathBuf> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return None;
    }
    Some(folder.join(name))
}

struct NodeState {
    folder: PathBuf,
    timeout: Duration,
    controller: Mutex<OwnedWriteHalf>,
}

async fn serve_controller(
    mut reader: BufReader<OwnedReadHalf>,
    state: Arc<NodeState>,
) -> Result<()> {
    loop {
        let Some(line) = protocol::read_line(&mut reader).await? else {
            return Ok(());
        };
        debug!(line, "controller message");
        let command = match NodeCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                warn!(error = %err, line, "discarding malformed controller message");
                continue;
            }
        };
        match command {
            NodeCommand::List => state.send_file_list().await?,
            NodeCommand::Remove { name } => state.remove_file(&name).await?,
            NodeCommand::Rebalance(payload) => state.rebalance(payload).await?,
        }
    }
}

impl NodeState {
    async fn send_to_controller(&self, message: &NodeReply) -> Result<()> {
        let mut writer = self.controller.lock().await;
        protocol::write_line(&mut *writer, &message.to_string()).await?;
        debug!(message = %message, "sent to controller");
        Ok(())
    }

    async fn send_file_list(&self) -> Result<()> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.folder).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        self.send_to_controller(&NodeReply::List(names)).await
    }

    async fn remove_file(&self, name: &str) -> Result<()> {
        let missing = NodeReply::FileMissing {
            name: name.to_string(),
        };
        let Some(path) = local_path(&self.folder, name) else {
            warn!(name, "refusing to remove a path-like name");
            return self.send_to_controller(&missing).await;
        };
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.send_to_controller(&NodeReply::RemoveAck {
                    name: name.to_string(),
                })
                .await
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.send_to_controller(&missing).await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Pushes every scheduled copy to its destinations, deletes the local
    /// removals, then confirms the whole directive.
    async fn rebalance(&self, payload: RebalancePayload) -> Result<()> {
        for (name, dests) in &payload.sends {
            let Some(path) = local_path(&self.folder, name) else {
                warn!(name, "refusing to transfer a path-like name");
                continue;
            };
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(name, error = %err, "cannot read file scheduled for transfer");
                    continue;
                }
            };
            for dest in dests {
                if let Err(err) = self.push_copy(*dest, name, &bytes).await {
                    warn!(name, dest, error = %err, "transfer to peer failed");
                }
            }
        }
        for name in &payload.removals {
            if let Some(path) = local_path(&self.folder, name) {
                match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!(name, error = %err, "failed to delete file"),
                }
            }
        }
        self.send_to_controller(&NodeReply::RebalanceComplete).await
    }

    async fn push_copy(&self, dest: u16, name: &str, bytes: &[u8]) -> Result<()> {
        let stream = TcpStream::connect(("127.0.0.1", dest))
            .await
            .with_context(|| format!("failed to connect to node {dest}"))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        protocol::write_line(
            &mut writer,
            &format!("{} {} {}", protocol::REBALANCE_STORE, name, bytes.len()),
        )
        .await?;
        let line = protocol::read_line_within(&mut reader, self.timeout)
            .await
            .map_err(|err| anyhow!("no ack from node {dest}: {err}"))?;
        if line != protocol::ACK {
            bail!("unexpected reply from node {dest}: {line}");
        }
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive_payload(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        size: u64,
    ) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; size as usize];
        timeout(self.timeout, reader.read_exact(&mut bytes))
            .await
            .map_err(|_| anyhow!("timed out reading {size} payload bytes"))??;
        Ok(bytes)
    }
}

/// Serves one client or peer connection on the node's own listener.
async fn handle_transfer(stream: TcpStream, state: Arc<NodeState>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    loop {
        let Some(line) = protocol::read_line(&mut reader).await? else {
            return Ok(());
        };
        debug!(line, "transfer message");
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [protocol::STORE, name, size] => {
                let Ok(size) = size.parse::<u64>() else {
                    warn!(line, "discarding store with a bad size");
                    continue;
                };
                let Some(path) = local_path(&state.folder, name) else {
                    warn!(name, "refusing to store a path-like name");
                    continue;
                };
                protocol::write_line(&mut writer, protocol::ACK).await?;
                let bytes = state.receive_payload(&mut reader, size).await?;
                fs::write(&path, &bytes).await?;
                state
                    .send_to_controller(&NodeReply::StoreAck {
                        name: (*name).to_string(),
                    })
                    .await?;
            }
            [protocol::REBALANCE_STORE, name, size] => {
                let Ok(size) = size.parse::<u64>() else {
                    warn!(line, "discarding transfer with a bad size");
                    continue;
                };
                let Some(path) = local_path(&state.folder, name) else {
                    warn!(name, "refusing to store a path-like name");
                    continue;
                };
                protocol::write_line(&mut writer, protocol::ACK).await?;
                let bytes = state.receive_payload(&mut reader, size).await?;
                fs::write(&path, &bytes).await?;
            }
            [protocol::LOAD_DATA, name] => {
                let Some(path) = local_path(&state.folder, name) else {
                    return Ok(());
                };
                match fs::read(&path).await {
                    Ok(bytes) => {
                        writer.write_all(&bytes).await?;
                        writer.flush().await?;
                    }
                    // Closing without a payload tells the client to retry
                    // another replica.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                    Err(err) => return Err(err.into()),
                }
            }
            _ => warn!(line, "discarding unrecognized transfer message"),
        }
    }
}
