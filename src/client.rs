//! One-shot command-line client.
//!
//! Each invocation opens a session to the controller, runs a single
//! store/load/remove/list flow, and prints the outcome. Stores and loads
//! also perform the direct data-node transfers the controller brokers:
//! uploading the payload to every node named in `STORE_TO`, or pulling it
//! from the node named in `LOAD_FROM` with `RELOAD` failover when a node
//! cannot serve the bytes.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

use crate::cli::{ClientArgs, ClientCommand};
use crate::protocol::{self, Request, Response};

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(("127.0.0.1", args.cport))
        .await
        .with_context(|| format!("failed to reach controller on port {}", args.cport))?;
    let (reader, writer) = stream.into_split();
    let mut session = Session {
        reader: BufReader::new(reader),
        writer,
        timeout: Duration::from_millis(args.timeout_ms),
    };

    match args.command {
        ClientCommand::Store { path } => session.store(&path).await,
        ClientCommand::Load { name, output } => session.load(&name, &output).await,
        ClientCommand::Remove { name } => session.remove(&name).await,
        ClientCommand::List => session.list().await,
    }
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl Session {
    async fn send(&mut self, request: &Request) -> Result<()> {
        protocol::write_line(&mut self.writer, &request.to_string()).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Response> {
        let line = protocol::read_line_within(&mut self.reader, self.timeout)
            .await
            .map_err(|err| anyhow!("no reply from controller: {err}"))?;
        Response::parse(&line)
    }

    async fn store(&mut self, path: &Path) -> Result<()> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .context("path has no file name")?
            .to_string_lossy()
            .into_owned();

        self.send(&Request::Store {
            name: name.clone(),
            size: data.len() as u64,
        })
        .await?;

        let ports = match self.receive().await? {
            Response::StoreTo(ports) => ports,
            Response::FileAlreadyExists => bail!("{name} is already stored"),
            Response::NotEnoughNodes => bail!("not enough data nodes are available"),
            other => bail!("unexpected controller reply: {other:?}"),
        };

        for port in &ports {
            upload(*port, &name, &data, self.timeout)
                .await
                .with_context(|| format!("upload to node {port} failed"))?;
        }

        match self.receive().await? {
            Response::StoreComplete => {
                println!("stored {name} ({} bytes) on {ports:?}", data.len());
                Ok(())
            }
            other => bail!("store did not complete: {other:?}"),
        }
    }

    async fn load(&mut self, name: &str, output: &Path) -> Result<()> {
        self.send(&Request::Load {
            name: name.to_string(),
        })
        .await?;

        loop {
            match self.receive().await? {
                Response::LoadFrom { port, size } => {
                    match fetch(port, name, size, self.timeout).await {
                        Ok(bytes) => {
                            tokio::fs::write(output, &bytes)
                                .await
                                .with_context(|| format!("failed to write {}", output.display()))?;
                            println!("loaded {name} ({size} bytes) from node {port}");
                            return Ok(());
                        }
                        Err(err) => {
                            // Fall over to the next replica.
                            warn!(port, error = %err, "data node could not serve the file");
                            self.send(&Request::Reload {
                                name: name.to_string(),
                            })
                            .await?;
                        }
                    }
                }
                Response::FileDoesNotExist => bail!("{name} is not stored"),
                Response::LoadFailed => bail!("no data node could serve {name}"),
                Response::NotEnoughNodes => bail!("not enough data nodes are available"),
                other => bail!("unexpected controller reply: {other:?}"),
            }
        }
    }

    async fn remove(&mut self, name: &str) -> Result<()> {
        self.send(&Request::Remove {
            name: name.to_string(),
        })
        .await?;
        match self.receive().await? {
            Response::RemoveComplete => {
                println!("removed {name}");
                Ok(())
            }
            Response::FileDoesNotExist => bail!("{name} is not stored"),
            Response::NotEnoughNodes => bail!("not enough data nodes are available"),
            other => bail!("unexpected controller reply: {other:?}"),
        }
    }

    async fn list(&mut self) -> Result<()> {
        self.send(&Request::List).await?;
        match self.receive().await? {
            Response::List(names) => {
                for name in names {
                    println!("{name}");
                }
                Ok(())
            }
            Response::NotEnoughNodes => bail!("not enough data nodes are available"),
            other => bail!("unexpected controller reply: {other:?}"),
        }
    }
}

/// Pushes one file to a data node: `STORE name size`, wait for `ACK`, then
/// the raw bytes.
async fn upload(port: u16, name: &str, data: &[u8], wait: Duration) -> Result<()> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to connect to node {port}"))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    protocol::write_line(
        &mut writer,
        &format!("{} {} {}", protocol::STORE, name, data.len()),
    )
    .await?;
    let line = protocol::read_line_within(&mut reader, wait)
        .await
        .map_err(|err| anyhow!("no ack from node {port}: {err}"))?;
    if line != protocol::ACK {
        bail!("unexpected reply from node {port}: {line}");
    }
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Pulls one file from a data node: `LOAD_DATA name`, then exactly `size`
/// raw bytes.
async fn fetch(port: u16, name: &str, size: u64, wait: Duration) -> Result<Vec<u8>> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to connect to node {port}"))?;
    let (mut reader, mut writer) = stream.into_split();

    protocol::write_line(&mut writer, &format!("{} {}", protocol::LOAD_DATA, name)).await?;
    let mut bytes = vec![0u8; size as usize];
    timeout(wait, reader.read_exact(&mut bytes))
        .await
        .map_err(|_| anyhow!("timed out reading {size} bytes from node {port}"))?
        .with_context(|| format!("node {port} closed before sending the file"))?;
    Ok(bytes)
}
