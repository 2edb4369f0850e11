//! Wire protocol shared by the controller, data nodes, and clients.
//!
//! Every message is one line of text: tokens separated by single spaces,
//! integers in decimal ASCII, the line terminated by `\n`. The codec at the
//! bottom of this module reads and writes whole lines; the enums above it
//! give each peer direction a typed view of the traffic and round-trip
//! through [`std::fmt::Display`] and the `parse` constructors.

use std::fmt;
use std::io;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

pub const JOIN: &str = "JOIN";
pub const STORE: &str = "STORE";
pub const LOAD: &str = "LOAD";
pub const RELOAD: &str = "RELOAD";
pub const REMOVE: &str = "REMOVE";
pub const LIST: &str = "LIST";

pub const STORE_TO: &str = "STORE_TO";
pub const STORE_COMPLETE: &str = "STORE_COMPLETE";
pub const LOAD_FROM: &str = "LOAD_FROM";
pub const REMOVE_COMPLETE: &str = "REMOVE_COMPLETE";

pub const STORE_ACK: &str = "STORE_ACK";
pub const REMOVE_ACK: &str = "REMOVE_ACK";
pub const REBALANCE: &str = "REBALANCE";
pub const REBALANCE_COMPLETE: &str = "REBALANCE_COMPLETE";

pub const ACK: &str = "ACK";
pub const LOAD_DATA: &str = "LOAD_DATA";
pub const REBALANCE_STORE: &str = "REBALANCE_STORE";

pub const ERROR_FILE_ALREADY_EXISTS: &str = "ERROR_FILE_ALREADY_EXISTS";
pub const ERROR_FILE_DOES_NOT_EXIST: &str = "ERROR_FILE_DOES_NOT_EXIST";
pub const ERROR_NOT_ENOUGH_DSTORES: &str = "ERROR_NOT_ENOUGH_DSTORES";
pub const ERROR_LOAD: &str = "ERROR_LOAD";

/// A command arriving on a controller connection. `JOIN` turns the
/// connection into a persistent data-node session; everything else is a
/// client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Store { name: String, size: u64 },
    Load { name: String },
    Reload { name: String },
    Remove { name: String },
    List,
    Join { port: u16 },
}

impl Request {
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [STORE, name, size] => Ok(Request::Store {
                name: (*name).to_string(),
                size: size.parse().map_err(|_| anyhow!("bad file size: {size}"))?,
            }),
            [LOAD, name] => Ok(Request::Load {
                name: (*name).to_string(),
            }),
            [RELOAD, name] => Ok(Request::Reload {
                name: (*name).to_string(),
            }),
            [REMOVE, name] => Ok(Request::Remove {
                name: (*name).to_string(),
            }),
            [LIST] => Ok(Request::List),
            [JOIN, port] => Ok(Request::Join {
                port: port.parse().map_err(|_| anyhow!("bad port: {port}"))?,
            }),
            _ => bail!("unrecognized request: {line}"),
        }
    }

    /// First token of the line, used to tell a malformed `JOIN` (which must
    /// close the session) from other malformed lines (which are discarded).
    pub fn first_token(line: &str) -> &str {
        line.split_whitespace().next().unwrap_or("")
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Store { name, size } => write!(f, "{STORE} {name} {size}"),
            Request::Load { name } => write!(f, "{LOAD} {name}"),
            Request::Reload { name } => write!(f, "{RELOAD} {name}"),
            Request::Remove { name } => write!(f, "{REMOVE} {name}"),
            Request::List => write!(f, "{LIST}"),
            Request::Join { port } => write!(f, "{JOIN} {port}"),
        }
    }
}

/// A controller reply to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    StoreTo(Vec<u16>),
    StoreComplete,
    LoadFrom { port: u16, size: u64 },
    RemoveComplete,
    List(Vec<String>),
    FileAlreadyExists,
    FileDoesNotExist,
    NotEnoughNodes,
    LoadFailed,
}

impl Response {
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [STORE_TO, ports @ ..] if !ports.is_empty() => {
                let ports = ports
                    .iter()
                    .map(|p| p.parse().map_err(|_| anyhow!("bad port: {p}")))
                    .collect::<Result<Vec<u16>>>()?;
                Ok(Response::StoreTo(ports))
            }
            [STORE_COMPLETE] => Ok(Response::StoreComplete),
            [LOAD_FROM, port, size] => Ok(Response::LoadFrom {
                port: port.parse().map_err(|_| anyhow!("bad port: {port}"))?,
                size: size.parse().map_err(|_| anyhow!("bad file size: {size}"))?,
            }),
            [REMOVE_COMPLETE] => Ok(Response::RemoveComplete),
            [LIST, names @ ..] => Ok(Response::List(
                names.iter().map(|n| (*n).to_string()).collect(),
            )),
            [ERROR_FILE_ALREADY_EXISTS] => Ok(Response::FileAlreadyExists),
            [ERROR_FILE_DOES_NOT_EXIST] => Ok(Response::FileDoesNotExist),
            [ERROR_NOT_ENOUGH_DSTORES] => Ok(Response::NotEnoughNodes),
            [ERROR_LOAD] => Ok(Response::LoadFailed),
            _ => bail!("unrecognized response: {line}"),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::StoreTo(ports) => {
                write!(f, "{STORE_TO}")?;
                for port in ports {
                    write!(f, " {port}")?;
                }
                Ok(())
            }
            Response::StoreComplete => write!(f, "{STORE_COMPLETE}"),
            Response::LoadFrom { port, size } => write!(f, "{LOAD_FROM} {port} {size}"),
            Response::RemoveComplete => write!(f, "{REMOVE_COMPLETE}"),
            Response::List(names) => {
                write!(f, "{LIST}")?;
                for name in names {
                    write!(f, " {name}")?;
                }
                Ok(())
            }
            Response::FileAlreadyExists => write!(f, "{ERROR_FILE_ALREADY_EXISTS}"),
            Response::FileDoesNotExist => write!(f, "{ERROR_FILE_DOES_NOT_EXIST}"),
            Response::NotEnoughNodes => write!(f, "{ERROR_NOT_ENOUGH_DSTORES}"),
            Response::LoadFailed => write!(f, "{ERROR_LOAD}"),
        }
    }
}

/// A directive the controller sends down a data-node session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    List,
    Remove { name: String },
    Rebalance(RebalancePayload),
}

impl NodeCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [LIST] => Ok(NodeCommand::List),
            [REMOVE, name] => Ok(NodeCommand::Remove {
                name: (*name).to_string(),
            }),
            [REBALANCE, rest @ ..] => Ok(NodeCommand::Rebalance(RebalancePayload::parse(rest)?)),
            _ => bail!("unrecognized node command: {line}"),
        }
    }
}

impl fmt::Display for NodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeCommand::List => write!(f, "{LIST}"),
            NodeCommand::Remove { name } => write!(f, "{REMOVE} {name}"),
            NodeCommand::Rebalance(payload) => write!(f, "{REBALANCE} {payload}"),
        }
    }
}

/// The body of a `REBALANCE` directive: files this node must push to other
/// nodes, and files it must delete locally.
///
/// Encoded as `S f1 c1 p1_1 .. p1_c1 f2 c2 .. D r1 .. rD` where `S` counts
/// the files to send (each followed by its destination-port count and
/// ports) and `D` counts the files to delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalancePayload {
    pub sends: Vec<(String, Vec<u16>)>,
    pub removals: Vec<String>,
}

impl RebalancePayload {
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.removals.is_empty()
    }

    fn parse(tokens: &[&str]) -> Result<Self> {
        let mut iter = tokens.iter();
        let mut next = |what: &str| {
            iter.next()
                .copied()
                .ok_or_else(|| anyhow!("rebalance payload truncated before {what}"))
        };

        let send_count: usize = next("send count")?
            .parse()
            .map_err(|_| anyhow!("bad send count"))?;
        let mut sends = Vec::with_capacity(send_count);
        for _ in 0..send_count {
            let name = next("file name")?.to_string();
            let port_count: usize = next("port count")?
                .parse()
                .map_err(|_| anyhow!("bad port count"))?;
            let mut ports = Vec::with_capacity(port_count);
            for _ in 0..port_count {
                let port = next("destination port")?;
                ports.push(port.parse().map_err(|_| anyhow!("bad port: {port}"))?);
            }
            sends.push((name, ports));
        }

        let removal_count: usize = next("removal count")?
            .parse()
            .map_err(|_| anyhow!("bad removal count"))?;
        let mut removals = Vec::with_capacity(removal_count);
        for _ in 0..removal_count {
            removals.push(next("removal name")?.to_string());
        }

        if iter.next().is_some() {
            bail!("trailing tokens in rebalance payload");
        }
        Ok(RebalancePayload { sends, removals })
    }
}

impl fmt::Display for RebalancePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sends.len())?;
        for (name, ports) in &self.sends {
            write!(f, " {name} {}", ports.len())?;
            for port in ports {
                write!(f, " {port}")?;
            }
        }
        write!(f, " {}", self.removals.len())?;
        for name in &self.removals {
            write!(f, " {name}")?;
        }
        Ok(())
    }
}

/// A message a data node sends up its controller session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeReply {
    List(Vec<String>),
    StoreAck { name: String },
    RemoveAck { name: String },
    FileMissing { name: String },
    RebalanceComplete,
}

impl NodeReply {
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [LIST, names @ ..] => Ok(NodeReply::List(
                names.iter().map(|n| (*n).to_string()).collect(),
            )),
            [STORE_ACK, name] => Ok(NodeReply::StoreAck {
                name: (*name).to_string(),
            }),
            [REMOVE_ACK, name] => Ok(NodeReply::RemoveAck {
                name: (*name).to_string(),
            }),
            [ERROR_FILE_DOES_NOT_EXIST, name] => Ok(NodeReply::FileMissing {
                name: (*name).to_string(),
            }),
            [REBALANCE_COMPLETE] => Ok(NodeReply::RebalanceComplete),
            _ => bail!("unrecognized node reply: {line}"),
        }
    }
}

impl fmt::Display for NodeReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeReply::List(names) => {
                write!(f, "{LIST}")?;
                for name in names {
                    write!(f, " {name}")?;
                }
                Ok(())
            }
            NodeReply::StoreAck { name } => write!(f, "{STORE_ACK} {name}"),
            NodeReply::RemoveAck { name } => write!(f, "{REMOVE_ACK} {name}"),
            NodeReply::FileMissing { name } => write!(f, "{ERROR_FILE_DOES_NOT_EXIST} {name}"),
            NodeReply::RebalanceComplete => write!(f, "{REBALANCE_COMPLETE}"),
        }
    }
}

/// Why a bounded line read produced no line.
#[derive(Debug)]
pub enum LineError {
    /// No complete line arrived before the deadline.
    Timeout,
    /// The peer closed the stream.
    Closed,
    Io(io::Error),
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineError::Timeout => write!(f, "timed out waiting for a line"),
            LineError::Closed => write!(f, "stream closed"),
            LineError::Io(err) => write!(f, "read failed: {err}"),
        }
    }
}

impl std::error::Error for LineError {}

/// Reads the next non-empty line, trimmed of its terminator. `Ok(None)`
/// means the peer closed the stream.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
}

/// Reads the next line with a deadline, distinguishing timeout from close.
pub async fn read_line_within<R>(reader: &mut R, wait: Duration) -> Result<String, LineError>
where
    R: AsyncBufRead + Unpin,
{
    match timeout(wait, read_line(reader)).await {
        Ok(Ok(Some(line))) => Ok(line),
        Ok(Ok(None)) => Err(LineError::Closed),
        Ok(Err(err)) => Err(LineError::Io(err)),
        Err(_) => Err(LineError::Timeout),
    }
}

/// Appends the line terminator and flushes so the peer sees the message
/// immediately.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
