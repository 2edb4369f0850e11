use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the coordinating controller.
    Controller(ControllerArgs),
    /// Run a data node serving files out of one folder.
    Datanode(DatanodeArgs),
    /// Issue a single command against a running controller.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// TCP port the controller listens on for clients and data nodes.
    pub cport: u16,

    /// Number of replicas to keep for every stored file.
    pub replication_factor: usize,

    /// Milliseconds allowed for each acknowledgement wait.
    pub timeout_ms: u64,

    /// Seconds between periodic rebalance passes.
    pub rebalance_period_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct DatanodeArgs {
    /// TCP port this data node listens on for file transfers.
    pub port: u16,

    /// Port of the controller to join.
    pub cport: u16,

    /// Milliseconds allowed for each socket read during a transfer.
    pub timeout_ms: u64,

    /// Folder the node stores its files in; emptied at startup.
    pub file_folder: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Port of the controller to contact.
    pub cport: u16,

    /// Milliseconds to wait for each controller or data-node reply.
    #[arg(long, default_value_t = 3000)]
    pub timeout_ms: u64,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ClientCommand {
    /// Store a local file under its file name.
    Store { path: PathBuf },
    /// Fetch a stored file into a local path.
    Load { name: String, output: PathBuf },
    /// Remove a stored file from every replica.
    Remove { name: String },
    /// List every stored file.
    List,
}
