//! Replicated file store that runs a coordinating controller, a dynamic set
//! of data nodes, and a one-shot command-line client.
//!
//! Clients talk to the controller over a line-oriented TCP protocol to
//! `STORE`, `LOAD`, `REMOVE`, and `LIST` named opaque files. The controller
//! picks data nodes to hold R replicas of each file, orchestrates direct
//! client-to-node transfers, and periodically rebalances replica placement.
//! Each module covers one responsibility:
//!
//! - [`cli`] parses the command-line interface for the three roles.
//! - [`protocol`] defines every wire message plus the line codec.
//! - [`index`] is the per-file state machine behind the controller.
//! - [`registry`] tracks live data nodes and demultiplexes their inbound
//!   traffic.
//! - [`gate`] serializes client operations against the background rebalance.
//! - [`balance`] computes replica moves and deletions for a rebalance pass.
//! - [`controller`] accepts connections and coordinates every operation.
//! - [`datanode`] serves one file folder and executes controller directives.
//! - [`client`] drives a single store/load/remove/list flow end to end.
//!
//! Integration tests use this crate directly to exercise the controller
//! against scripted data nodes, plus a process-level test over the real
//! binaries.

pub mod balance;
pub mod cli;
pub mod client;
pub mod controller;
pub mod datanode;
pub mod gate;
pub mod index;
pub mod protocol;
pub mod registry;
