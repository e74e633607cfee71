//! Command-processing server fed by a message queue.
//!
//! Commands (`add`, `remove`, `get`, `getall`) arrive from a queue transport
//! and are applied, each exactly once, to one shared in-memory table by a
//! pool of workers. Every outcome is appended as a line to a result file.
//!
//! - [`table`] is the shared key/value table with a slot index.
//! - [`command`] defines commands, actions and table entries.
//! - [`intake`] moves commands from the transport into the dispatch pipe.
//! - [`worker`] applies dispatched commands and emits result records.
//! - [`server`] coordinates cancellation, draining and resource release.
//! - [`sink`] formats result records and appends them to the output.
//! - [`queue`] is the transport seam, with in-memory and TCP transports.
//! - [`broker`] is a local TCP broker holding named work queues.
//! - [`message`] is the broker's JSON line protocol.
//! - [`producer`] publishes a batch of commands from a file.
//! - [`fileserver`] serves the output directory over HTTP.
//! - [`cli`] parses the command line and environment.

pub mod broker;
pub mod cli;
pub mod command;
pub mod error;
pub mod fileserver;
pub mod intake;
pub mod message;
pub mod producer;
pub mod queue;
pub mod server;
pub mod sink;
pub mod table;
pub mod worker;
