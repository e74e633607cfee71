use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;

/// Failures raised by a [`Queue`](crate::queue::Queue) transport.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to connect to broker at {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("broker rejected request: {0}")]
    Rejected(String),
    #[error("broker closed the connection")]
    Disconnected,
    #[error("queue is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Lifecycle failures that reach the process level.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to open result sink {path}")]
    Sink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("transport unavailable")]
    Transport(#[from] QueueError),
    #[error("transport stopped delivering commands without cancellation")]
    TransportClosed,
}
