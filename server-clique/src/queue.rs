//! Message transport used to feed commands into the server.
//!
//! [`Queue`] is the seam between the command-processing core and whatever
//! carries commands to it. Two transports ship with the crate:
//!
//! - [`MemoryQueue`] keeps everything in-process and backs the tests.
//! - [`TcpQueue`] talks to a [`Broker`](crate::broker::Broker) over the JSON
//!   line protocol in [`message`](crate::message).

use std::{future::Future, net::SocketAddr};

use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    command::Command,
    error::QueueError,
    message::{BrokerToClient, ClientToBroker, read_message, write_message},
};

/// Stream of commands handed to the intake loop. It ends once the
/// cancellation token fires or the transport loses its source.
pub type Deliveries = mpsc::Receiver<Command>;

pub trait Queue: Send + Sync + 'static {
    /// Sends one command to the queue.
    fn publish(&self, command: &Command) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Starts consuming. No command is forwarded after `cancel` has fired.
    fn consume(
        &self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Deliveries, QueueError>> + Send;

    /// Releases the transport. Active consumers see their stream end.
    fn close(&self) -> impl Future<Output = Result<(), QueueError>> + Send;
}

/// In-process work queue.
///
/// Every consumer competes for the same commands, so each published command
/// is delivered at most once. After [`close`](Queue::close) consumers still
/// receive what was already queued before their stream ends.
#[derive(Clone)]
pub struct MemoryQueue {
    tx: flume::Sender<Command>,
    rx: flume::Receiver<Command>,
    closed: CancellationToken,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            closed: CancellationToken::new(),
        }
    }

    /// Number of commands waiting to be consumed.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Queue for MemoryQueue {
    async fn publish(&self, command: &Command) -> Result<(), QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }
        self.tx
            .send_async(command.clone())
            .await
            .map_err(|_| QueueError::Closed)
    }

    async fn consume(&self, cancel: CancellationToken) -> Result<Deliveries, QueueError> {
        let (out, deliveries) = mpsc::channel(1);
        tokio::spawn(pump_memory(
            self.rx.clone(),
            out,
            cancel,
            self.closed.clone(),
        ));
        Ok(deliveries)
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.cancel();
        Ok(())
    }
}

async fn pump_memory(
    source: flume::Receiver<Command>,
    out: mpsc::Sender<Command>,
    cancel: CancellationToken,
    closed: CancellationToken,
) {
    loop {
        let command = select! {
            biased;
            _ = cancel.cancelled() => return,
            received = source.recv_async() => match received {
                Ok(command) => command,
                Err(_) => return,
            },
            _ = closed.cancelled() => return,
        };
        if !forward(&out, command, &cancel).await {
            return;
        }
    }
}

/// Hands one decoded command to the consumer unless cancellation won first.
async fn forward(out: &mpsc::Sender<Command>, command: Command, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        debug!(action = %command.action, key = %command.key, "dropping delivery after cancellation");
        return false;
    }
    select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = out.send(command) => sent.is_ok(),
    }
}

/// Queue client for a [`Broker`](crate::broker::Broker).
///
/// The publishing connection is opened and the queue declared by
/// [`connect`](TcpQueue::connect); each call to `consume` opens a dedicated
/// consumer connection.
pub struct TcpQueue {
    addr: SocketAddr,
    queue: String,
    publisher: Mutex<Option<Connection>>,
    closed: CancellationToken,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: SocketAddr, queue: &str) -> Result<Self, QueueError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| QueueError::Connect { addr, source })?;
        let (reader, writer) = stream.into_split();
        let mut connection = Self {
            reader: BufReader::new(reader),
            writer,
        };

        connection
            .send(&ClientToBroker::Declare {
                queue: queue.to_string(),
            })
            .await?;
        match read_message::<_, BrokerToClient>(&mut connection.reader).await? {
            Some(BrokerToClient::Declared { .. }) => Ok(connection),
            Some(BrokerToClient::Error { message }) => Err(QueueError::Rejected(message)),
            Some(other) => Err(QueueError::Rejected(format!(
                "unexpected reply to declare: {other:?}"
            ))),
            None => Err(QueueError::Disconnected),
        }
    }

    async fn send(&mut self, message: &ClientToBroker) -> Result<(), QueueError> {
        write_message(&mut self.writer, message).await?;
        Ok(())
    }
}

impl TcpQueue {
    /// Connects to the broker at `addr` and declares `queue`.
    pub async fn connect(addr: SocketAddr, queue: impl Into<String>) -> Result<Self, QueueError> {
        let queue = queue.into();
        let publisher = Connection::open(addr, &queue).await?;
        info!(%addr, queue = %queue, "connected to broker");
        Ok(Self {
            addr,
            queue,
            publisher: Mutex::new(Some(publisher)),
            closed: CancellationToken::new(),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }
}

impl Queue for TcpQueue {
    async fn publish(&self, command: &Command) -> Result<(), QueueError> {
        let mut publisher = self.publisher.lock().await;
        let connection = publisher.as_mut().ok_or(QueueError::Closed)?;
        connection
            .send(&ClientToBroker::Publish {
                queue: self.queue.clone(),
                command: command.clone(),
            })
            .await
    }

    async fn consume(&self, cancel: CancellationToken) -> Result<Deliveries, QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }
        let mut connection = Connection::open(self.addr, &self.queue).await?;
        connection
            .send(&ClientToBroker::Consume {
                queue: self.queue.clone(),
            })
            .await?;

        let (out, deliveries) = mpsc::channel(1);
        tokio::spawn(pump_tcp(connection, out, cancel, self.closed.clone()));
        Ok(deliveries)
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.cancel();
        if let Some(mut connection) = self.publisher.lock().await.take() {
            connection.writer.shutdown().await?;
        }
        Ok(())
    }
}

async fn pump_tcp(
    mut connection: Connection,
    out: mpsc::Sender<Command>,
    cancel: CancellationToken,
    closed: CancellationToken,
) {
    loop {
        let message = select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = closed.cancelled() => break,
            message = read_message::<_, BrokerToClient>(&mut connection.reader) => message,
        };

        let command = match message {
            Ok(Some(BrokerToClient::Deliver { command })) => command,
            Ok(Some(BrokerToClient::Error { message })) => {
                warn!(%message, "broker reported an error to consumer");
                continue;
            }
            Ok(Some(other)) => {
                debug!(?other, "ignoring unexpected broker message");
                continue;
            }
            Ok(None) => {
                warn!("broker closed the consumer connection");
                break;
            }
            Err(error) if error.kind() == std::io::ErrorKind::InvalidData => {
                warn!(?error, "failed to decode delivery");
                continue;
            }
            Err(error) => {
                warn!(?error, "consumer connection failed");
                break;
            }
        };

        if !forward(&out, command, &cancel).await {
            break;
        }
    }

    if let Err(error) = connection.writer.shutdown().await {
        debug!(?error, "failed to shut down consumer connection");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn memory_queue_delivers_in_publish_order() {
        let queue = MemoryQueue::new();
        let cancel = CancellationToken::new();
        let mut deliveries = queue.consume(cancel.clone()).await.expect("consume");

        queue.publish(&Command::add("A", "a")).await.expect("publish");
        queue.publish(&Command::remove("A")).await.expect("publish");

        let first = deliveries.recv().await.expect("first delivery");
        let second = deliveries.recv().await.expect("second delivery");
        assert_eq!(first.key, "A");
        assert_eq!(first.value, "a");
        assert_eq!(second.action, crate::command::Action::Remove);
    }

    #[tokio::test]
    async fn cancelled_consumer_stops_delivering() {
        let queue = MemoryQueue::new();
        let cancel = CancellationToken::new();
        let mut deliveries = queue.consume(cancel.clone()).await.expect("consume");

        cancel.cancel();
        queue.publish(&Command::get("A")).await.expect("publish");

        let end = timeout(Duration::from_secs(1), deliveries.recv())
            .await
            .expect("stream should end promptly");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn closing_drains_queued_commands_then_ends_stream() {
        let queue = MemoryQueue::new();
        queue.publish(&Command::add("A", "a")).await.expect("publish");
        queue.publish(&Command::add("B", "b")).await.expect("publish");
        queue.close().await.expect("close");

        assert!(matches!(
            queue.publish(&Command::get("A")).await,
            Err(QueueError::Closed)
        ));

        let mut deliveries = queue
            .consume(CancellationToken::new())
            .await
            .expect("consume after close");
        let mut keys = Vec::new();
        while let Some(command) = timeout(Duration::from_secs(1), deliveries.recv())
            .await
            .expect("stream should end promptly")
        {
            keys.push(command.key);
        }
        assert_eq!(keys, ["A", "B"]);
    }
}
