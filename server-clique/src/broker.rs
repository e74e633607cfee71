use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    command::Command,
    message::{BrokerToClient, ClientToBroker, read_message, write_message},
};

type ConnectionId = u64;

/// Local message broker holding named work queues.
///
/// Publishers append commands to a queue; every consumer of that queue
/// competes for them, so each command is delivered to exactly one consumer.
/// Delivery is auto-acknowledged: once written to a consumer socket the
/// command is gone from the broker.
pub struct Broker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(BrokerState::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts queue clients until `shutdown` resolves, then detaches every
    /// consumer. Undelivered commands are logged per queue and dropped with
    /// the broker.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(client) => client,
                    Err(err) => {
                        warn!(error = ?err, "failed to accept queue client");
                        continue;
                    }
                },
            };

            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let id = state.next_id();
                debug!(id, %peer, "queue client connected");
                if let Err(err) = serve_client(stream, &state).await {
                    warn!(id, %peer, error = ?err, "queue client failed");
                }
            });
        }

        state.shutdown.cancel();
        for (queue, pending) in state.backlog().await {
            if pending > 0 {
                warn!(%queue, pending, "broker stopping with undelivered commands");
            }
        }
        info!("broker stopped");
        Ok(())
    }
}

#[derive(Clone)]
struct WorkQueue {
    tx: flume::Sender<Command>,
    rx: flume::Receiver<Command>,
}

struct BrokerState {
    queues: Mutex<HashMap<String, WorkQueue>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates `name` unless it already exists. Declaring is idempotent.
    async fn declare(&self, name: &str) {
        let mut queues = self.queues.lock().await;
        queues.entry(name.to_string()).or_insert_with(|| {
            info!(queue = name, "queue declared");
            let (tx, rx) = flume::unbounded();
            WorkQueue { tx, rx }
        });
    }

    /// Commands still waiting in each declared queue.
    async fn backlog(&self) -> Vec<(String, usize)> {
        let queues = self.queues.lock().await;
        queues
            .iter()
            .map(|(name, work)| (name.clone(), work.rx.len()))
            .collect()
    }

    async fn lookup(&self, name: &str) -> Result<WorkQueue, QueueLookupError> {
        let queues = self.queues.lock().await;
        queues
            .get(name)
            .cloned()
            .ok_or(QueueLookupError::NotDeclared)
    }
}

#[derive(Debug)]
enum QueueLookupError {
    NotDeclared,
}

async fn serve_client(stream: TcpStream, state: &BrokerState) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;

    while let Some(request) = read_message::<_, ClientToBroker>(&mut reader).await? {
        match request {
            ClientToBroker::Declare { queue } => {
                state.declare(&queue).await;
                write_message(&mut writer, &BrokerToClient::Declared { queue }).await?;
            }
            ClientToBroker::Publish { queue, command } => {
                handle_publish(state, &mut writer, &queue, command).await?;
            }
            ClientToBroker::Consume { queue } => {
                let work = match state.lookup(&queue).await {
                    Ok(work) => work,
                    Err(QueueLookupError::NotDeclared) => {
                        reject_undeclared(&mut writer, &queue).await?;
                        continue;
                    }
                };
                info!(?peer, %queue, "consumer attached");
                run_consumer(state, &work, &mut reader, &mut writer).await?;
                info!(?peer, %queue, "consumer detached");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_publish<W>(
    state: &BrokerState,
    writer: &mut W,
    queue: &str,
    command: Command,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match state.lookup(queue).await {
        Ok(work) => {
            // The broker holds both ends, so the channel cannot be disconnected.
            let _ = work.tx.send_async(command).await;
            Ok(())
        }
        Err(QueueLookupError::NotDeclared) => reject_undeclared(writer, queue).await,
    }
}

async fn reject_undeclared<W>(writer: &mut W, queue: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(
        writer,
        &BrokerToClient::Error {
            message: format!("queue '{queue}' is not declared"),
        },
    )
    .await?;
    Ok(())
}

/// Streams deliveries to one consumer until it disconnects or the broker
/// shuts down. A command that cannot be written goes back on the queue.
async fn run_consumer<R, W>(
    state: &BrokerState,
    work: &WorkQueue,
    reader: &mut R,
    writer: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        select! {
            _ = state.shutdown.cancelled() => break,
            client_message = read_message::<_, ClientToBroker>(reader) => {
                match client_message {
                    Ok(None) => break,
                    Ok(Some(other)) => debug!(?other, "ignoring request on consumer connection"),
                    Err(err) => {
                        debug!(?err, "consumer connection failed");
                        break;
                    }
                }
            }
            received = work.rx.recv_async() => {
                let Ok(command) = received else { break };
                let delivery = BrokerToClient::Deliver { command };
                if let Err(err) = write_message(writer, &delivery).await {
                    debug!(?err, "failed to deliver command, requeueing");
                    if let BrokerToClient::Deliver { command } = delivery {
                        let _ = work.tx.send_async(command).await;
                    }
                    break;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn declare_is_idempotent() {
        let state = BrokerState::new();
        state.declare("clique").await;
        let first = state.lookup("clique").await.expect("declared queue");
        first.tx.send_async(Command::add("A", "a")).await.expect("enqueue");

        state.declare("clique").await;
        let second = state.lookup("clique").await.expect("declared queue");
        assert_eq!(second.rx.len(), 1);
        assert_eq!(state.backlog().await, [("clique".to_string(), 1)]);
    }

    #[tokio::test]
    async fn lookup_rejects_undeclared_queue() {
        let state = BrokerState::new();
        assert!(matches!(
            state.lookup("missing").await,
            Err(QueueLookupError::NotDeclared)
        ));
    }

    #[tokio::test]
    async fn competing_consumers_share_one_queue() {
        let state = BrokerState::new();
        state.declare("clique").await;
        let work = state.lookup("clique").await.expect("declared queue");
        let other = state.lookup("clique").await.expect("declared queue");

        work.tx.send_async(Command::add("A", "a")).await.expect("enqueue");
        work.tx.send_async(Command::add("B", "b")).await.expect("enqueue");

        let first = work.rx.recv_async().await.expect("first");
        let second = other.rx.recv_async().await.expect("second");
        assert_eq!(first.key, "A");
        assert_eq!(second.key, "B");
        assert!(work.rx.is_empty());
    }
}
