//! Shutdown coordinator wiring the intake loop, dispatch pipe and workers.
//!
//! A run moves through four phases:
//!
//! 1. **Running**: intake and workers are active.
//! 2. **Cancelling**: the cancellation signal was observed by the intake loop.
//! 3. **Draining**: intake has returned and the pipe is closed; workers keep
//!    applying whatever is still queued.
//! 4. **Closed**: every worker has exited; the result sink and then the
//!    transport are released.
//!
//! Cancellation never interrupts a worker mid-command, so every command that
//! entered the pipe is applied before the run ends.

use std::sync::Arc;

use tokio::{io::AsyncWrite, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::ServerError,
    intake::{IntakeEnd, run_intake},
    queue::Queue,
    sink::ResultSink,
    table::{CommandTable, ListOrder},
    worker::{Job, WorkerPool},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Cancelling,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Number of workers in the pool.
    pub workers: usize,
    /// Capacity of the dispatch pipe.
    pub pipe_capacity: usize,
    pub list_order: ListOrder,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            pipe_capacity: 5,
            list_order: ListOrder::Slot,
        }
    }
}

/// Counts from a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Commands that entered the dispatch pipe.
    pub admitted: usize,
    /// Result records emitted by the workers.
    pub applied: usize,
}

pub struct Server<Q, W> {
    queue: Q,
    sink: ResultSink<W>,
    table: Arc<CommandTable>,
    config: ServerConfig,
    phase: watch::Sender<Phase>,
}

impl<Q, W> Server<Q, W>
where
    Q: Queue,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(queue: Q, sink: ResultSink<W>, config: ServerConfig) -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        Self {
            queue,
            sink,
            table: Arc::new(CommandTable::with_order(config.list_order)),
            config,
            phase,
        }
    }

    /// The table the workers apply commands to.
    pub fn table(&self) -> Arc<CommandTable> {
        Arc::clone(&self.table)
    }

    /// Subscribes to phase transitions.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Processes commands until `cancel` fires or the transport gives out,
    /// then drains the workers and releases the sink and transport.
    ///
    /// Returns [`ServerError::TransportClosed`] when the transport stopped on
    /// its own; the queued commands are still applied before that happens.
    pub async fn run(self, cancel: CancellationToken) -> Result<ShutdownReport, ServerError> {
        let Server {
            queue,
            sink,
            table,
            config,
            phase,
        } = self;
        let workers = config.workers.max(1);

        let mut deliveries = queue.consume(cancel.clone()).await?;
        let (pipe, jobs) = flume::bounded(config.pipe_capacity.max(1));
        let pool = WorkerPool::spawn(workers, jobs, table, sink.clone());
        info!(
            workers,
            pipe_capacity = config.pipe_capacity,
            list_order = ?config.list_order,
            "server running"
        );

        let intake = run_intake(&mut deliveries, &pipe, &cancel).await;
        drop(deliveries);

        match intake.end {
            IntakeEnd::Cancelled => {
                phase.send_replace(Phase::Cancelling);
            }
            IntakeEnd::SourceClosed => {
                // Queued commands sit ahead of the halts, so all of them are
                // still applied before the last worker leaves.
                for _ in 0..pool.size() {
                    if pipe.send_async(Job::Halt).await.is_err() {
                        break;
                    }
                }
            }
            IntakeEnd::PipeClosed => {}
        }

        phase.send_replace(Phase::Draining);
        drop(pipe);
        info!(admitted = intake.admitted, "draining workers");
        let applied = pool.join().await;

        phase.send_replace(Phase::Closed);
        release(&queue, &sink).await;
        info!(admitted = intake.admitted, applied, "server closed");

        match intake.end {
            IntakeEnd::SourceClosed => Err(ServerError::TransportClosed),
            IntakeEnd::Cancelled | IntakeEnd::PipeClosed => Ok(ShutdownReport {
                admitted: intake.admitted,
                applied,
            }),
        }
    }
}

/// Closes the result sink, then the transport. Failures are logged, not
/// returned, since nothing is left to hand them to.
pub async fn release<Q, W>(queue: &Q, sink: &ResultSink<W>)
where
    Q: Queue,
    W: AsyncWrite + Unpin + Send,
{
    if let Err(error) = sink.close().await {
        warn!(?error, "failed to close result sink");
    }
    if let Err(error) = queue.close().await {
        warn!(?error, "failed to close transport");
    }
}
