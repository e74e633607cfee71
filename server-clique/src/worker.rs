//! Worker pool applying dispatched commands to the shared table.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::{io::AsyncWrite, task::JoinHandle};
use tracing::{debug, error, warn};

use crate::{
    command::{Action, Command},
    sink::{Outcome, ResultRecord, ResultSink},
    table::CommandTable,
};

/// An item travelling through the dispatch pipe.
#[derive(Debug)]
pub enum Job {
    Apply(Command),
    /// Tells the worker that receives it to exit at once.
    Halt,
}

/// Applies `command` to `table` and describes what happened.
pub fn apply(table: &CommandTable, worker_id: usize, command: Command) -> ResultRecord {
    let Command {
        action,
        key,
        value,
        timestamp,
    } = command;

    let outcome = match &action {
        Action::Add => {
            table.add(key.clone(), value.clone(), timestamp);
            Outcome::Stored { value }
        }
        Action::Remove => {
            if table.remove(&key) {
                Outcome::Removed
            } else {
                Outcome::NotFound
            }
        }
        Action::Get => match table.get(&key) {
            Some(value) => Outcome::Found { value },
            None => Outcome::NotFound,
        },
        Action::GetAll => Outcome::Listed(table.list_all()),
        Action::Unknown(_) => Outcome::UnknownAction,
    };

    ResultRecord {
        worker_id,
        action,
        key,
        outcome,
    }
}

/// Routes not-found and unknown-action outcomes to the diagnostic log.
fn report(record: &ResultRecord) {
    match record.outcome {
        Outcome::NotFound => error!(
            worker = record.worker_id,
            action = %record.action,
            key = %record.key,
            "key not found"
        ),
        Outcome::UnknownAction => error!(
            worker = record.worker_id,
            action = %record.action,
            "unknown action"
        ),
        _ => debug!(worker = record.worker_id, action = %record.action, key = %record.key, "applied"),
    }
}

/// Runs one worker until the pipe is closed and drained, or a
/// [`Job::Halt`] arrives. Returns the number of commands applied.
pub async fn run_worker<W>(
    worker_id: usize,
    jobs: flume::Receiver<Job>,
    table: Arc<CommandTable>,
    sink: ResultSink<W>,
) -> usize
where
    W: AsyncWrite + Unpin + Send,
{
    let mut applied = 0;
    while let Ok(job) = jobs.recv_async().await {
        let command = match job {
            Job::Apply(command) => command,
            Job::Halt => {
                debug!(worker = worker_id, "halt received");
                break;
            }
        };

        let record = apply(&table, worker_id, command);
        report(&record);
        if let Err(error) = sink.emit(&record).await {
            warn!(worker = worker_id, ?error, "failed to write result record");
        }
        applied += 1;
    }
    debug!(worker = worker_id, applied, "worker exiting");
    applied
}

/// A fixed set of spawned workers sharing one dispatch pipe.
pub struct WorkerPool {
    handles: Vec<JoinHandle<usize>>,
}

impl WorkerPool {
    /// Spawns `size` workers numbered from 1.
    pub fn spawn<W>(
        size: usize,
        jobs: flume::Receiver<Job>,
        table: Arc<CommandTable>,
        sink: ResultSink<W>,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let handles = (1..=size)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    jobs.clone(),
                    Arc::clone(&table),
                    sink.clone(),
                ))
            })
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker to exit and returns the total applied count.
    pub async fn join(self) -> usize {
        join_all(self.handles)
            .await
            .into_iter()
            .map(|result| match result {
                Ok(applied) => applied,
                Err(error) => {
                    error!(?error, "worker task failed");
                    0
                }
            })
            .sum()
    }
}
