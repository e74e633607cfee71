//! Intake loop moving commands from the transport into the dispatch pipe.

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{queue::Deliveries, worker::Job};

/// Why the intake loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeEnd {
    /// The cancellation signal was observed.
    Cancelled,
    /// The transport stopped delivering without being cancelled.
    SourceClosed,
    /// Every worker is gone, nothing can be dispatched.
    PipeClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeReport {
    /// Commands that entered the dispatch pipe.
    pub admitted: usize,
    pub end: IntakeEnd,
}

/// Forwards deliveries into `pipe` until cancelled or the source ends.
///
/// Cancellation wins while waiting on the transport and is re-checked after
/// each receipt; a command caught there is dropped, never retried. Once a
/// command passes that check the send is awaited to completion, so a command
/// is counted as admitted exactly when it enters the pipe. The workers keep
/// draining the pipe while intake runs, so the send cannot stall shutdown.
pub async fn run_intake(
    deliveries: &mut Deliveries,
    pipe: &flume::Sender<Job>,
    cancel: &CancellationToken,
) -> IntakeReport {
    let mut admitted = 0;

    let end = loop {
        let command = select! {
            biased;
            _ = cancel.cancelled() => break IntakeEnd::Cancelled,
            received = deliveries.recv() => match received {
                Some(command) => command,
                None => break IntakeEnd::SourceClosed,
            },
        };

        if cancel.is_cancelled() {
            debug!(action = %command.action, key = %command.key, "dropping command received during cancellation");
            break IntakeEnd::Cancelled;
        }

        // A flume send parked on a full pipe can be completed by a receiver
        // before this task is polled again, so it must not be raced.
        if pipe.send_async(Job::Apply(command)).await.is_err() {
            break IntakeEnd::PipeClosed;
        }
        admitted += 1;
    };

    match end {
        IntakeEnd::Cancelled => info!(admitted, "intake observed cancellation"),
        IntakeEnd::SourceClosed => warn!(admitted, "transport stopped delivering commands"),
        IntakeEnd::PipeClosed => warn!(admitted, "dispatch pipe closed under intake"),
    }

    IntakeReport { admitted, end }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::command::Command;

    #[tokio::test]
    async fn forwards_until_source_closes() {
        let (tx, mut deliveries) = mpsc::channel(4);
        let (pipe, jobs) = flume::bounded(4);
        let cancel = CancellationToken::new();

        tx.send(Command::add("A", "a")).await.expect("deliver");
        tx.send(Command::get("A")).await.expect("deliver");
        drop(tx);

        let report = run_intake(&mut deliveries, &pipe, &cancel).await;
        assert_eq!(
            report,
            IntakeReport {
                admitted: 2,
                end: IntakeEnd::SourceClosed
            }
        );
        assert_eq!(jobs.len(), 2);
    }

    #[tokio::test]
    async fn admits_nothing_after_cancellation() {
        let (tx, mut deliveries) = mpsc::channel(4);
        let (pipe, jobs) = flume::bounded(4);
        let cancel = CancellationToken::new();

        tx.send(Command::add("A", "a")).await.expect("deliver");
        cancel.cancel();

        let report = run_intake(&mut deliveries, &pipe, &cancel).await;
        assert_eq!(report.end, IntakeEnd::Cancelled);
        assert_eq!(report.admitted, 0);
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn send_parked_on_a_full_pipe_is_counted() {
        let (tx, mut deliveries) = mpsc::channel(4);
        let (pipe, jobs) = flume::bounded(1);
        let cancel = CancellationToken::new();

        tx.send(Command::add("A", "a")).await.expect("deliver");
        tx.send(Command::add("B", "b")).await.expect("deliver");
        tx.send(Command::add("C", "c")).await.expect("deliver");

        let intake = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let pipe = pipe;
                let report = run_intake(&mut deliveries, &pipe, &cancel).await;
                (report, deliveries)
            })
        };

        // A fills the pipe and B parks in the send within the same poll.
        while jobs.is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        // Taking A moves the parked B into the pipe before intake runs again.
        let first = jobs.try_recv().expect("A in the pipe");
        assert!(matches!(first, Job::Apply(ref command) if command.key == "A"));

        let (report, mut deliveries) = intake.await.expect("intake task");
        let mut dispatched = 1;
        while jobs.try_recv().is_ok() {
            dispatched += 1;
        }

        assert_eq!(report.end, IntakeEnd::Cancelled);
        assert_eq!(report.admitted, 2);
        assert_eq!(dispatched, report.admitted);
        let left = deliveries.try_recv().expect("C left with the transport");
        assert_eq!(left.key, "C");
    }

    #[tokio::test]
    async fn reports_closed_pipe() {
        let (tx, mut deliveries) = mpsc::channel(4);
        let (pipe, jobs) = flume::bounded(4);
        drop(jobs);

        tx.send(Command::add("A", "a")).await.expect("deliver");
        let report = run_intake(&mut deliveries, &pipe, &CancellationToken::new()).await;
        assert_eq!(report.end, IntakeEnd::PipeClosed);
        assert_eq!(report.admitted, 0);
    }
}
