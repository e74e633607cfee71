//! Producer side: publishes a batch of commands read from a JSON file.

use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::{command::Command, queue::Queue};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub published: usize,
    pub failed: usize,
    /// Set when cancellation stopped the batch early.
    pub aborted: bool,
}

/// Reads a JSON array of wire commands.
pub async fn load_commands(path: impl AsRef<Path>) -> Result<Vec<Command>> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}

/// Publishes `commands` in order. A failed publish is logged and skipped;
/// cancellation is checked before every publish.
pub async fn publish_all<Q: Queue>(
    queue: &Q,
    commands: &[Command],
    cancel: &CancellationToken,
) -> PublishSummary {
    let mut summary = PublishSummary::default();
    for command in commands {
        if cancel.is_cancelled() {
            warn!(published = summary.published, "cancelled, publishing aborted");
            summary.aborted = true;
            break;
        }
        match queue.publish(command).await {
            Ok(()) => summary.published += 1,
            Err(err) => {
                error!(action = %command.action, key = %command.key, error = ?err, "failed to publish command");
                summary.failed += 1;
            }
        }
    }
    summary
}
