//! Result records and the append-only sink they are written to.

use std::{fmt, io, path::Path, sync::Arc};

use tokio::{
    fs::OpenOptions,
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use crate::{
    command::{Action, TableEntry},
    error::ServerError,
};

/// What happened when a worker applied one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Stored { value: String },
    Removed,
    Found { value: String },
    NotFound,
    Listed(Vec<TableEntry>),
    UnknownAction,
}

/// The outcome description of one processed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub worker_id: usize,
    pub action: Action,
    pub key: String,
    pub outcome: Outcome,
}

impl ResultRecord {
    /// Whether the command found what it was looking for. Adds and lists
    /// always count as found; an unknown action never does.
    pub fn found(&self) -> bool {
        !matches!(self.outcome, Outcome::NotFound | Outcome::UnknownAction)
    }

    pub fn value(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Stored { value } | Outcome::Found { value } => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = &self.action;
        let key = &self.key;
        match &self.outcome {
            Outcome::Stored { value } | Outcome::Found { value } => {
                write!(f, "performed action:{action} key:{key} value:{value}")
            }
            Outcome::Removed => write!(f, "performed action:{action} key:{key}"),
            Outcome::NotFound => write!(f, "performed action:{action} key:{key} found:false"),
            Outcome::Listed(items) => {
                write!(f, "performed action:{action} items:[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "] itemsLength:{}", items.len())
            }
            Outcome::UnknownAction => write!(f, "skipped action:{action} unknown action"),
        }
    }
}

/// Append-only line sink shared by every worker.
///
/// Cloning is cheap; all clones write to the same underlying writer and each
/// record is written as one whole line under the lock.
pub struct ResultSink<W> {
    writer: Arc<Mutex<W>>,
}

impl<W> Clone for ResultSink<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
        }
    }
}

impl ResultSink<tokio::fs::File> {
    /// Opens `path` for appending, creating it when missing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| ServerError::Sink {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::new(file))
    }
}

impl<W> ResultSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Appends the formatted record followed by a newline.
    pub async fn emit(&self, record: &ResultRecord) -> io::Result<()> {
        let line = format!("{record}\n");
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await
    }

    /// Flushes and shuts down the underlying writer.
    pub async fn close(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.flush().await?;
        writer.shutdown().await
    }

    /// Returns the writer once every other clone has been dropped.
    pub fn into_inner(self) -> Option<W> {
        Arc::try_unwrap(self.writer).ok().map(Mutex::into_inner)
    }
}
