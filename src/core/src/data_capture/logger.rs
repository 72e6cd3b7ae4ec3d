//! File logger task.
//!
//! A [`Logger`] owns exactly one file and consumes byte blobs from a bounded
//! queue of capacity one, so a producer blocks until the previous blob has
//! been taken. Every blob is appended and synced before the next one is
//! received. A zero-length blob is the termination sentinel: the file is
//! closed and the task ends. Nothing is ever written after it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{debug, error, trace};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error_handling::types::CaptureError;

use super::types::LogRole;

/// Producer side of a [`Logger`] queue. Cheap to clone; the text logger is
/// shared by both forwarders of a session.
#[derive(Debug, Clone)]
pub struct LogSender {
    path: PathBuf,
    tx: mpsc::Sender<Vec<u8>>,
}

impl LogSender {
    /// Enqueues one blob, waiting until the logger has consumed the previous one.
    ///
    /// Empty blobs are dropped here: the empty blob is reserved for [`close`].
    ///
    /// [`close`]: LogSender::close
    pub async fn send(&self, blob: impl Into<Vec<u8>>) -> Result<(), CaptureError> {
        let blob = blob.into();
        if blob.is_empty() {
            trace!("ignoring empty blob for {}", self.path.display());
            return Ok(());
        }
        self.tx
            .send(blob)
            .await
            .map_err(|_| CaptureError::LoggerClosed(self.path.clone()))
    }

    /// Sends the termination sentinel. Does not wait for the file to be closed.
    pub async fn close(&self) -> Result<(), CaptureError> {
        self.tx
            .send(Vec::new())
            .await
            .map_err(|_| CaptureError::LoggerClosed(self.path.clone()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What a logger did over its lifetime, returned when its task ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSummary {
    pub path: PathBuf,
    pub blobs: u64,
    pub bytes: u64,
}

pub struct Logger {
    conn_id: u64,
    path: PathBuf,
    file: File,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Logger {
    /// Creates the log file for `role` inside `dir`, named after the current
    /// local time and `conn_id`, and returns the logger with its producer handle.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::LogFileCreation`] if the file cannot be created.
    pub async fn create(
        dir: &Path,
        role: &LogRole,
        conn_id: u64,
    ) -> Result<(Self, LogSender), CaptureError> {
        let created: DateTime<Local> = Local::now();
        let path = role.path_in(dir, &created, conn_id);
        Self::create_at(path, conn_id).await
    }

    /// Same as [`Logger::create`] with an explicit file path.
    pub async fn create_at(
        path: PathBuf,
        conn_id: u64,
    ) -> Result<(Self, LogSender), CaptureError> {
        let file = File::create(&path)
            .await
            .map_err(|source| CaptureError::LogFileCreation {
                path: path.clone(),
                source,
            })?;
        debug!("[{:04}] created log file {}", conn_id, path.display());

        let (tx, rx) = mpsc::channel(1);
        let sender = LogSender {
            path: path.clone(),
            tx,
        };
        Ok((
            Self {
                conn_id,
                path,
                file,
                rx,
            },
            sender,
        ))
    }

    pub fn spawn(self) -> JoinHandle<LogSummary> {
        tokio::spawn(self.run())
    }

    /// Consumes blobs until the sentinel arrives or every producer is gone.
    ///
    /// A failed write is reported and the blob skipped; the logger keeps
    /// draining its queue so forwarding is never stalled by a broken file.
    pub async fn run(mut self) -> LogSummary {
        let mut summary = LogSummary {
            path: self.path.clone(),
            blobs: 0,
            bytes: 0,
        };

        while let Some(blob) = self.rx.recv().await {
            if blob.is_empty() {
                trace!("[{:04}] sentinel for {}", self.conn_id, self.path.display());
                break;
            }
            match self.append(&blob).await {
                Ok(()) => {
                    summary.blobs += 1;
                    summary.bytes += blob.len() as u64;
                }
                Err(e) => error!(
                    "[{:04}] writing {} bytes to {} failed: {}",
                    self.conn_id,
                    blob.len(),
                    self.path.display(),
                    e
                ),
            }
        }

        self.rx.close();
        if let Err(e) = self.file.shutdown().await {
            error!("[{:04}] closing {} failed: {}", self.conn_id, self.path.display(), e);
        }
        debug!(
            "[{:04}] closed {} after {} blobs, {} bytes",
            self.conn_id,
            self.path.display(),
            summary.blobs,
            summary.bytes
        );
        summary
    }

    async fn append(&mut self, blob: &[u8]) -> Result<(), CaptureError> {
        self.file
            .write_all(blob)
            .await
            .map_err(CaptureError::LogWrite)?;
        self.file.sync_all().await.map_err(CaptureError::LogWrite)
    }
}
