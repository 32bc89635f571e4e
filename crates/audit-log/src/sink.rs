use std::path::Path;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::entry::AuditEntry;
use crate::writer::{AuditWriteError, AuditWriter};

const CHANNEL_BUFFER: usize = 1024;

/// Flush after this long without new entries.
const FLUSH_INTERVAL_SECS: u64 = 1;

/// Cloneable handle for submitting [`AuditEntry`] values to the background
/// writer. A sink built with [`AuditSink::disabled`] accepts and discards
/// everything.
#[derive(Clone)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditEntry>>,
}

impl AuditSink {
    /// Open the audit file and spawn the writer task.
    ///
    /// The task drains entries until the last sink clone is dropped, flushing
    /// whenever the channel has been idle for a second and once more on exit.
    /// I/O errors are logged and the offending entry is skipped.
    pub async fn start(
        path: impl AsRef<Path>,
    ) -> Result<(Self, JoinHandle<()>), AuditWriteError> {
        let (tx, rx) = mpsc::channel::<AuditEntry>(CHANNEL_BUFFER);
        let writer = AuditWriter::new(path).await?;

        let handle = tokio::spawn(run_writer_loop(writer, rx));

        Ok((Self { tx: Some(tx) }, handle))
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an entry, waiting for channel capacity if needed.
    pub async fn log(&self, entry: AuditEntry) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.send(entry).await {
            tracing::warn!(
                event_type = ?err.0.event_type,
                "audit writer gone, entry dropped"
            );
        }
    }
}

async fn run_writer_loop(mut writer: AuditWriter, mut rx: mpsc::Receiver<AuditEntry>) {
    let flush_interval = tokio::time::Duration::from_secs(FLUSH_INTERVAL_SECS);
    let mut dirty = false;

    loop {
        match tokio::time::timeout(flush_interval, rx.recv()).await {
            Ok(Some(entry)) => {
                if let Err(err) = writer.write(&entry).await {
                    tracing::error!(%err, "failed to write audit entry");
                } else {
                    dirty = true;
                }
            }
            Ok(None) => {
                if dirty {
                    if let Err(err) = writer.flush().await {
                        tracing::error!(%err, "failed to flush audit log on shutdown");
                    }
                }
                tracing::debug!(
                    entries = writer.entries_written(),
                    "audit writer shutting down"
                );
                return;
            }
            Err(_) => {
                if dirty {
                    match writer.flush().await {
                        Ok(()) => dirty = false,
                        Err(err) => tracing::error!(%err, "periodic audit flush failed"),
                    }
                }
            }
        }
    }
}
