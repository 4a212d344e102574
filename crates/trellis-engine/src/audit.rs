use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use trellis_core::event::{EventBus, WorkflowEvent};

/// JSONL audit trail of every workflow event.
///
/// One file per UTC day under `log_dir`, one JSON object per line, flushed
/// after every entry. Lines already written survive a crash.
pub struct AuditLog {
    log_dir: PathBuf,
}

#[derive(Serialize)]
struct AuditEntry<'a> {
    timestamp: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_id: Option<&'a str>,
    detail: &'a WorkflowEvent,
}

impl AuditLog {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", day.format("%Y-%m-%d")))
    }

    async fn open(path: &Path) -> std::io::Result<BufWriter<File>> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(BufWriter::new(file))
    }

    /// Run as a background task until cancelled or the bus closes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        // Subscribe before any await so no early event is missed
        let mut rx = event_bus.subscribe();
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create audit directory");
            return;
        }

        let mut day = Utc::now().date_naive();
        let mut path = self.path_for(day);
        let mut writer = match Self::open(&path).await {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open audit log");
                return;
            }
        };
        info!(path = %path.display(), "Audit log started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Audit log cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let now = Utc::now();
                            if now.date_naive() != day {
                                writer.flush().await.ok();
                                day = now.date_naive();
                                path = self.path_for(day);
                                writer = match Self::open(&path).await {
                                    Ok(w) => w,
                                    Err(e) => {
                                        error!(error = %e, path = %path.display(), "Failed to rotate audit log");
                                        return;
                                    }
                                };
                            }

                            let entry = AuditEntry {
                                timestamp: now.to_rfc3339(),
                                event_type: event.kind(),
                                instance_id: event.instance_id().map(|id| id.0.as_str()),
                                detail: &event,
                            };
                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write audit entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush audit log");
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "Audit log lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, audit log stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %path.display(), "Audit log finished");
    }
}
