use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use trellis_core::config::EngineConfig;
use trellis_store::SqliteStore;

use crate::executor::Executor;

/// Polls for runnable instances and drives them, at most `workers` at a
/// time. Also resumes timer waits whose time has come.
pub struct WorkerPool {
    executor: Arc<Executor>,
    store: Arc<SqliteStore>,
    permits: Arc<Semaphore>,
    workers: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(executor: Arc<Executor>, store: Arc<SqliteStore>, config: &EngineConfig) -> Self {
        let workers = config.workers.max(1);
        Self {
            executor,
            store,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
        }
    }

    /// One polling round. Returns how many drives were started.
    pub fn poll_once(&self) -> usize {
        let now = Utc::now();
        match self.executor.wake_due(now) {
            Ok(woken) if !woken.is_empty() => debug!(count = woken.len(), "Woke timed waits"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to wake due waits"),
        }

        let runnable = match self.store.runnable_instances(now, self.workers * 2) {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Failed to list runnable instances");
                return 0;
            }
        };

        let mut started = 0;
        for id in runnable {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let executor = self.executor.clone();
            started += 1;
            tokio::spawn(async move {
                let _permit = permit;
                match executor.drive(&id).await {
                    Ok(status) => debug!(instance_id = %id, status = %status, "Drive finished"),
                    Err(e) => warn!(instance_id = %id, error = %e, "Drive failed"),
                }
            });
        }
        started
    }

    /// Poll until cancelled, then wait for in-flight drives to finish.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            workers = self.workers,
            poll_ms = self.poll_interval.as_millis() as u64,
            "Worker pool started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once();
                }
                _ = cancel.cancelled() => break,
            }
        }

        debug!("Worker pool draining");
        if let Ok(all) = self.permits.acquire_many(self.workers as u32).await {
            drop(all);
        }
        info!("Worker pool stopped");
    }
}
