use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use trellis_core::error::Result;
use trellis_core::event::{EventBus, WorkflowEvent};
use trellis_core::types::{InstanceId, InstanceStatus};
use trellis_store::SqliteStore;

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// (instance, step index) pairs whose waiting step expired.
    pub timed_out_steps: Vec<(InstanceId, usize)>,
    pub timed_out_instances: Vec<InstanceId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out_steps.is_empty() && self.timed_out_instances.is_empty()
    }
}

/// Periodically times out expired waiting steps and instances.
pub struct TimeoutSweeper {
    store: Arc<SqliteStore>,
    event_bus: Arc<EventBus>,
    interval: Duration,
}

impl TimeoutSweeper {
    pub fn new(store: Arc<SqliteStore>, event_bus: Arc<EventBus>, interval_secs: u64) -> Self {
        Self {
            store,
            event_bus,
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    /// One pass. Safe to repeat: a second pass over the same data is a no-op.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let (steps, instances) = self.store.sweep_expired(now)?;

        for step in &steps {
            self.event_bus.publish(WorkflowEvent::StepTimedOut {
                instance_id: step.instance_id.clone(),
                step_index: step.step_index,
            });
        }
        for inst in &instances {
            self.event_bus.publish(WorkflowEvent::InstanceStatusChanged {
                instance_id: inst.instance_id.clone(),
                from: inst.from,
                to: InstanceStatus::TimedOut,
                reason: Some(inst.reason.clone()),
            });
        }

        let report = SweepReport {
            timed_out_steps: steps
                .into_iter()
                .map(|s| (s.instance_id, s.step_index))
                .collect(),
            timed_out_instances: instances.into_iter().map(|i| i.instance_id).collect(),
        };
        if !report.is_empty() {
            info!(
                steps = report.timed_out_steps.len(),
                instances = report.timed_out_instances.len(),
                "Sweeper timed out expired work"
            );
        }
        Ok(report)
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Timeout sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()) {
                        error!(error = %e, "Sweep failed");
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("Timeout sweeper shutting down");
                    break;
                }
            }
        }
    }
}
