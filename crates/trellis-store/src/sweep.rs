use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use trellis_core::error::Result;
use trellis_core::types::{InstanceId, InstanceStatus};

use crate::store::{db_err, parse_col, ts, usize_col, SqliteStore};

/// A waiting step moved to `timed_out` by a sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweptStep {
    pub instance_id: InstanceId,
    pub step_index: usize,
    pub step_name: String,
}

/// An instance moved to `timed_out` by a sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweptInstance {
    pub instance_id: InstanceId,
    pub from: InstanceStatus,
    pub reason: String,
}

const WAITING: &str = "('waiting_approval', 'waiting_external', 'waiting')";
const LIVE: &str = "('pending', 'running', 'waiting_approval', 'waiting_external', 'waiting')";

impl SqliteStore {
    /// Time out every expired waiting step and every expired running or
    /// paused instance, in one transaction.
    ///
    /// All updates are guarded by status, so rows resumed concurrently are
    /// skipped and a second sweep over the same data changes nothing.
    pub fn sweep_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(Vec<SweptStep>, Vec<SweptInstance>)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let now_s = ts(&now);

        // Phase 1: expired waiting steps, and the instances paused on them
        let steps: Vec<SweptStep> = {
            let mut stmt = tx
                .prepare(&format!(
                    "UPDATE step_executions
                     SET status = 'timed_out', completed_at = ?1, error = 'step deadline exceeded'
                     WHERE status IN {WAITING} AND deadline IS NOT NULL AND deadline <= ?1
                     RETURNING instance_id, step_index, step_name"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![now_s], |row| {
                    Ok(SweptStep {
                        instance_id: InstanceId(row.get(0)?),
                        step_index: usize_col(row, 1)?,
                        step_name: row.get(2)?,
                    })
                })
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        let mut instances = Vec::new();
        for step in &steps {
            let reason = format!("step '{}' timed out", step.step_name);
            let from: Option<InstanceStatus> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT status FROM instances
                         WHERE id = ?1 AND status IN ('pending', 'running', 'paused')",
                    )
                    .map_err(db_err)?;
                let mut rows = stmt
                    .query_map(params![step.instance_id.0], |row| parse_col(row, 0))
                    .map_err(db_err)?;
                rows.next().transpose().map_err(db_err)?
            };
            let Some(from) = from else { continue };
            let changed = tx
                .execute(
                    "UPDATE instances
                     SET status = 'timed_out', completed_at = ?2, updated_at = ?2,
                         last_error = ?3, failed_step = COALESCE(failed_step, ?4),
                         claimed_by = NULL, claim_expires_at = NULL
                     WHERE id = ?1 AND status IN ('pending', 'running', 'paused')",
                    params![step.instance_id.0, now_s, reason, step.step_index as i64],
                )
                .map_err(db_err)?;
            if changed == 1 {
                instances.push(SweptInstance {
                    instance_id: step.instance_id.clone(),
                    from,
                    reason,
                });
            }
        }

        // Phase 2: instances past their own deadline
        let expired: Vec<(InstanceId, InstanceStatus)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, status FROM instances
                     WHERE status IN ('running', 'paused') AND deadline IS NOT NULL AND deadline <= ?1",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![now_s], |row| {
                    Ok((InstanceId(row.get(0)?), parse_col(row, 1)?))
                })
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        let reason = "instance deadline exceeded".to_string();
        for (id, from) in expired {
            let changed = tx
                .execute(
                    "UPDATE instances
                     SET status = 'timed_out', completed_at = ?2, updated_at = ?2,
                         last_error = ?3, claimed_by = NULL, claim_expires_at = NULL
                     WHERE id = ?1 AND status IN ('running', 'paused')",
                    params![id.0, now_s, reason],
                )
                .map_err(db_err)?;
            if changed == 0 {
                continue;
            }
            // Close the active step whatever it was doing; a driver still
            // inside it finds the instance terminal and writes nothing
            tx.execute(
                &format!(
                    "UPDATE step_executions
                     SET status = 'timed_out', completed_at = ?2, error = ?3
                     WHERE instance_id = ?1 AND status IN {LIVE}"
                ),
                params![id.0, now_s, reason],
            )
            .map_err(db_err)?;
            instances.push(SweptInstance {
                instance_id: id,
                from,
                reason: reason.clone(),
            });
        }

        tx.commit().map_err(db_err)?;
        Ok((steps, instances))
    }
}
