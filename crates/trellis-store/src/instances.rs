use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use tracing::debug;

use trellis_core::error::Result;
use trellis_core::types::{
    InstanceId, InstanceStatus, StepExecution, StepStatus, TemplateId, WorkflowInstance,
};

use crate::store::{
    db_err, json_col, opt_json, opt_json_col, opt_ts, opt_ts_col, parse_col, status_list, to_json,
    ts, ts_col, usize_col, SqliteStore,
};

pub(crate) const INSTANCE_COLUMNS: &str = "id, template_id, template_version, tenant, status, \
     step_index, trigger_payload, context, initiator, created_at, updated_at, started_at, \
     completed_at, deadline, last_error, failed_step, cancel_requested";

pub(crate) const STEP_COLUMNS: &str = "instance_id, step_index, step_name, config_snapshot, \
     status, attempt, input, output, error, wake_condition, decided_by, decision, decision_reason, \
     agent_reasoning, external_request, external_response, callback_token_hash, \
     callback_consumed_at, wake_at, deadline, created_at, started_at, completed_at";

pub(crate) fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<WorkflowInstance> {
    let id: String = row.get(0)?;
    let template_id: String = row.get(1)?;
    let version: i64 = row.get(2)?;
    let failed_step: Option<i64> = row.get(15)?;
    Ok(WorkflowInstance {
        id: InstanceId(id),
        template_id: TemplateId(template_id),
        template_version: version as u32,
        tenant: row.get(3)?,
        status: parse_col(row, 4)?,
        step_index: usize_col(row, 5)?,
        trigger_payload: json_col(row, 6)?,
        context: json_col(row, 7)?,
        initiator: json_col(row, 8)?,
        created_at: ts_col(row, 9)?,
        updated_at: ts_col(row, 10)?,
        started_at: opt_ts_col(row, 11)?,
        completed_at: opt_ts_col(row, 12)?,
        deadline: opt_ts_col(row, 13)?,
        last_error: row.get(14)?,
        failed_step: failed_step.map(|i| i as usize),
        cancel_requested: row.get(16)?,
    })
}

pub(crate) fn row_to_step(row: &Row<'_>) -> rusqlite::Result<StepExecution> {
    let instance_id: String = row.get(0)?;
    let config_snapshot: trellis_core::types::StepDefinition = json_col(row, 3)?;
    let attempt: i64 = row.get(5)?;
    let decision: Option<String> = row.get(11)?;
    Ok(StepExecution {
        instance_id: InstanceId(instance_id),
        step_index: usize_col(row, 1)?,
        step_name: row.get(2)?,
        step_type: config_snapshot.step_type(),
        config_snapshot,
        status: parse_col(row, 4)?,
        attempt: attempt as u32,
        input: json_col(row, 6)?,
        output: opt_json_col(row, 7)?,
        error: row.get(8)?,
        wake_condition: opt_json_col(row, 9)?,
        decided_by: row.get(10)?,
        decision: decision.and_then(|d| d.parse().ok()),
        decision_reason: row.get(12)?,
        agent_reasoning: row.get(13)?,
        external_request: opt_json_col(row, 14)?,
        external_response: opt_json_col(row, 15)?,
        callback_token_hash: row.get(16)?,
        callback_consumed_at: opt_ts_col(row, 17)?,
        wake_at: opt_ts_col(row, 18)?,
        deadline: opt_ts_col(row, 19)?,
        created_at: ts_col(row, 20)?,
        started_at: opt_ts_col(row, 21)?,
        completed_at: opt_ts_col(row, 22)?,
    })
}

/// Filter for instance listings.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub tenant: Option<String>,
    pub template_id: Option<TemplateId>,
    pub status: Option<InstanceStatus>,
    pub limit: Option<usize>,
}

/// A guarded, atomic write of an instance and (optionally) one of its steps.
///
/// Applied in a single transaction: if either guard fails nothing is
/// written.
pub struct Transition<'a> {
    pub instance: &'a WorkflowInstance,
    pub instance_from: &'a [InstanceStatus],
    pub step: Option<(&'a StepExecution, &'a [StepStatus])>,
    /// Next step row to create (first time the instance reaches it).
    pub schedule: Option<&'a StepExecution>,
    /// Only write while this drive claim is still held.
    pub owner: Option<&'a str>,
    /// Only write the step if no callback was recorded on it meanwhile.
    pub unless_called_back: bool,
}

impl<'a> Transition<'a> {
    pub fn instance(instance: &'a WorkflowInstance, from: &'a [InstanceStatus]) -> Self {
        Self {
            instance,
            instance_from: from,
            step: None,
            schedule: None,
            owner: None,
            unless_called_back: false,
        }
    }

    pub fn with_step(mut self, step: &'a StepExecution, from: &'a [StepStatus]) -> Self {
        self.step = Some((step, from));
        self
    }

    pub fn scheduling(mut self, next: &'a StepExecution) -> Self {
        self.schedule = Some(next);
        self
    }

    pub fn claimed_by(mut self, owner: &'a str) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn unless_called_back(mut self) -> Self {
        self.unless_called_back = true;
        self
    }
}

fn insert_step(tx: &Transaction<'_>, step: &StepExecution) -> Result<()> {
    tx.execute(
        "INSERT INTO step_executions (instance_id, step_index, step_name, step_type, config_snapshot,
             status, attempt, input, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(instance_id, step_index) DO NOTHING",
        params![
            step.instance_id.0,
            step.step_index as i64,
            step.step_name,
            step.step_type.as_str(),
            to_json(&step.config_snapshot)?,
            step.status.as_str(),
            step.attempt as i64,
            to_json(&step.input)?,
            ts(&step.created_at),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn update_instance_row(
    tx: &Transaction<'_>,
    inst: &WorkflowInstance,
    expected: &[InstanceStatus],
    owner: Option<&str>,
) -> Result<bool> {
    let changed = tx
        .execute(
            "UPDATE instances SET
                 status = ?2, step_index = ?3, context = ?4, updated_at = ?5, started_at = ?6,
                 completed_at = ?7, deadline = ?8, last_error = ?9, failed_step = ?10,
                 cancel_requested = MAX(cancel_requested, ?11),
                 claimed_by = CASE WHEN ?2 IN ('completed', 'failed', 'cancelled', 'timed_out')
                                   THEN NULL ELSE claimed_by END,
                 claim_expires_at = CASE WHEN ?2 IN ('completed', 'failed', 'cancelled', 'timed_out')
                                   THEN NULL ELSE claim_expires_at END
             WHERE id = ?1 AND status IN (SELECT value FROM json_each(?12))
               AND (?13 IS NULL OR claimed_by = ?13)",
            params![
                inst.id.0,
                inst.status.as_str(),
                inst.step_index as i64,
                to_json(&inst.context)?,
                ts(&inst.updated_at),
                opt_ts(&inst.started_at),
                opt_ts(&inst.completed_at),
                opt_ts(&inst.deadline),
                inst.last_error,
                inst.failed_step.map(|i| i as i64),
                inst.cancel_requested,
                status_list(expected.iter().map(|s| s.as_str())),
                owner,
            ],
        )
        .map_err(db_err)?;
    Ok(changed == 1)
}

fn update_step_row(
    tx: &Transaction<'_>,
    step: &StepExecution,
    expected: &[StepStatus],
    owner: Option<&str>,
    unless_called_back: bool,
) -> Result<bool> {
    let changed = tx
        .execute(
            "UPDATE step_executions SET
                 status = ?3, attempt = ?4, input = ?5, output = ?6, error = ?7,
                 wake_condition = ?8, decided_by = ?9, decision = ?10, decision_reason = ?11,
                 agent_reasoning = ?12, external_request = ?13, external_response = ?14,
                 callback_token_hash = ?15, callback_consumed_at = ?16, wake_at = ?17,
                 deadline = ?18, started_at = ?19, completed_at = ?20
             WHERE instance_id = ?1 AND step_index = ?2
               AND status IN (SELECT value FROM json_each(?21))
               AND (?22 IS NULL OR EXISTS
                    (SELECT 1 FROM instances WHERE id = ?1 AND claimed_by = ?22))
               AND (?23 = 0 OR callback_consumed_at IS NULL)",
            params![
                step.instance_id.0,
                step.step_index as i64,
                step.status.as_str(),
                step.attempt as i64,
                to_json(&step.input)?,
                opt_json(&step.output)?,
                step.error,
                opt_json(&step.wake_condition)?,
                step.decided_by,
                step.decision.map(|d| d.as_str()),
                step.decision_reason,
                step.agent_reasoning,
                opt_json(&step.external_request)?,
                opt_json(&step.external_response)?,
                step.callback_token_hash,
                opt_ts(&step.callback_consumed_at),
                opt_ts(&step.wake_at),
                opt_ts(&step.deadline),
                opt_ts(&step.started_at),
                opt_ts(&step.completed_at),
                status_list(expected.iter().map(|s| s.as_str())),
                owner,
                unless_called_back,
            ],
        )
        .map_err(db_err)?;
    Ok(changed == 1)
}

impl SqliteStore {
    /// Persist a new instance and its first step in one transaction.
    pub fn create_instance(&self, inst: &WorkflowInstance, first: &StepExecution) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            &format!(
                "INSERT INTO instances ({INSTANCE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                inst.id.0,
                inst.template_id.0,
                inst.template_version as i64,
                inst.tenant,
                inst.status.as_str(),
                inst.step_index as i64,
                to_json(&inst.trigger_payload)?,
                to_json(&inst.context)?,
                to_json(&inst.initiator)?,
                ts(&inst.created_at),
                ts(&inst.updated_at),
                opt_ts(&inst.started_at),
                opt_ts(&inst.completed_at),
                opt_ts(&inst.deadline),
                inst.last_error,
                inst.failed_step.map(|i| i as i64),
                inst.cancel_requested,
            ],
        )
        .map_err(db_err)?;
        insert_step(&tx, first)?;
        tx.commit().map_err(db_err)?;
        debug!(instance_id = %inst.id, "Instance persisted");
        Ok(())
    }

    pub fn get_instance(&self, id: &InstanceId) -> Result<Option<WorkflowInstance>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?1"),
            params![id.0],
            row_to_instance,
        )
        .optional()
        .map_err(db_err)
    }

    /// Newest first.
    pub fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM instances
                 WHERE (?1 IS NULL OR tenant = ?1)
                   AND (?2 IS NULL OR template_id = ?2)
                   AND (?3 IS NULL OR status = ?3)
                 ORDER BY created_at DESC
                 LIMIT ?4"
            ))
            .map_err(db_err)?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt
            .query_map(
                params![
                    filter.tenant,
                    filter.template_id.as_ref().map(|t| t.0.as_str()),
                    filter.status.map(|s| s.as_str()),
                    limit,
                ],
                row_to_instance,
            )
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn get_step(&self, id: &InstanceId, step_index: usize) -> Result<Option<StepExecution>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {STEP_COLUMNS} FROM step_executions WHERE instance_id = ?1 AND step_index = ?2"
            ),
            params![id.0, step_index as i64],
            row_to_step,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn list_steps(&self, id: &InstanceId) -> Result<Vec<StepExecution>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM step_executions WHERE instance_id = ?1 ORDER BY step_index"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![id.0], row_to_step).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn find_step_by_token_hash(&self, hash: &str) -> Result<Option<StepExecution>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {STEP_COLUMNS} FROM step_executions WHERE callback_token_hash = ?1"),
            params![hash],
            row_to_step,
        )
        .optional()
        .map_err(db_err)
    }

    /// Guarded update of a single step row.
    pub fn update_step(&self, step: &StepExecution, expected: &[StepStatus]) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let applied = update_step_row(&tx, step, expected, None, false)?;
        tx.commit().map_err(db_err)?;
        Ok(applied)
    }

    /// Like [`SqliteStore::update_step`], but only while `owner` still holds
    /// the instance's drive claim.
    pub fn update_claimed_step(
        &self,
        step: &StepExecution,
        expected: &[StepStatus],
        owner: &str,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let applied = update_step_row(&tx, step, expected, Some(owner), false)?;
        tx.commit().map_err(db_err)?;
        Ok(applied)
    }

    /// Store the hash of a freshly minted callback token on a running step,
    /// before the token leaves the process.
    pub fn record_callback_token(
        &self,
        id: &InstanceId,
        step_index: usize,
        token_hash: &str,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE step_executions
                 SET callback_token_hash = ?3, deadline = ?4,
                     external_response = NULL, callback_consumed_at = NULL
                 WHERE instance_id = ?1 AND step_index = ?2 AND status = 'running'",
                params![id.0, step_index as i64, token_hash, opt_ts(&deadline)],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Record a callback that arrived while its step is still running
    /// (before the outbound request returned). Consumes the token.
    pub fn record_early_callback(
        &self,
        id: &InstanceId,
        step_index: usize,
        token_hash: &str,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE step_executions
                 SET external_response = ?4, callback_consumed_at = ?5
                 WHERE instance_id = ?1 AND step_index = ?2 AND status = 'running'
                   AND callback_token_hash = ?3 AND callback_consumed_at IS NULL",
                params![id.0, step_index as i64, token_hash, to_json(payload)?, ts(&now)],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Apply a transition atomically. Returns false (and writes nothing)
    /// when any guard does not match the stored status.
    pub fn apply(&self, transition: &Transition<'_>) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        if !update_instance_row(
            &tx,
            transition.instance,
            transition.instance_from,
            transition.owner,
        )? {
            return Ok(false);
        }
        if let Some((step, expected)) = transition.step {
            if !update_step_row(&tx, step, expected, None, transition.unless_called_back)? {
                // Dropping the transaction rolls back the instance write
                return Ok(false);
            }
        }
        if let Some(next) = transition.schedule {
            insert_step(&tx, next)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(true)
    }

    /// Flag a running instance for cancellation at its next step boundary.
    pub fn request_cancel(&self, id: &InstanceId, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE instances SET cancel_requested = 1, updated_at = ?2
                 WHERE id = ?1 AND status = 'running'",
                params![id.0, ts(&now)],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Take the drive claim on a runnable instance. Non-blocking: returns
    /// false when another live claim exists.
    pub fn claim_instance(
        &self,
        id: &InstanceId,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE instances SET claimed_by = ?2, claim_expires_at = ?3
                 WHERE id = ?1 AND status IN ('pending', 'running')
                   AND (claimed_by IS NULL OR claimed_by = ?2 OR claim_expires_at < ?4)",
                params![id.0, owner, ts(&(now + lease)), ts(&now)],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Extend a claim this owner still holds. Returns false once the claim
    /// has been lost.
    pub fn renew_claim(
        &self,
        id: &InstanceId,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE instances SET claim_expires_at = ?3
                 WHERE id = ?1 AND claimed_by = ?2",
                params![id.0, owner, ts(&(now + lease))],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    pub fn release_claim(&self, id: &InstanceId, owner: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE instances SET claimed_by = NULL, claim_expires_at = NULL
             WHERE id = ?1 AND claimed_by = ?2",
            params![id.0, owner],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Pending/running instances nobody holds a live claim on, oldest first.
    pub fn runnable_instances(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<InstanceId>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM instances
                 WHERE status IN ('pending', 'running')
                   AND (claimed_by IS NULL OR claim_expires_at < ?1)
                 ORDER BY updated_at
                 LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![ts(&now), limit as i64], |row| {
                row.get::<_, String>(0).map(InstanceId)
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Waiting steps whose wake time has been reached.
    pub fn due_wait_steps(&self, now: DateTime<Utc>) -> Result<Vec<StepExecution>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM step_executions
                 WHERE status = 'waiting' AND wake_at IS NOT NULL AND wake_at <= ?1
                 ORDER BY wake_at"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![ts(&now)], row_to_step).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::context::WorkflowContext;
    use trellis_core::types::{
        Actor, ApprovalConfig, StepDefinition, StepKind, TemplateDefinition,
    };

    fn setup() -> (SqliteStore, WorkflowInstance, StepExecution) {
        let store = SqliteStore::in_memory().unwrap();
        let def = TemplateDefinition::new(
            "expense",
            vec![StepDefinition::new(
                "review",
                StepKind::Approval(ApprovalConfig {
                    users: vec!["manager".into()],
                    ..Default::default()
                }),
            )],
        );
        let tpl = store.publish_template(&def, Utc::now()).unwrap();
        let now = Utc::now();
        let payload = json!({"amount": 500});
        let inst = WorkflowInstance {
            id: InstanceId::new(),
            template_id: tpl.id.clone(),
            template_version: tpl.version,
            tenant: "default".into(),
            status: InstanceStatus::Pending,
            step_index: 0,
            context: WorkflowContext::from_payload(&payload),
            trigger_payload: payload,
            initiator: Actor::user("alice"),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            deadline: Some(now + Duration::hours(1)),
            last_error: None,
            failed_step: None,
            cancel_requested: false,
        };
        let step = StepExecution::scheduled(&inst.id, 0, &def.steps[0], now);
        store.create_instance(&inst, &step).unwrap();
        (store, inst, step)
    }

    #[test]
    fn create_and_load_instance_with_first_step() {
        let (store, inst, _) = setup();
        let loaded = store.get_instance(&inst.id).unwrap().unwrap();
        assert_eq!(loaded.id, inst.id);
        assert_eq!(loaded.status, InstanceStatus::Pending);
        assert_eq!(loaded.context, inst.context);
        assert_eq!(loaded.initiator, inst.initiator);
        assert_eq!(loaded.template_version, 1);
        assert!(loaded.deadline.is_some());
        let steps = store.list_steps(&inst.id).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Pending);
        assert_eq!(steps[0].step_name, "review");
    }

    #[test]
    fn guarded_transition_is_noop_on_stale_status() {
        let (store, mut inst, _) = setup();
        inst.status = InstanceStatus::Running;
        assert!(store
            .apply(&Transition::instance(&inst, &[InstanceStatus::Pending]))
            .unwrap());
        // Same guard again: row is no longer pending
        inst.status = InstanceStatus::Completed;
        assert!(!store
            .apply(&Transition::instance(&inst, &[InstanceStatus::Pending]))
            .unwrap());
        let loaded = store.get_instance(&inst.id).unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Running);
    }

    #[test]
    fn failed_step_guard_rolls_back_instance_write() {
        let (store, mut inst, mut step) = setup();
        inst.status = InstanceStatus::Paused;
        step.status = StepStatus::WaitingApproval;
        let applied = store
            .apply(
                &Transition::instance(&inst, &[InstanceStatus::Pending])
                    .with_step(&step, &[StepStatus::Running]),
            )
            .unwrap();
        assert!(!applied);
        let loaded = store.get_instance(&inst.id).unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Pending);
    }

    #[test]
    fn claims_are_exclusive_until_lease_expires() {
        let (store, inst, _) = setup();
        let now = Utc::now();
        let lease = Duration::seconds(60);
        assert!(store.claim_instance(&inst.id, "w1:a", now, lease).unwrap());
        assert!(!store.claim_instance(&inst.id, "w2:b", now, lease).unwrap());
        assert!(store.runnable_instances(now, 10).unwrap().is_empty());

        // After the lease another worker may take over
        let later = now + Duration::seconds(61);
        assert!(store.claim_instance(&inst.id, "w2:b", later, lease).unwrap());

        store.release_claim(&inst.id, "w2:b").unwrap();
        assert_eq!(store.runnable_instances(later, 10).unwrap(), vec![inst.id.clone()]);
    }

    #[test]
    fn lost_claim_blocks_renewal_and_claimed_writes() {
        let (store, mut inst, mut step) = setup();
        let now = Utc::now();
        let lease = Duration::seconds(1);
        assert!(store.claim_instance(&inst.id, "w1:a", now, lease).unwrap());
        assert!(store.renew_claim(&inst.id, "w1:a", now, lease).unwrap());

        // The lease ran out and another worker took over
        let later = now + Duration::seconds(2);
        assert!(store.claim_instance(&inst.id, "w2:b", later, lease).unwrap());
        assert!(!store.renew_claim(&inst.id, "w1:a", later, lease).unwrap());

        inst.status = InstanceStatus::Running;
        assert!(!store
            .apply(&Transition::instance(&inst, &[InstanceStatus::Pending]).claimed_by("w1:a"))
            .unwrap());
        step.status = StepStatus::Running;
        assert!(!store
            .update_claimed_step(&step, &[StepStatus::Pending], "w1:a")
            .unwrap());

        assert!(store
            .apply(&Transition::instance(&inst, &[InstanceStatus::Pending]).claimed_by("w2:b"))
            .unwrap());
        assert!(store
            .update_claimed_step(&step, &[StepStatus::Pending], "w2:b")
            .unwrap());
    }

    #[test]
    fn early_callback_is_recorded_once_and_blocks_suspension() {
        let (store, mut inst, mut step) = setup();
        step.status = StepStatus::Running;
        assert!(store.update_step(&step, &[StepStatus::Pending]).unwrap());
        assert!(store.record_callback_token(&inst.id, 0, "h1", None).unwrap());

        let now = Utc::now();
        assert!(!store
            .record_early_callback(&inst.id, 0, "other", &json!({}), now)
            .unwrap());
        assert!(store
            .record_early_callback(&inst.id, 0, "h1", &json!({"ok": true}), now)
            .unwrap());
        assert!(!store
            .record_early_callback(&inst.id, 0, "h1", &json!({}), now)
            .unwrap());

        // Pausing the step now would drop the recorded answer
        inst.status = InstanceStatus::Paused;
        step.status = StepStatus::WaitingExternal;
        step.callback_token_hash = Some("h1".into());
        assert!(!store
            .apply(
                &Transition::instance(&inst, &[InstanceStatus::Pending])
                    .with_step(&step, &[StepStatus::Running])
                    .unless_called_back(),
            )
            .unwrap());

        let stored = store.get_step(&inst.id, 0).unwrap().unwrap();
        assert_eq!(stored.status, StepStatus::Running);
        assert_eq!(stored.external_response, Some(json!({"ok": true})));
        assert!(stored.callback_consumed_at.is_some());
        assert_eq!(
            store.get_instance(&inst.id).unwrap().unwrap().status,
            InstanceStatus::Pending
        );
    }

    #[test]
    fn cancel_request_only_flags_running_instances() {
        let (store, mut inst, _) = setup();
        assert!(!store.request_cancel(&inst.id, Utc::now()).unwrap());
        inst.status = InstanceStatus::Running;
        store
            .apply(&Transition::instance(&inst, &[InstanceStatus::Pending]))
            .unwrap();
        assert!(store.request_cancel(&inst.id, Utc::now()).unwrap());

        // A later write carrying a stale flag does not clear the request
        inst.step_index = 0;
        store
            .apply(&Transition::instance(&inst, &[InstanceStatus::Running]))
            .unwrap();
        assert!(store.get_instance(&inst.id).unwrap().unwrap().cancel_requested);
    }

    #[test]
    fn token_hash_lookup_and_due_waits() {
        let (store, _inst, mut step) = setup();
        let now = Utc::now();
        step.status = StepStatus::Waiting;
        step.wake_at = Some(now - Duration::seconds(1));
        step.callback_token_hash = Some("abc123".into());
        assert!(store.update_step(&step, &[StepStatus::Pending]).unwrap());

        let found = store.find_step_by_token_hash("abc123").unwrap().unwrap();
        assert_eq!(found.step_index, 0);
        assert!(store.find_step_by_token_hash("nope").unwrap().is_none());
        assert_eq!(store.due_wait_steps(now).unwrap().len(), 1);
    }

    #[test]
    fn list_instances_filters_by_status() {
        let (store, inst, _) = setup();
        let all = store.list_instances(&InstanceFilter::default()).unwrap();
        assert_eq!(all.len(), 1);
        let running = store
            .list_instances(&InstanceFilter {
                status: Some(InstanceStatus::Running),
                ..Default::default()
            })
            .unwrap();
        assert!(running.is_empty());
        let by_template = store
            .list_instances(&InstanceFilter {
                template_id: Some(inst.template_id.clone()),
                limit: Some(5),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_template.len(), 1);
    }
}
