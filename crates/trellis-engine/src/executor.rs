use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use trellis_core::config::EngineConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EventBus, WorkflowEvent};
use trellis_core::types::{
    Actor, Branch, Decision, InstanceId, InstanceStatus, StepExecution, StepStatus,
    WakeCondition, WorkflowInstance, WorkflowTemplate,
};
use trellis_store::{SqliteStore, Transition};

use crate::expr;
use crate::permission::AgentPermissionGate;
use crate::retry::backoff_delay;
use crate::strategy::{
    authorize_decider, hash_token, Resolution, StepContext, StepFailure, StepOutcome,
    StrategySet, Suspension,
};

/// Drives instances through their steps.
///
/// Every state change is a guarded write; when a guard loses (another
/// worker, a resume request or the sweeper got there first) the executor
/// stops and reports the status it observed. Writes made while driving are
/// also guarded by the drive claim, which is renewed for as long as the
/// drive runs.
pub struct Executor {
    store: Arc<SqliteStore>,
    strategies: StrategySet,
    gate: Arc<AgentPermissionGate>,
    event_bus: Arc<EventBus>,
    worker_id: String,
    claim_lease: Duration,
    renew_every: std::time::Duration,
}

impl Executor {
    pub fn new(
        store: Arc<SqliteStore>,
        strategies: StrategySet,
        gate: Arc<AgentPermissionGate>,
        event_bus: Arc<EventBus>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            strategies,
            gate,
            event_bus,
            worker_id: config.worker_id.clone(),
            claim_lease: Duration::seconds(config.claim_lease_secs as i64),
            renew_every: std::time::Duration::from_millis(
                (config.claim_lease_secs.saturating_mul(1000) / 3).max(100),
            ),
        }
    }

    fn renew_claim(&self, id: &InstanceId, owner: &str) -> Result<bool> {
        self.store
            .renew_claim(id, owner, Utc::now(), self.claim_lease)
    }

    /// Await `fut` while renewing the drive claim in the background, so a
    /// long step never lets the lease run out under it.
    async fn holding_claim<F: Future>(&self, id: &InstanceId, owner: &str, fut: F) -> F::Output {
        tokio::pin!(fut);
        let mut ticker = tokio::time::interval(self.renew_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = ticker.tick() => match self.renew_claim(id, owner) {
                    Ok(true) => {}
                    Ok(false) => warn!(instance_id = %id, "Drive claim lost while a step was running"),
                    Err(e) => warn!(instance_id = %id, error = %e, "Failed to renew drive claim"),
                },
            }
        }
    }

    fn load(&self, id: &InstanceId) -> Result<WorkflowInstance> {
        self.store
            .get_instance(id)?
            .ok_or_else(|| TrellisError::InstanceNotFound(id.0.clone()))
    }

    fn template_of(&self, inst: &WorkflowInstance) -> Result<WorkflowTemplate> {
        self.store
            .get_template_version(&inst.template_id, inst.template_version)?
            .ok_or_else(|| {
                TrellisError::TemplateNotFound(format!(
                    "{} v{}",
                    inst.template_id, inst.template_version
                ))
            })
    }

    fn status_changed(
        &self,
        id: &InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
        reason: Option<String>,
    ) {
        if from != to {
            self.event_bus.publish(WorkflowEvent::InstanceStatusChanged {
                instance_id: id.clone(),
                from,
                to,
                reason,
            });
        }
    }

    /// Run an instance until it suspends, finishes, or another writer wins a
    /// guard. Instances that are not runnable, or claimed by someone else,
    /// are left alone.
    pub async fn drive(&self, id: &InstanceId) -> Result<InstanceStatus> {
        let inst = self.load(id)?;
        if !matches!(inst.status, InstanceStatus::Pending | InstanceStatus::Running) {
            return Ok(inst.status);
        }

        let owner = format!(
            "{}:{}",
            self.worker_id,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        if !self
            .store
            .claim_instance(id, &owner, Utc::now(), self.claim_lease)?
        {
            debug!(instance_id = %id, "Instance claimed elsewhere, skipping");
            return Ok(inst.status);
        }

        let result = self.drive_claimed(id, &owner).await;
        if let Err(e) = self.store.release_claim(id, &owner) {
            warn!(instance_id = %id, error = %e, "Failed to release claim");
        }
        result
    }

    async fn drive_claimed(&self, id: &InstanceId, owner: &str) -> Result<InstanceStatus> {
        loop {
            if !self.renew_claim(id, owner)? {
                debug!(instance_id = %id, "Drive claim lost, stopping");
                return Ok(self.load(id)?.status);
            }
            let mut inst = self.load(id)?;
            let now = Utc::now();

            match inst.status {
                InstanceStatus::Pending => {
                    inst.status = InstanceStatus::Running;
                    inst.started_at = Some(now);
                    inst.updated_at = now;
                    if !self.store.apply(
                        &Transition::instance(&inst, &[InstanceStatus::Pending]).claimed_by(owner),
                    )? {
                        return Ok(self.load(id)?.status);
                    }
                    self.status_changed(id, InstanceStatus::Pending, InstanceStatus::Running, None);
                    continue;
                }
                InstanceStatus::Running => {}
                other => return Ok(other),
            }

            let mut step = self
                .store
                .get_step(id, inst.step_index)?
                .ok_or_else(|| {
                    TrellisError::Database(format!(
                        "instance {} has no step row at index {}",
                        id, inst.step_index
                    ))
                })?;

            // Step boundary: cancellation, then the instance deadline
            if inst.cancel_requested {
                return self.cancel_at_boundary(inst, step, now, owner);
            }
            if inst.deadline_passed(now) {
                return self.time_out_at_boundary(inst, step, now, owner);
            }

            let resumed = match step.status {
                StepStatus::Pending => false,
                StepStatus::Running => step.wake_condition.is_some(),
                other => {
                    return Err(TrellisError::InvalidTransition {
                        instance_id: id.0.clone(),
                        from: other.to_string(),
                        to: StepStatus::Running.to_string(),
                    })
                }
            };

            if !resumed {
                let replay = step.status == StepStatus::Running;
                step.status = StepStatus::Running;
                step.attempt += 1;
                step.input = inst.context.to_value();
                step.error = None;
                step.started_at = Some(now);
                if !self.store.update_claimed_step(
                    &step,
                    &[StepStatus::Pending, StepStatus::Running],
                    owner,
                )? {
                    return Ok(self.load(id)?.status);
                }
                if replay {
                    info!(instance_id = %id, step = %step.step_name, attempt = step.attempt, "Replaying interrupted step");
                }
                self.event_bus.publish(WorkflowEvent::StepStarted {
                    instance_id: id.clone(),
                    step_index: step.step_index,
                    step_name: step.step_name.clone(),
                    attempt: step.attempt,
                });
            }

            let outcome = self.run_step(&inst, &mut step, resumed, owner).await?;

            // The call has returned; pick up a cancel requested meanwhile
            let fresh = self.load(id)?;
            if fresh.status != InstanceStatus::Running {
                return Ok(fresh.status);
            }
            inst.cancel_requested = fresh.cancel_requested;

            let template = self.template_of(&inst)?;
            let settled = match outcome {
                StepOutcome::Resolved(resolution) => {
                    self.resolve(&template, inst, step, resolution, owner)?
                }
                StepOutcome::Suspended(suspension) => {
                    self.suspend(inst, step, suspension, owner)?
                }
                StepOutcome::Failed(failure) => self.fail(&template, inst, step, failure, owner)?,
            };
            match settled {
                Some(InstanceStatus::Running) => continue,
                Some(status) => return Ok(status),
                None => return Ok(self.load(id)?.status),
            }
        }
    }

    /// Execute (or resume) the step, retrying retryable failures in place
    /// while the step's retry policy has attempts left.
    async fn run_step(
        &self,
        inst: &WorkflowInstance,
        step: &mut StepExecution,
        resumed: bool,
        owner: &str,
    ) -> Result<StepOutcome> {
        let strategy = self.strategies.get(step.step_type).ok_or_else(|| {
            TrellisError::Validation(format!("no strategy for step type {}", step.step_type.as_str()))
        })?;

        loop {
            let ctx = StepContext {
                instance: inst,
                context: inst.context.clone(),
                step: &*step,
                now: Utc::now(),
            };
            let call = if resumed {
                strategy.resume(ctx)
            } else {
                strategy.execute(ctx)
            };
            let outcome = self.holding_claim(&inst.id, owner, call).await;

            let StepOutcome::Failed(failure) = &outcome else {
                return Ok(outcome);
            };
            let Some(policy) = step.config_snapshot.retry.as_ref() else {
                return Ok(outcome);
            };
            if resumed || !failure.retryable || step.attempt >= policy.max_attempts {
                return Ok(outcome);
            }

            // No further attempts once cancellation has been asked for
            if self.load(&inst.id)?.cancel_requested {
                return Ok(outcome);
            }

            self.event_bus.publish(WorkflowEvent::StepFailed {
                instance_id: inst.id.clone(),
                step_index: step.step_index,
                step_name: step.step_name.clone(),
                error: failure.message.clone(),
                retryable: true,
            });
            let delay = backoff_delay(
                step.attempt.saturating_sub(1),
                policy.initial_backoff_ms,
                policy.max_backoff_ms,
            );
            warn!(
                instance_id = %inst.id,
                step = %step.step_name,
                attempt = step.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure.message,
                "Step failed, retrying"
            );
            self.holding_claim(&inst.id, owner, tokio::time::sleep(delay)).await;

            step.attempt += 1;
            step.error = Some(failure.message.clone());
            if !self.store.update_claimed_step(step, &[StepStatus::Running], owner)? {
                return Ok(outcome);
            }
        }
    }

    /// Record the output, merge the patch and move to the next step (or
    /// finish). Returns the instance status after the write, or None when a
    /// guard was lost.
    fn resolve(
        &self,
        template: &WorkflowTemplate,
        mut inst: WorkflowInstance,
        mut step: StepExecution,
        resolution: Resolution,
        owner: &str,
    ) -> Result<Option<InstanceStatus>> {
        let now = Utc::now();
        step.status = StepStatus::Completed;
        step.output = Some(resolution.output);
        step.completed_at = Some(now);
        inst.context.merge(&resolution.context_patch);

        let next = match resolution.branch {
            Branch::Continue => step.step_index + 1,
            Branch::SkipTo(target) if target > step.step_index => target,
            Branch::SkipTo(target) => {
                return self.fail(
                    template,
                    inst,
                    step,
                    StepFailure::fatal(format!("skip_to:{} does not jump forward", target)),
                    owner,
                );
            }
        };

        self.event_bus.publish(WorkflowEvent::StepCompleted {
            instance_id: inst.id.clone(),
            step_index: step.step_index,
            step_name: step.step_name.clone(),
        });
        self.advance(template, inst, step, next, now, owner)
    }

    /// Persist the finished `step` and move the instance to `next`.
    fn advance(
        &self,
        template: &WorkflowTemplate,
        mut inst: WorkflowInstance,
        step: StepExecution,
        next: usize,
        now: DateTime<Utc>,
        owner: &str,
    ) -> Result<Option<InstanceStatus>> {
        inst.updated_at = now;
        let steps = template.steps();

        let (to, reason) = if inst.cancel_requested {
            (InstanceStatus::Cancelled, Some("cancelled at step boundary".to_string()))
        } else if next >= steps.len() {
            (InstanceStatus::Completed, None)
        } else {
            (InstanceStatus::Running, None)
        };

        let applied = if to == InstanceStatus::Running {
            inst.step_index = next;
            let scheduled = StepExecution::scheduled(&inst.id, next, &steps[next], now);
            self.store.apply(
                &Transition::instance(&inst, &[InstanceStatus::Running])
                    .with_step(&step, &[StepStatus::Running])
                    .scheduling(&scheduled)
                    .claimed_by(owner),
            )?
        } else {
            inst.status = to;
            inst.completed_at = Some(now);
            self.store.apply(
                &Transition::instance(&inst, &[InstanceStatus::Running])
                    .with_step(&step, &[StepStatus::Running])
                    .claimed_by(owner),
            )?
        };
        if !applied {
            return Ok(None);
        }

        if to.is_terminal() {
            info!(instance_id = %inst.id, status = %to, "Instance finished");
        } else {
            debug!(instance_id = %inst.id, from = step.step_index, to = next, "Advanced");
        }
        self.status_changed(&inst.id, InstanceStatus::Running, to, reason);
        Ok(Some(to))
    }

    fn suspend(
        &self,
        mut inst: WorkflowInstance,
        mut step: StepExecution,
        suspension: Suspension,
        owner: &str,
    ) -> Result<Option<InstanceStatus>> {
        let now = Utc::now();
        let waiting = suspension.wake.waiting_status();
        let awaits_callback = suspension.wake == WakeCondition::Callback;
        step.wake_at = suspension.wake.wake_at();
        step.wake_condition = Some(suspension.wake);
        step.deadline = suspension.deadline;
        step.external_request = suspension.external_request;
        step.callback_token_hash = suspension.callback_token_hash;
        inst.updated_at = now;

        // A suspend point honors a pending cancel instead of pausing
        let (to, reason) = if inst.cancel_requested {
            step.status = StepStatus::Cancelled;
            step.completed_at = Some(now);
            inst.status = InstanceStatus::Cancelled;
            inst.completed_at = Some(now);
            (InstanceStatus::Cancelled, Some("cancelled at suspend point".to_string()))
        } else {
            step.status = waiting;
            inst.status = InstanceStatus::Paused;
            (InstanceStatus::Paused, None)
        };

        let mut transition = Transition::instance(&inst, &[InstanceStatus::Running])
            .with_step(&step, &[StepStatus::Running])
            .claimed_by(owner);
        if awaits_callback && to == InstanceStatus::Paused {
            transition = transition.unless_called_back();
        }
        if !self.store.apply(&transition)? {
            if awaits_callback {
                return self.continue_with_early_callback(&inst.id, step, owner);
            }
            return Ok(None);
        }

        if to == InstanceStatus::Paused {
            info!(instance_id = %inst.id, step = %step.step_name, status = %waiting, "Step suspended");
            self.event_bus.publish(WorkflowEvent::StepSuspended {
                instance_id: inst.id.clone(),
                step_index: step.step_index,
                status: waiting,
            });
        }
        self.status_changed(&inst.id, InstanceStatus::Running, to, reason);
        Ok(Some(to))
    }

    /// The remote answered before its request returned: keep the step
    /// running with the recorded response, so the next round resumes it
    /// instead of pausing.
    fn continue_with_early_callback(
        &self,
        id: &InstanceId,
        mut step: StepExecution,
        owner: &str,
    ) -> Result<Option<InstanceStatus>> {
        let Some(stored) = self.store.get_step(id, step.step_index)? else {
            return Ok(None);
        };
        if stored.status != StepStatus::Running || stored.callback_consumed_at.is_none() {
            return Ok(None);
        }
        step.status = StepStatus::Running;
        step.completed_at = None;
        step.external_response = stored.external_response;
        step.callback_consumed_at = stored.callback_consumed_at;
        if !self
            .store
            .update_claimed_step(&step, &[StepStatus::Running], owner)?
        {
            return Ok(None);
        }
        debug!(instance_id = %id, step = %step.step_name, "Callback arrived before suspension");
        Ok(Some(InstanceStatus::Running))
    }

    fn fail(
        &self,
        template: &WorkflowTemplate,
        mut inst: WorkflowInstance,
        mut step: StepExecution,
        failure: StepFailure,
        owner: &str,
    ) -> Result<Option<InstanceStatus>> {
        let now = Utc::now();
        step.status = StepStatus::Failed;
        step.error = Some(failure.message.clone());
        step.completed_at = Some(now);

        warn!(
            instance_id = %inst.id,
            step = %step.step_name,
            kind = ?failure.kind,
            error = %failure.message,
            "Step failed"
        );
        self.event_bus.publish(WorkflowEvent::StepFailed {
            instance_id: inst.id.clone(),
            step_index: step.step_index,
            step_name: step.step_name.clone(),
            error: failure.message.clone(),
            retryable: false,
        });

        if step.config_snapshot.optional {
            let next = step.step_index + 1;
            return self.advance(template, inst, step, next, now, owner);
        }

        let reason = format!("step '{}' failed: {}", step.step_name, failure.message);
        inst.status = InstanceStatus::Failed;
        inst.updated_at = now;
        inst.completed_at = Some(now);
        inst.last_error = Some(reason.clone());
        inst.failed_step = Some(step.step_index);
        if !self.store.apply(
            &Transition::instance(&inst, &[InstanceStatus::Running])
                .with_step(&step, &[StepStatus::Running])
                .claimed_by(owner),
        )? {
            return Ok(None);
        }
        self.status_changed(
            &inst.id,
            InstanceStatus::Running,
            InstanceStatus::Failed,
            Some(reason),
        );
        Ok(Some(InstanceStatus::Failed))
    }

    fn cancel_at_boundary(
        &self,
        mut inst: WorkflowInstance,
        mut step: StepExecution,
        now: DateTime<Utc>,
        owner: &str,
    ) -> Result<InstanceStatus> {
        step.status = StepStatus::Cancelled;
        step.completed_at = Some(now);
        inst.status = InstanceStatus::Cancelled;
        inst.updated_at = now;
        inst.completed_at = Some(now);
        if !self.store.apply(
            &Transition::instance(&inst, &[InstanceStatus::Running])
                .with_step(&step, &[StepStatus::Pending, StepStatus::Running])
                .claimed_by(owner),
        )? {
            return Ok(self.load(&inst.id)?.status);
        }
        info!(instance_id = %inst.id, "Instance cancelled at step boundary");
        self.status_changed(
            &inst.id,
            InstanceStatus::Running,
            InstanceStatus::Cancelled,
            Some("cancelled at step boundary".into()),
        );
        Ok(InstanceStatus::Cancelled)
    }

    fn time_out_at_boundary(
        &self,
        mut inst: WorkflowInstance,
        mut step: StepExecution,
        now: DateTime<Utc>,
        owner: &str,
    ) -> Result<InstanceStatus> {
        let reason = "instance deadline exceeded".to_string();
        step.status = StepStatus::TimedOut;
        step.error = Some(reason.clone());
        step.completed_at = Some(now);
        inst.status = InstanceStatus::TimedOut;
        inst.updated_at = now;
        inst.completed_at = Some(now);
        inst.last_error = Some(reason.clone());
        if !self.store.apply(
            &Transition::instance(&inst, &[InstanceStatus::Running])
                .with_step(&step, &[StepStatus::Pending, StepStatus::Running])
                .claimed_by(owner),
        )? {
            return Ok(self.load(&inst.id)?.status);
        }
        warn!(instance_id = %inst.id, "Instance deadline exceeded");
        self.event_bus.publish(WorkflowEvent::StepTimedOut {
            instance_id: inst.id.clone(),
            step_index: step.step_index,
        });
        self.status_changed(
            &inst.id,
            InstanceStatus::Running,
            InstanceStatus::TimedOut,
            Some(reason),
        );
        Ok(InstanceStatus::TimedOut)
    }

    /// Move a waiting step and its paused instance back to running in one
    /// transaction. Returns false when either guard lost.
    fn wake(
        &self,
        inst: &mut WorkflowInstance,
        step: &mut StepExecution,
        waiting: StepStatus,
    ) -> Result<bool> {
        let now = Utc::now();
        step.status = StepStatus::Running;
        inst.status = InstanceStatus::Running;
        inst.updated_at = now;
        let applied = self.store.apply(
            &Transition::instance(inst, &[InstanceStatus::Paused]).with_step(step, &[waiting]),
        )?;
        if applied {
            self.status_changed(&inst.id, InstanceStatus::Paused, InstanceStatus::Running, None);
        }
        Ok(applied)
    }

    /// Record a decision on a waiting approval step and continue the
    /// instance.
    pub async fn decide(
        &self,
        id: &InstanceId,
        step_index: usize,
        decider: &Actor,
        decision: Decision,
        reason: Option<String>,
        agent_reasoning: Option<String>,
    ) -> Result<InstanceStatus> {
        let not_waiting = || TrellisError::StepNotWaiting {
            instance_id: id.0.clone(),
            step_index,
        };
        let mut inst = self.load(id)?;
        let mut step = self.store.get_step(id, step_index)?.ok_or_else(not_waiting)?;
        if step.status != StepStatus::WaitingApproval || inst.status != InstanceStatus::Paused {
            return Err(not_waiting());
        }
        if step.deadline.is_some_and(|d| d <= Utc::now()) {
            return Err(not_waiting());
        }

        authorize_decider(&self.gate, &inst, &step, decider, agent_reasoning.as_deref())?;

        step.decision = Some(decision);
        step.decided_by = Some(decider.label());
        step.decision_reason = reason;
        step.agent_reasoning = agent_reasoning;
        if !self.wake(&mut inst, &mut step, StepStatus::WaitingApproval)? {
            return Err(not_waiting());
        }

        info!(instance_id = %id, step = %step.step_name, decided_by = %decider.label(), decision = decision.as_str(), "Decision recorded");
        self.event_bus.publish(WorkflowEvent::DecisionRecorded {
            instance_id: id.clone(),
            step_index,
            decided_by: decider.label(),
            decision,
        });
        self.drive(id).await
    }

    /// Deliver the result of an External step. The token is single use.
    ///
    /// A callback may overtake the outbound request's own response; it is
    /// then recorded on the still-running step and the driver picks it up
    /// instead of pausing.
    pub async fn callback(&self, token: &str, payload: Value) -> Result<InstanceStatus> {
        let token_hash = hash_token(token);
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("ok")
            .to_string();

        // Retried when the step moves between read and write
        for _ in 0..3 {
            let mut step = self
                .store
                .find_step_by_token_hash(&token_hash)?
                .ok_or(TrellisError::TokenInvalid)?;
            if step.callback_consumed_at.is_some() {
                return Err(TrellisError::AlreadyConsumed);
            }
            let now = Utc::now();
            if step.deadline.is_some_and(|d| d <= now) {
                return Err(TrellisError::TokenExpired);
            }
            let id = step.instance_id.clone();

            match step.status {
                StepStatus::Running if step.wake_condition.is_none() => {
                    if self.store.record_early_callback(
                        &id,
                        step.step_index,
                        &token_hash,
                        &payload,
                        now,
                    )? {
                        info!(instance_id = %id, step = %step.step_name, status = %status, "Callback received before suspension");
                        self.event_bus.publish(WorkflowEvent::CallbackReceived {
                            instance_id: id.clone(),
                            step_index: step.step_index,
                            status,
                        });
                        return Ok(self.load(&id)?.status);
                    }
                }
                StepStatus::WaitingExternal => {
                    let mut inst = self.load(&id)?;
                    if inst.status != InstanceStatus::Paused {
                        return Err(TrellisError::TokenExpired);
                    }
                    step.external_response = Some(payload.clone());
                    step.callback_consumed_at = Some(now);
                    if self.wake(&mut inst, &mut step, StepStatus::WaitingExternal)? {
                        info!(instance_id = %id, step = %step.step_name, status = %status, "Callback received");
                        self.event_bus.publish(WorkflowEvent::CallbackReceived {
                            instance_id: id.clone(),
                            step_index: step.step_index,
                            status,
                        });
                        return self.drive(&id).await;
                    }
                }
                _ => return Err(TrellisError::TokenExpired),
            }
        }
        Err(TrellisError::TokenExpired)
    }

    /// Merge `data` into the context of a paused instance and re-check a
    /// waiting condition.
    pub async fn signal(&self, id: &InstanceId, data: Map<String, Value>) -> Result<InstanceStatus> {
        let mut inst = self.load(id)?;
        if inst.status.is_terminal() {
            return Err(TrellisError::InstanceTerminal(id.0.clone()));
        }
        if inst.status != InstanceStatus::Paused {
            return Err(TrellisError::InvalidTransition {
                instance_id: id.0.clone(),
                from: inst.status.to_string(),
                to: "signal".into(),
            });
        }

        inst.context.merge(&data);
        inst.updated_at = Utc::now();
        let mut step = self.store.get_step(id, inst.step_index)?;

        let satisfied = match step.as_ref().and_then(|s| {
            (s.status == StepStatus::Waiting).then_some(s.wake_condition.as_ref()).flatten()
        }) {
            Some(WakeCondition::Expression { expression, .. }) => {
                expr::evaluate(expression, inst.context.data())?
            }
            _ => false,
        };

        if let (true, Some(step)) = (satisfied, step.as_mut()) {
            if self.wake(&mut inst, step, StepStatus::Waiting)? {
                debug!(instance_id = %id, step = %step.step_name, "Condition satisfied by signal");
                return self.drive(id).await;
            }
            return Ok(self.load(id)?.status);
        }

        if !self
            .store
            .apply(&Transition::instance(&inst, &[InstanceStatus::Paused]))?
        {
            return Ok(self.load(id)?.status);
        }
        Ok(InstanceStatus::Paused)
    }

    /// Resume every timer or condition wait whose wake time has come.
    /// Returns the instances moved back to running; the caller drives them.
    pub fn wake_due(&self, now: DateTime<Utc>) -> Result<Vec<InstanceId>> {
        let mut woken = Vec::new();
        for mut step in self.store.due_wait_steps(now)? {
            let Some(mut inst) = self.store.get_instance(&step.instance_id)? else {
                continue;
            };
            if inst.status != InstanceStatus::Paused || inst.step_index != step.step_index {
                continue;
            }
            if self.wake(&mut inst, &mut step, StepStatus::Waiting)? {
                debug!(instance_id = %inst.id, step = %step.step_name, "Wait elapsed");
                woken.push(inst.id);
            }
        }
        Ok(woken)
    }

    /// Cancel an instance. Pending and paused instances stop immediately;
    /// running ones are flagged and stop at their next step boundary.
    pub fn cancel(&self, id: &InstanceId) -> Result<InstanceStatus> {
        // Retried when the instance changes state between read and write
        for _ in 0..3 {
            let mut inst = self.load(id)?;
            let from = inst.status;
            let now = Utc::now();
            match from {
                s if s.is_terminal() => return Err(TrellisError::InstanceTerminal(id.0.clone())),
                InstanceStatus::Running => {
                    if self.store.request_cancel(id, now)? {
                        info!(instance_id = %id, "Cancellation requested");
                        self.event_bus.publish(WorkflowEvent::CancelRequested {
                            instance_id: id.clone(),
                        });
                        return Ok(InstanceStatus::Running);
                    }
                }
                InstanceStatus::Pending | InstanceStatus::Paused => {
                    let mut step = self.store.get_step(id, inst.step_index)?;
                    inst.status = InstanceStatus::Cancelled;
                    inst.cancel_requested = true;
                    inst.updated_at = now;
                    inst.completed_at = Some(now);
                    let step_from: &[StepStatus] = if from == InstanceStatus::Pending {
                        &[StepStatus::Pending]
                    } else {
                        &StepStatus::WAITING
                    };
                    let inst_from = [from];
                    let mut transition = Transition::instance(&inst, &inst_from);
                    if let Some(step) = step.as_mut() {
                        step.status = StepStatus::Cancelled;
                        step.completed_at = Some(now);
                    }
                    if let Some(step) = step.as_ref() {
                        transition = transition.with_step(step, step_from);
                    }
                    if self.store.apply(&transition)? {
                        info!(instance_id = %id, from = %from, "Instance cancelled");
                        self.status_changed(
                            id,
                            from,
                            InstanceStatus::Cancelled,
                            Some("cancelled".into()),
                        );
                        return Ok(InstanceStatus::Cancelled);
                    }
                }
                _ => {}
            }
        }
        Ok(self.load(id)?.status)
    }
}
