use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use trellis_core::context::WorkflowContext;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EventBus, WorkflowEvent};
use trellis_core::types::{
    Actor, CompareOp, FieldCondition, InstanceId, InstanceStatus, RecordChange, StepExecution,
    TemplateId, TriggerRule, WorkflowInstance, WorkflowTemplate,
};
use trellis_store::SqliteStore;

use crate::expr::{compare, lookup};
use crate::permission::{AgentPermissionGate, PermissionAction, PermissionQuery};

/// Initiator recorded on instances created by record changes.
pub const RECORD_CHANGE_INITIATOR: &str = "record-change";

/// Creates instances, explicitly or from record changes.
///
/// Holds no registry of its own: active templates are read from the store
/// for every change.
pub struct TriggerEvaluator {
    store: Arc<SqliteStore>,
    gate: Arc<AgentPermissionGate>,
    event_bus: Arc<EventBus>,
    default_timeout_secs: u64,
}

impl TriggerEvaluator {
    pub fn new(
        store: Arc<SqliteStore>,
        gate: Arc<AgentPermissionGate>,
        event_bus: Arc<EventBus>,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            store,
            gate,
            event_bus,
            default_timeout_secs,
        }
    }

    /// Start an instance of the template's current version.
    pub fn start_instance(
        &self,
        template_id: &TemplateId,
        payload: Value,
        initiator: Actor,
    ) -> Result<InstanceId> {
        let template = self
            .store
            .get_template(template_id)?
            .ok_or_else(|| TrellisError::TemplateNotFound(template_id.0.clone()))?;
        if !template.active {
            return Err(TrellisError::TemplateInactive(template_id.0.clone()));
        }

        if let Some(agent_id) = initiator.agent_ref() {
            let decision = self.gate.check(&PermissionQuery {
                agent_id,
                template_id,
                action: PermissionAction::Initiate,
                step_name: None,
                data: payload.as_object(),
                reasoning: initiator.intent.as_deref(),
            })?;
            if !decision.allowed {
                return Err(TrellisError::PermissionDenied(decision.reason));
            }
        }

        self.create(&template, payload, initiator)
    }

    fn create(
        &self,
        template: &WorkflowTemplate,
        payload: Value,
        initiator: Actor,
    ) -> Result<InstanceId> {
        let now = Utc::now();
        let timeout = template
            .definition
            .timeout_secs
            .unwrap_or(self.default_timeout_secs);
        let inst = WorkflowInstance {
            id: InstanceId::new(),
            template_id: template.id.clone(),
            template_version: template.version,
            tenant: template.tenant().to_string(),
            status: InstanceStatus::Pending,
            step_index: 0,
            context: WorkflowContext::from_payload(&payload),
            trigger_payload: payload,
            initiator,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            deadline: (timeout > 0).then(|| now + Duration::seconds(timeout as i64)),
            last_error: None,
            failed_step: None,
            cancel_requested: false,
        };
        let first = StepExecution::scheduled(&inst.id, 0, &template.steps()[0], now);
        self.store.create_instance(&inst, &first)?;

        info!(
            instance_id = %inst.id,
            template = %template.name(),
            version = template.version,
            initiator = %inst.initiator.label(),
            "Instance created"
        );
        self.event_bus.publish(WorkflowEvent::InstanceCreated {
            instance_id: inst.id.clone(),
            template_id: inst.template_id.clone(),
            template_version: inst.template_version,
            initiator: inst.initiator.label(),
        });
        Ok(inst.id)
    }

    /// Create one instance per active template of the tenant whose
    /// record-change rule matches.
    pub fn on_record_change(&self, change: &RecordChange) -> Result<Vec<InstanceId>> {
        let document = change.document();
        let mut created = Vec::new();
        for template in self.store.active_templates(&change.tenant)? {
            if !rule_matches(&template.definition.trigger, change, &document) {
                continue;
            }
            let id = self.create(
                &template,
                document.clone(),
                Actor::system(RECORD_CHANGE_INITIATOR),
            )?;
            created.push(id);
        }
        debug!(
            entity = %change.entity,
            record_id = %change.record_id,
            matched = created.len(),
            "Record change evaluated"
        );
        Ok(created)
    }

    /// Consume a stream of record changes until cancelled or the sender
    /// goes away. Created instances are reported on `created` when given.
    pub async fn consume(
        &self,
        mut rx: mpsc::Receiver<RecordChange>,
        created: Option<mpsc::Sender<InstanceId>>,
        cancel: CancellationToken,
    ) {
        info!("Record-change consumer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Record-change consumer cancelled");
                    break;
                }
                change = rx.recv() => {
                    let Some(change) = change else {
                        debug!("Record-change stream closed");
                        break;
                    };
                    match self.on_record_change(&change) {
                        Ok(ids) => {
                            if let Some(tx) = &created {
                                for id in ids {
                                    let _ = tx.send(id).await;
                                }
                            }
                        }
                        Err(e) => {
                            error!(entity = %change.entity, record_id = %change.record_id, error = %e, "Record change failed");
                        }
                    }
                }
            }
        }
    }
}

fn rule_matches(rule: &TriggerRule, change: &RecordChange, document: &Value) -> bool {
    let TriggerRule::OnRecordChange {
        entity,
        events,
        conditions,
    } = rule
    else {
        return false;
    };
    if entity != &change.entity {
        return false;
    }
    if !events.is_empty() && !events.contains(&change.event) {
        return false;
    }
    conditions.iter().all(|c| condition_matches(c, document))
}

fn condition_matches(condition: &FieldCondition, document: &Value) -> bool {
    let Some(doc) = document.as_object() else {
        return false;
    };
    match condition.op {
        CompareOp::Exists => {
            let want = condition.value.as_bool().unwrap_or(true);
            let present = lookup(doc, &condition.field).is_some_and(|v| !v.is_null());
            present == want
        }
        CompareOp::Changed => {
            let path = condition
                .field
                .strip_prefix("after.")
                .or_else(|| condition.field.strip_prefix("before."))
                .unwrap_or(&condition.field);
            let before = doc.get("before").and_then(Value::as_object);
            let after = doc.get("after").and_then(Value::as_object);
            let old = before.and_then(|b| lookup(b, path));
            let new = after.and_then(|a| lookup(a, path));
            old != new
        }
        op => match lookup(doc, &condition.field) {
            Some(left) => compare(op, left, &condition.value),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::types::{
        ActionConfig, AgentPermission, ChangeKind, StepDefinition, StepKind, TemplateDefinition,
    };

    fn setup() -> (TriggerEvaluator, Arc<SqliteStore>, Arc<AgentPermissionGate>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let bus = Arc::new(EventBus::default());
        let gate = Arc::new(AgentPermissionGate::new(store.clone(), bus.clone()));
        (
            TriggerEvaluator::new(store.clone(), gate.clone(), bus, 3600),
            store,
            gate,
        )
    }

    fn steps() -> Vec<StepDefinition> {
        vec![StepDefinition::new(
            "record",
            StepKind::Action(ActionConfig {
                operation: "set".into(),
                params: json!({"ok": true}),
                secret: None,
                output_key: None,
            }),
        )]
    }

    fn on_invoice(conditions: Vec<FieldCondition>) -> TemplateDefinition {
        TemplateDefinition::new("invoice-review", steps()).with_trigger(TriggerRule::OnRecordChange {
            entity: "invoice".into(),
            events: vec![ChangeKind::Created, ChangeKind::Updated],
            conditions,
        })
    }

    fn change(event: ChangeKind, before: Option<Value>, after: Option<Value>) -> RecordChange {
        RecordChange {
            tenant: "default".into(),
            entity: "invoice".into(),
            record_id: "inv-1".into(),
            event,
            before,
            after,
        }
    }

    #[test]
    fn start_instance_checks_template_state() {
        let (trigger, store, _) = setup();
        let tpl = store
            .publish_template(&TemplateDefinition::new("manual", steps()), Utc::now())
            .unwrap();

        let id = trigger
            .start_instance(&tpl.id, json!({"amount": 10}), Actor::user("alice"))
            .unwrap();
        let inst = store.get_instance(&id).unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Pending);
        assert_eq!(inst.context.get("amount"), Some(&json!(10)));
        assert!(inst.deadline.is_some());
        assert_eq!(store.list_steps(&id).unwrap().len(), 1);

        store.set_template_active(&tpl.id, false).unwrap();
        assert!(matches!(
            trigger.start_instance(&tpl.id, json!({}), Actor::user("alice")),
            Err(TrellisError::TemplateInactive(_))
        ));
        assert!(matches!(
            trigger.start_instance(&TemplateId::from_string("tpl_nope"), json!({}), Actor::user("alice")),
            Err(TrellisError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn agent_initiation_needs_a_grant() {
        let (trigger, store, gate) = setup();
        let tpl = store
            .publish_template(&TemplateDefinition::new("manual", steps()), Utc::now())
            .unwrap();

        let err = trigger
            .start_instance(&tpl.id, json!({}), Actor::agent("bot"))
            .unwrap_err();
        assert!(matches!(err, TrellisError::PermissionDenied(_)));
        assert!(store.list_instances(&Default::default()).unwrap().is_empty());

        gate.grant(AgentPermission::new("bot", &tpl.id).initiate()).unwrap();
        assert!(trigger
            .start_instance(&tpl.id, json!({}), Actor::agent("bot"))
            .is_ok());
    }

    #[test]
    fn record_change_matches_entity_events_and_conditions() {
        let (trigger, store, _) = setup();
        store
            .publish_template(
                &on_invoice(vec![FieldCondition {
                    field: "after.amount".into(),
                    op: CompareOp::Gt,
                    value: json!(1000),
                }]),
                Utc::now(),
            )
            .unwrap();

        let big = change(ChangeKind::Created, None, Some(json!({"amount": 5000})));
        let ids = trigger.on_record_change(&big).unwrap();
        assert_eq!(ids.len(), 1);
        let inst = store.get_instance(&ids[0]).unwrap().unwrap();
        assert_eq!(inst.initiator, Actor::system(RECORD_CHANGE_INITIATOR));
        assert_eq!(inst.context.lookup("after.amount"), Some(&json!(5000)));

        let small = change(ChangeKind::Created, None, Some(json!({"amount": 10})));
        assert!(trigger.on_record_change(&small).unwrap().is_empty());

        let deleted = change(ChangeKind::Deleted, Some(json!({"amount": 5000})), None);
        assert!(trigger.on_record_change(&deleted).unwrap().is_empty());

        let mut other_entity = big.clone();
        other_entity.entity = "order".into();
        assert!(trigger.on_record_change(&other_entity).unwrap().is_empty());
    }

    #[test]
    fn changed_and_exists_conditions() {
        let doc = change(
            ChangeKind::Updated,
            Some(json!({"status": "draft", "amount": 5})),
            Some(json!({"status": "submitted", "amount": 5})),
        )
        .document();

        let changed = |field: &str| FieldCondition {
            field: field.into(),
            op: CompareOp::Changed,
            value: Value::Null,
        };
        assert!(condition_matches(&changed("status"), &doc));
        assert!(condition_matches(&changed("after.status"), &doc));
        assert!(!condition_matches(&changed("amount"), &doc));

        let exists = FieldCondition {
            field: "after.approver".into(),
            op: CompareOp::Exists,
            value: Value::Null,
        };
        assert!(!condition_matches(&exists, &doc));
        let absent = FieldCondition {
            value: json!(false),
            ..exists
        };
        assert!(condition_matches(&absent, &doc));
    }

    #[tokio::test]
    async fn consume_processes_stream_until_closed() {
        let (trigger, store, _) = setup();
        store.publish_template(&on_invoice(vec![]), Utc::now()).unwrap();

        let (tx, rx) = mpsc::channel(8);
        let (created_tx, mut created_rx) = mpsc::channel(8);
        tx.send(change(ChangeKind::Created, None, Some(json!({"amount": 1}))))
            .await
            .unwrap();
        drop(tx);

        trigger
            .consume(rx, Some(created_tx), CancellationToken::new())
            .await;
        assert!(created_rx.recv().await.is_some());
    }
}
