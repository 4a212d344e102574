use std::path::Path;

use serde_json::{json, Value};
use tempfile::TempDir;

use trellis_core::config::AppConfig;
use trellis_core::types::{
    ActionConfig, ApprovalConfig, Branch, ChangeKind, CompareOp, ConditionConfig, ExternalConfig,
    FieldCondition, RecordChange, StepDefinition, StepKind, TemplateDefinition, TriggerRule,
};

/// Expense flow: large amounts need a manager's approval, then the
/// transfer runs. Amounts up to 1000 skip straight to the transfer.
pub fn expense_template() -> TemplateDefinition {
    TemplateDefinition::new(
        "expense-approval",
        vec![
            StepDefinition::new(
                "check-amount",
                StepKind::Condition(ConditionConfig {
                    expression: "amount > 1000".into(),
                    on_true: Branch::Continue,
                    on_false: Branch::SkipTo(2),
                }),
            ),
            approval_step("manager-review", &["manager"]),
            action_step("transfer", "execute_transfer", json!({
                "amount": "{{amount}}",
                "vendor": "{{vendor}}",
            })),
        ],
    )
}

/// Single approval step with a 24h deadline.
pub fn approval_template(name: &str, approvers: &[&str]) -> TemplateDefinition {
    TemplateDefinition::new(
        name,
        vec![approval_step("review", approvers).with_timeout(24 * 3600)],
    )
}

/// One External step that posts to `url` and waits for the callback.
pub fn external_template(name: &str, url: &str) -> TemplateDefinition {
    TemplateDefinition::new(
        name,
        vec![StepDefinition::new(
            "remote-check",
            StepKind::External(ExternalConfig {
                url: url.into(),
                method: "POST".into(),
                body: json!({ "subject": "{{subject}}" }),
                secret: None,
                output_key: Some("remote".into()),
            }),
        )],
    )
}

/// A template started whenever an invoice in `tenant` moves to `approved`.
pub fn invoice_trigger_template(tenant: &str) -> TemplateDefinition {
    let mut def = TemplateDefinition::new(
        "invoice-approved",
        vec![action_step("record", "set", json!({ "invoice": "{{record_id}}" }))],
    )
    .with_trigger(TriggerRule::OnRecordChange {
        entity: "invoice".into(),
        events: vec![ChangeKind::Updated],
        conditions: vec![
            FieldCondition {
                field: "after.status".into(),
                op: CompareOp::Changed,
                value: Value::Null,
            },
            FieldCondition {
                field: "after.status".into(),
                op: CompareOp::Eq,
                value: json!("approved"),
            },
        ],
    });
    def.tenant = tenant.into();
    def
}

pub fn approval_step(name: &str, approvers: &[&str]) -> StepDefinition {
    StepDefinition::new(
        name,
        StepKind::Approval(ApprovalConfig {
            users: approvers.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }),
    )
}

pub fn action_step(name: &str, operation: &str, params: Value) -> StepDefinition {
    StepDefinition::new(
        name,
        StepKind::Action(ActionConfig {
            operation: operation.into(),
            params,
            secret: None,
            output_key: None,
        }),
    )
}

/// An invoice update from `before_status` to `after_status`.
pub fn invoice_change(tenant: &str, before_status: &str, after_status: &str) -> RecordChange {
    RecordChange {
        tenant: tenant.into(),
        entity: "invoice".into(),
        record_id: "inv_42".into(),
        event: ChangeKind::Updated,
        before: Some(json!({ "id": "inv_42", "status": before_status, "total": 900 })),
        after: Some(json!({ "id": "inv_42", "status": after_status, "total": 900 })),
    }
}

/// Default config with the database and audit log inside `dir`.
pub fn config_in(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.database = dir.join("trellis.db").display().to_string();
    config.audit.log_dir = dir.join("audit").display().to_string();
    config.engine.poll_interval_ms = 20;
    config
}

/// A temp directory plus a config rooted in it. Keep the dir alive for the
/// duration of the test.
pub fn temp_config() -> (TempDir, AppConfig) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = config_in(dir.path());
    (dir, config)
}

/// Sample `trellis.toml` exercising every section.
pub fn sample_config_toml() -> &'static str {
    r#"
[engine]
database = "/tmp/trellis-test.db"
worker_id = "worker-a"
workers = 8
poll_interval_ms = 250
default_approval_timeout_secs = 3600
callback_base_url = "https://trellis.example.com"

[sweeper]
enabled = true
interval_secs = 15

[gateway]
bind = "0.0.0.0:9000"

[[gateway.api_keys]]
name = "ops"
key = "tk_ops"
role = "operator"
roles = ["finance"]

[[gateway.api_keys]]
name = "expense-bot"
key = "tk_bot"
role = "operator"
agent_id = "expense-bot"

[secrets]
master_key = "${TRELLIS_TEST_MASTER_KEY}"

[notifications]
webhook_timeout_secs = 5
max_retries = 2

[audit]
enabled = false
"#
}
