use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use trellis_core::config::AppConfig;
use trellis_core::error::TrellisError;
use trellis_core::types::{
    Actor, Decision, InstanceStatus, NotificationConfig, StepDefinition, StepKind, StepStatus,
    TemplateDefinition,
};
use trellis_engine::{EngineBuilder, WorkflowEngine};
use trellis_store::SqliteStore;
use trellis_test_utils::{
    action_step, approval_step, approval_template, expense_template, external_template,
    invoice_change, invoice_trigger_template, BlockingOperation, RecordingOperation,
    RecordingSink, RecordingTransport,
};

fn builder() -> EngineBuilder {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    WorkflowEngine::builder(AppConfig::default(), store)
}

#[tokio::test]
async fn small_expense_skips_approval_and_transfers() {
    let transfer = RecordingOperation::new("execute_transfer");
    let calls = transfer.calls();
    let engine = builder().operation(transfer).build().unwrap();
    let template = engine.publish_template(&expense_template()).unwrap();

    let id = engine
        .start_instance(
            &template.id,
            json!({"amount": 500, "vendor": "acme"}),
            Actor::user("alice"),
        )
        .unwrap();
    assert_eq!(engine.drive(&id).await.unwrap(), InstanceStatus::Completed);

    let steps = engine.list_steps(&id).unwrap();
    let indices: Vec<usize> = steps.iter().map(|s| s.step_index).collect();
    assert_eq!(indices, vec![0, 2], "no approval step was created");

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].params, json!({"amount": 500, "vendor": "acme"}));
    assert_eq!(calls[0].idempotency_key, format!("{}:2", id));
}

#[tokio::test]
async fn large_expense_waits_for_manager() {
    let transfer = RecordingOperation::new("execute_transfer");
    let calls = transfer.calls();
    let engine = builder().operation(transfer).build().unwrap();
    let template = engine.publish_template(&expense_template()).unwrap();

    let id = engine
        .start_instance(
            &template.id,
            json!({"amount": 5000, "vendor": "acme"}),
            Actor::user("alice"),
        )
        .unwrap();
    assert_eq!(engine.drive(&id).await.unwrap(), InstanceStatus::Paused);
    assert!(calls.lock().unwrap().is_empty());

    let status = engine
        .decide(&id, 1, &Actor::user("manager"), Decision::Approve, None, None)
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Completed);
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unanswered_approval_times_out_exactly_once() {
    let engine = builder().build().unwrap();
    let template = engine
        .publish_template(&approval_template("review", &["manager"]))
        .unwrap();
    let id = engine
        .start_instance(&template.id, json!({}), Actor::user("alice"))
        .unwrap();
    assert_eq!(engine.drive(&id).await.unwrap(), InstanceStatus::Paused);

    let later = Utc::now() + Duration::hours(25);
    let first = engine.sweeper().sweep_once(later).unwrap();
    assert_eq!(first.timed_out_steps, vec![(id.clone(), 0)]);
    assert_eq!(first.timed_out_instances, vec![id.clone()]);
    assert!(engine.sweeper().sweep_once(later).unwrap().is_empty());

    let inst = engine.get_instance(&id).unwrap();
    assert_eq!(inst.status, InstanceStatus::TimedOut);
    assert_eq!(
        engine.list_steps(&id).unwrap()[0].status,
        StepStatus::TimedOut
    );

    let late = engine
        .decide(&id, 0, &Actor::user("manager"), Decision::Approve, None, None)
        .await;
    assert!(matches!(late, Err(TrellisError::StepNotWaiting { .. })));
}

#[tokio::test]
async fn cancel_mid_action_waits_for_the_call_to_return() {
    let slow = BlockingOperation::new("slow_transfer");
    let started = slow.started.clone();
    let release = slow.release.clone();
    let engine = Arc::new(builder().operation(slow).build().unwrap());

    let template = engine
        .publish_template(&TemplateDefinition::new(
            "payout",
            vec![
                action_step("transfer", "slow_transfer", json!({"amount": 10})),
                action_step("receipt", "set", json!({"sent": true})),
            ],
        ))
        .unwrap();
    let id = engine
        .start_instance(&template.id, json!({}), Actor::user("alice"))
        .unwrap();

    let driver = {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move { engine.drive(&id).await })
    };
    started.notified().await;

    // Advisory while the action is in flight
    assert_eq!(engine.cancel(&id).unwrap(), InstanceStatus::Running);
    let inst = engine.get_instance(&id).unwrap();
    assert_eq!(inst.status, InstanceStatus::Running);
    assert!(inst.cancel_requested);

    release.notify_one();
    let status = driver.await.unwrap().unwrap();
    assert_eq!(status, InstanceStatus::Cancelled);

    let steps = engine.list_steps(&id).unwrap();
    assert_eq!(steps.len(), 1, "the next step never started");
    assert_eq!(steps[0].status, StepStatus::Completed);
}

#[tokio::test]
async fn instance_deadline_mid_action_closes_the_running_step() {
    let slow = BlockingOperation::new("slow_transfer");
    let started = slow.started.clone();
    let release = slow.release.clone();
    let engine = Arc::new(builder().operation(slow).build().unwrap());

    let template = engine
        .publish_template(&TemplateDefinition::new(
            "payout",
            vec![
                action_step("transfer", "slow_transfer", json!({"amount": 10})),
                action_step("receipt", "set", json!({"sent": true})),
            ],
        ))
        .unwrap();
    let id = engine
        .start_instance(&template.id, json!({}), Actor::user("alice"))
        .unwrap();

    let driver = {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move { engine.drive(&id).await })
    };
    started.notified().await;

    // Past the default instance deadline while the action is in flight
    let report = engine
        .sweeper()
        .sweep_once(Utc::now() + Duration::days(8))
        .unwrap();
    assert_eq!(report.timed_out_instances, vec![id.clone()]);

    release.notify_one();
    assert_eq!(driver.await.unwrap().unwrap(), InstanceStatus::TimedOut);

    let steps = engine.list_steps(&id).unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::TimedOut);
    assert!(steps[0].completed_at.is_some());
    assert_eq!(
        engine.get_instance(&id).unwrap().status,
        InstanceStatus::TimedOut
    );
}

#[tokio::test]
async fn record_change_starts_matching_templates_only() {
    let engine = builder().build().unwrap();
    engine
        .publish_template(&invoice_trigger_template("acme"))
        .unwrap();

    let unchanged = engine
        .on_record_change(&invoice_change("acme", "approved", "approved"))
        .unwrap();
    assert!(unchanged.is_empty());
    let other_tenant = engine
        .on_record_change(&invoice_change("globex", "draft", "approved"))
        .unwrap();
    assert!(other_tenant.is_empty());

    let created = engine
        .on_record_change(&invoice_change("acme", "draft", "approved"))
        .unwrap();
    assert_eq!(created.len(), 1);
    let id = &created[0];
    assert_eq!(engine.drive(id).await.unwrap(), InstanceStatus::Completed);
    let inst = engine.get_instance(id).unwrap();
    assert_eq!(inst.initiator, Actor::system("record-change"));
    assert_eq!(inst.context.lookup("record.invoice"), Some(&json!("inv_42")));
}

#[tokio::test]
async fn external_step_resumes_on_single_use_callback() {
    let transport = RecordingTransport::accepting();
    let engine = builder().transport(transport.clone()).build().unwrap();
    let template = engine
        .publish_template(&external_template("kyc", "https://kyc.example.com/checks"))
        .unwrap();
    let id = engine
        .start_instance(&template.id, json!({"subject": "alice"}), Actor::user("ops"))
        .unwrap();
    assert_eq!(engine.drive(&id).await.unwrap(), InstanceStatus::Paused);

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, json!({"subject": "alice"}));
    assert_eq!(requests[0].idempotency_key, format!("{}:0", id));

    // Only the hash of the token is persisted
    let token = transport.last_token().unwrap();
    let step = &engine.list_steps(&id).unwrap()[0];
    assert_eq!(step.status, StepStatus::WaitingExternal);
    assert_ne!(step.callback_token_hash.as_deref(), Some(token.as_str()));

    let status = engine
        .callback(&token, json!({"status": "ok", "data": {"verified": true}}))
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Completed);
    assert_eq!(
        engine.get_instance(&id).unwrap().context.lookup("remote.verified"),
        Some(&json!(true))
    );

    let replay = engine.callback(&token, json!({"status": "ok"})).await;
    assert!(matches!(replay, Err(TrellisError::AlreadyConsumed)));
}

#[tokio::test]
async fn notification_renders_from_context() {
    let sink = RecordingSink::new("chat");
    let engine = builder().notification_sink(sink.clone()).build().unwrap();
    let template = engine
        .publish_template(&TemplateDefinition::new(
            "notify-approved",
            vec![
                approval_step("review", &["manager"]),
                StepDefinition::new(
                    "announce",
                    StepKind::Notification(NotificationConfig {
                        channel: "chat".into(),
                        target: "#finance".into(),
                        subject: None,
                        message: "Expense of {{amount}} approved by {{review.decided_by}}".into(),
                    }),
                ),
            ],
        ))
        .unwrap();
    let id = engine
        .start_instance(&template.id, json!({"amount": 2500}), Actor::user("alice"))
        .unwrap();
    engine.drive(&id).await.unwrap();
    engine
        .decide(&id, 0, &Actor::user("manager"), Decision::Approve, None, None)
        .await
        .unwrap();

    let messages = sink.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].target, "#finance");
    assert_eq!(messages[0].body, "Expense of 2500 approved by user:manager");
}
