use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use trellis_core::traits::OperationContext;
use trellis_core::types::{StepKind, StepType};

use super::{Resolution, StepContext, StepFailure, StepOutcome, StepStrategy};
use crate::operations::OperationRegistry;
use crate::render::render_value;
use crate::secrets::SecretResolver;

/// Invokes a registered operation with parameters rendered from context.
pub struct ActionStrategy {
    registry: Arc<OperationRegistry>,
    secrets: Arc<SecretResolver>,
}

impl ActionStrategy {
    pub fn new(registry: Arc<OperationRegistry>, secrets: Arc<SecretResolver>) -> Self {
        Self { registry, secrets }
    }
}

/// Stable across replays of the same step.
pub(crate) fn idempotency_key(ctx: &StepContext<'_>) -> String {
    format!("{}:{}", ctx.instance.id, ctx.step.step_index)
}

impl StepStrategy for ActionStrategy {
    fn step_type(&self) -> StepType {
        StepType::Action
    }

    fn execute<'a>(&'a self, ctx: StepContext<'a>) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            let StepKind::Action(cfg) = &ctx.step.config_snapshot.kind else {
                return StepOutcome::Failed(StepFailure::fatal("not an action step"));
            };

            let params = match render_value(&cfg.params, ctx.context.data()) {
                Ok(p) => p,
                Err(e) => return e.into(),
            };
            let secret = match &cfg.secret {
                Some(name) => match self.secrets.resolve(&ctx.instance.template_id, name) {
                    Ok(s) => Some(s),
                    Err(e) => return e.into(),
                },
                None => None,
            };

            let op_ctx = OperationContext {
                instance_id: ctx.instance.id.clone(),
                step_index: ctx.step.step_index,
                attempt: ctx.step.attempt,
                idempotency_key: idempotency_key(&ctx),
                secret,
            };
            debug!(
                instance_id = %ctx.instance.id,
                step = %ctx.step.step_name,
                operation = %cfg.operation,
                attempt = ctx.step.attempt,
                "Invoking operation"
            );

            match self.registry.execute(&cfg.operation, params, op_ctx).await {
                Ok(output) => StepOutcome::Resolved(Resolution::merged(
                    ctx.output_key(cfg.output_key.as_ref()),
                    output,
                )),
                Err(e) => e.into(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::{json, Value};
    use trellis_core::error::{ErrorKind, Result, TrellisError};
    use trellis_core::traits::Operation;
    use trellis_core::types::{ActionConfig, StepDefinition, TemplateDefinition};
    use trellis_store::SqliteStore;

    use crate::strategy::testing;

    /// Records the context it was called with.
    struct Capture {
        seen: Arc<Mutex<Vec<(Value, OperationContext)>>>,
    }

    impl Operation for Capture {
        fn name(&self) -> &str {
            "capture"
        }

        fn description(&self) -> &str {
            "records calls"
        }

        fn execute(&self, params: Value, ctx: OperationContext) -> BoxFuture<'_, Result<Value>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push((params, ctx));
                Ok(json!({"transfer_id": "tx_1"}))
            })
        }
    }

    struct Flaky;

    impl Operation for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "always fails transiently"
        }

        fn execute(&self, _params: Value, _ctx: OperationContext) -> BoxFuture<'_, Result<Value>> {
            Box::pin(async {
                Err(TrellisError::StepFailure {
                    step: "flaky".into(),
                    message: "upstream busy".into(),
                    retryable: true,
                })
            })
        }
    }

    fn action(operation: &str, secret: Option<&str>, output_key: Option<&str>) -> StepDefinition {
        StepDefinition::new(
            "pay",
            StepKind::Action(ActionConfig {
                operation: operation.into(),
                params: json!({"amount": "{{amount}}", "memo": "expense {{id}}"}),
                secret: secret.map(String::from),
                output_key: output_key.map(String::from),
            }),
        )
    }

    fn setup() -> (
        ActionStrategy,
        Arc<Mutex<Vec<(Value, OperationContext)>>>,
        Arc<SecretResolver>,
        Arc<SqliteStore>,
    ) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let secrets = Arc::new(SecretResolver::new(store.clone(), Some([7u8; 32])));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::new();
        registry.register(Capture { seen: seen.clone() });
        registry.register(Flaky);
        (
            ActionStrategy::new(Arc::new(registry), secrets.clone()),
            seen,
            secrets,
            store,
        )
    }

    #[tokio::test]
    async fn renders_params_and_merges_under_output_key() {
        let (strategy, seen, _, _) = setup();
        let instance = testing::instance(json!({"amount": 250, "id": "e-9"}));
        let step = testing::step(action("capture", None, Some("transfer")));

        match strategy.execute(testing::ctx(&instance, &step)).await {
            StepOutcome::Resolved(r) => {
                assert_eq!(r.context_patch["transfer"]["transfer_id"], "tx_1");
            }
            other => panic!("expected resolution, got {:?}", other),
        }

        let calls = seen.lock().unwrap();
        assert_eq!(calls[0].0, json!({"amount": 250, "memo": "expense e-9"}));
        assert_eq!(calls[0].1.idempotency_key, "wfi_test:0");
        assert!(calls[0].1.secret.is_none());
    }

    #[tokio::test]
    async fn passes_decrypted_secret() {
        let (strategy, seen, secrets, store) = setup();
        let tpl = store
            .publish_template(
                &TemplateDefinition::new("pay", vec![action("capture", Some("api"), None)]),
                chrono::Utc::now(),
            )
            .unwrap();
        secrets.store_secret(&tpl.id, "api", "s3cret").unwrap();

        let mut instance = testing::instance(json!({"amount": 1, "id": "x"}));
        instance.template_id = tpl.id;
        let step = testing::step(action("capture", Some("api"), None));
        assert!(matches!(
            strategy.execute(testing::ctx(&instance, &step)).await,
            StepOutcome::Resolved(_)
        ));
        let calls = seen.lock().unwrap();
        assert_eq!(calls[0].1.secret.as_ref().unwrap().expose(), "s3cret");
    }

    #[tokio::test]
    async fn failures_carry_retryability() {
        let (strategy, _, _, _) = setup();
        let instance = testing::instance(json!({"amount": 1, "id": "x"}));

        let step = testing::step(action("flaky", None, None));
        match strategy.execute(testing::ctx(&instance, &step)).await {
            StepOutcome::Failed(f) => assert!(f.retryable),
            other => panic!("expected failure, got {:?}", other),
        }

        let step = testing::step(action("missing", None, None));
        match strategy.execute(testing::ctx(&instance, &step)).await {
            StepOutcome::Failed(f) => {
                assert!(!f.retryable);
                assert_eq!(f.kind, ErrorKind::NotFound);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_placeholder_fails_before_invoking() {
        let (strategy, seen, _, _) = setup();
        let instance = testing::instance(json!({"id": "x"}));
        let step = testing::step(action("capture", None, None));
        assert!(matches!(
            strategy.execute(testing::ctx(&instance, &step)).await,
            StepOutcome::Failed(_)
        ));
        assert!(seen.lock().unwrap().is_empty());
    }
}
