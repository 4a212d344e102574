use futures::future::BoxFuture;
use serde_json::{json, Map};

use trellis_core::types::{StepKind, StepType};

use super::{Resolution, StepContext, StepFailure, StepOutcome, StepStrategy};
use crate::expr::Expression;

/// Evaluates a boolean expression and picks a branch. Never suspends.
pub struct ConditionStrategy;

impl StepStrategy for ConditionStrategy {
    fn step_type(&self) -> StepType {
        StepType::Condition
    }

    fn execute<'a>(&'a self, ctx: StepContext<'a>) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            let StepKind::Condition(cfg) = &ctx.step.config_snapshot.kind else {
                return StepOutcome::Failed(StepFailure::fatal("not a condition step"));
            };
            let expression = match Expression::parse(&cfg.expression) {
                Ok(e) => e,
                Err(e) => return e.into(),
            };

            let result = expression.evaluate(ctx.context.data());
            let branch = if result { cfg.on_true } else { cfg.on_false };
            StepOutcome::Resolved(Resolution {
                output: json!({ "result": result, "branch": branch }),
                context_patch: Map::new(),
                branch,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use trellis_core::types::{Branch, ConditionConfig, StepDefinition};

    use crate::strategy::testing;

    fn condition(expression: &str) -> StepDefinition {
        StepDefinition::new(
            "check",
            StepKind::Condition(ConditionConfig {
                expression: expression.into(),
                on_true: Branch::Continue,
                on_false: Branch::SkipTo(2),
            }),
        )
    }

    async fn run(expression: &str, context: Value) -> StepOutcome {
        let instance = testing::instance(context);
        let step = testing::step(condition(expression));
        ConditionStrategy.execute(testing::ctx(&instance, &step)).await
    }

    #[tokio::test]
    async fn picks_branch_and_merges_nothing() {
        match run("amount > 1000", json!({"amount": 500})).await {
            StepOutcome::Resolved(r) => {
                assert_eq!(r.branch, Branch::SkipTo(2));
                assert_eq!(r.output, json!({"result": false, "branch": "skip_to:2"}));
                assert!(r.context_patch.is_empty());
            }
            other => panic!("expected resolution, got {:?}", other),
        }

        match run("amount > 1000", json!({"amount": 5000})).await {
            StepOutcome::Resolved(r) => assert_eq!(r.branch, Branch::Continue),
            other => panic!("expected resolution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn same_inputs_same_branch() {
        let context = json!({"vendor": {"tier": "gold"}, "amount": 10});
        let first = run("vendor.tier == 'gold' && amount < 100", context.clone()).await;
        let second = run("vendor.tier == 'gold' && amount < 100", context).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn malformed_expression_fails_the_step() {
        match run("amount >", json!({})).await {
            StepOutcome::Failed(f) => {
                assert!(!f.retryable);
                assert_eq!(f.kind, trellis_core::error::ErrorKind::Validation);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
