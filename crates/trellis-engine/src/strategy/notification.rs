use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use trellis_core::error::Result;
use trellis_core::traits::NotificationMessage;
use trellis_core::types::{NotificationConfig, StepKind, StepType};

use super::{Resolution, StepContext, StepFailure, StepOutcome, StepStrategy};
use crate::notify::NotificationRouter;
use crate::render::render_str;

/// Renders a message and hands it to the router. Resolves immediately.
pub struct NotificationStrategy {
    router: Arc<NotificationRouter>,
}

impl NotificationStrategy {
    pub fn new(router: Arc<NotificationRouter>) -> Self {
        Self { router }
    }

    fn render(cfg: &NotificationConfig, ctx: &StepContext<'_>) -> Result<NotificationMessage> {
        let data = ctx.context.data();
        Ok(NotificationMessage {
            instance_id: ctx.instance.id.clone(),
            step_name: ctx.step.step_name.clone(),
            channel: render_str(&cfg.channel, data)?,
            target: render_str(&cfg.target, data)?,
            subject: cfg
                .subject
                .as_deref()
                .map(|s| render_str(s, data))
                .transpose()?,
            body: render_str(&cfg.message, data)?,
        })
    }
}

impl StepStrategy for NotificationStrategy {
    fn step_type(&self) -> StepType {
        StepType::Notification
    }

    fn execute<'a>(&'a self, ctx: StepContext<'a>) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            let StepKind::Notification(cfg) = &ctx.step.config_snapshot.kind else {
                return StepOutcome::Failed(StepFailure::fatal("not a notification step"));
            };
            let message = match Self::render(cfg, &ctx) {
                Ok(m) => m,
                Err(e) => return e.into(),
            };
            let output = json!({
                "channel": message.channel,
                "target": message.target,
                "delivered": true,
            });
            match self.router.deliver(message).await {
                Ok(()) => StepOutcome::Resolved(Resolution::output_only(output)),
                Err(e) => e.into(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use trellis_core::traits::NotificationSink;
    use trellis_core::types::StepDefinition;

    use crate::strategy::testing;

    struct Inbox(Arc<Mutex<Vec<NotificationMessage>>>);

    impl NotificationSink for Inbox {
        fn channel(&self) -> &str {
            "inbox"
        }

        fn deliver(&self, message: NotificationMessage) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.0.lock().unwrap().push(message);
                Ok(())
            })
        }
    }

    fn notify(channel: &str) -> StepDefinition {
        StepDefinition::new(
            "tell",
            StepKind::Notification(NotificationConfig {
                channel: channel.into(),
                target: "{{submitter}}".into(),
                subject: Some("Expense {{id}}".into()),
                message: "Your expense of {{amount}} was approved".into(),
            }),
        )
    }

    #[tokio::test]
    async fn renders_and_delivers() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut router = NotificationRouter::new();
        router.register(Arc::new(Inbox(sent.clone())));
        let strategy = NotificationStrategy::new(Arc::new(router));

        let instance = testing::instance(json!({"submitter": "bob", "id": "e-1", "amount": 42}));
        let step = testing::step(notify("inbox"));
        match strategy.execute(testing::ctx(&instance, &step)).await {
            StepOutcome::Resolved(r) => {
                assert!(r.context_patch.is_empty());
                assert_eq!(r.output["target"], "bob");
            }
            other => panic!("expected resolution, got {:?}", other),
        }

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].subject.as_deref(), Some("Expense e-1"));
        assert_eq!(sent[0].body, "Your expense of 42 was approved");
    }

    #[tokio::test]
    async fn unknown_channel_fails() {
        let strategy = NotificationStrategy::new(Arc::new(NotificationRouter::new()));
        let instance = testing::instance(json!({"submitter": "bob", "id": "e-1", "amount": 42}));
        let step = testing::step(notify("pager"));
        assert!(matches!(
            strategy.execute(testing::ctx(&instance, &step)).await,
            StepOutcome::Failed(_)
        ));
    }
}
