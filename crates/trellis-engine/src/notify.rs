use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use trellis_core::config::NotificationsConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::{NotificationMessage, NotificationSink};

use crate::retry::backoff_delay;

/// Routes notifications to the sink registered for their channel.
pub struct NotificationRouter {
    sinks: HashMap<String, Arc<dyn NotificationSink>>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self {
            sinks: HashMap::new(),
        }
    }

    /// Router with the built-in `log` and `webhook` sinks.
    pub fn with_builtins(config: &NotificationsConfig) -> Self {
        let mut router = Self::new();
        router.register(Arc::new(LogNotifier));
        router.register(Arc::new(WebhookNotifier::new(config.clone())));
        router
    }

    pub fn register(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.insert(sink.channel().to_string(), sink);
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.sinks.contains_key(channel)
    }

    pub async fn deliver(&self, message: NotificationMessage) -> Result<()> {
        let sink = self.sinks.get(&message.channel).ok_or_else(|| {
            TrellisError::Notification(format!("no sink for channel '{}'", message.channel))
        })?;
        sink.deliver(message).await
    }
}

impl Default for NotificationRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes notifications to the tracing log.
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn channel(&self) -> &str {
        "log"
    }

    fn deliver(&self, message: NotificationMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!(
                instance_id = %message.instance_id,
                step = %message.step_name,
                recipient = %message.target,
                subject = message.subject.as_deref().unwrap_or(""),
                "{}",
                message.body
            );
            Ok(())
        })
    }
}

/// POSTs the notification as JSON to the target URL.
///
/// Delivery happens in a background task with its own bounded retry, so a
/// slow or failing receiver never holds up the workflow.
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: NotificationsConfig,
}

impl WebhookNotifier {
    pub fn new(config: NotificationsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.webhook_timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }
}

impl NotificationSink for WebhookNotifier {
    fn channel(&self) -> &str {
        "webhook"
    }

    fn deliver(&self, message: NotificationMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !message.target.starts_with("http://") && !message.target.starts_with("https://") {
                return Err(TrellisError::Notification(format!(
                    "webhook target is not an http(s) URL: {}",
                    message.target
                )));
            }
            let client = self.client.clone();
            let max_retries = self.config.max_retries;
            let initial_backoff_ms = self.config.initial_backoff_ms;

            tokio::spawn(async move {
                for attempt in 0..=max_retries {
                    match client.post(&message.target).json(&message).send().await {
                        Ok(resp) if resp.status().is_success() => {
                            info!(url = %message.target, "Webhook notification delivered");
                            return;
                        }
                        Ok(resp) => {
                            warn!(
                                url = %message.target,
                                status = resp.status().as_u16(),
                                attempt,
                                "Webhook notification rejected"
                            );
                        }
                        Err(e) => {
                            warn!(url = %message.target, error = %e, attempt, "Webhook notification failed");
                        }
                    }
                    if attempt < max_retries {
                        tokio::time::sleep(backoff_delay(attempt, initial_backoff_ms, 60_000)).await;
                    }
                }
                warn!(url = %message.target, "Webhook notification dropped after retries");
            });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::types::InstanceId;

    fn message(channel: &str, target: &str) -> NotificationMessage {
        NotificationMessage {
            instance_id: InstanceId::from_string("wfi_1"),
            step_name: "notify".into(),
            channel: channel.into(),
            target: target.into(),
            subject: Some("Approved".into()),
            body: "Your expense was approved".into(),
        }
    }

    #[tokio::test]
    async fn routes_by_channel() {
        let router = NotificationRouter::with_builtins(&NotificationsConfig::default());
        assert!(router.has_channel("log"));
        assert!(router.has_channel("webhook"));
        router.deliver(message("log", "ops")).await.unwrap();
        let err = router.deliver(message("sms", "+100")).await.unwrap_err();
        assert!(matches!(err, TrellisError::Notification(_)));
    }

    #[tokio::test]
    async fn webhook_rejects_non_http_target() {
        let sink = WebhookNotifier::new(NotificationsConfig::default());
        assert!(sink.deliver(message("webhook", "ops@example.com")).await.is_err());
    }
}
