use std::fmt;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::error::Result;
use crate::types::InstanceId;

/// Decrypted template secret. Never printed, serialized or logged.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext for the duration of a call.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Per-invocation context handed to an operation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub instance_id: InstanceId,
    pub step_index: usize,
    pub attempt: u32,
    /// Stable across replays of the same step: `"{instance_id}:{step_index}"`.
    pub idempotency_key: String,
    pub secret: Option<SecretValue>,
}

/// Named business operation invoked by Action steps.
pub trait Operation: Send + Sync + 'static {
    /// Operation name referenced by templates.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Execute with rendered parameters.
    ///
    /// Return `TrellisError::StepFailure { retryable: true, .. }` for
    /// transient failures; the step's retry policy decides whether to retry.
    fn execute(
        &self,
        params: serde_json::Value,
        ctx: OperationContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Timeout in seconds for one invocation.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Rendered notification handed to a delivery sink.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationMessage {
    pub instance_id: InstanceId,
    pub step_name: String,
    pub channel: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
}

/// Notification delivery. Sinks own their retry/backoff; `deliver` only
/// reports whether the message was accepted for delivery.
pub trait NotificationSink: Send + Sync + 'static {
    /// Channel name this sink serves (e.g. "log", "webhook").
    fn channel(&self) -> &str;

    fn deliver(&self, message: NotificationMessage) -> BoxFuture<'_, Result<()>>;
}

/// Outbound request of an External step.
#[derive(Debug, Clone)]
pub struct ExternalRequest {
    pub url: String,
    pub method: String,
    pub body: serde_json::Value,
    /// Where the remote system reports completion. Embeds the token.
    pub callback_url: String,
    pub idempotency_key: String,
    pub bearer: Option<SecretValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExternalResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ExternalResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport used by External steps to reach remote systems.
pub trait ExternalTransport: Send + Sync + 'static {
    fn send(&self, request: ExternalRequest) -> BoxFuture<'_, Result<ExternalResponse>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_value_is_redacted() {
        let secret = SecretValue::new("sk_live_123");
        assert_eq!(format!("{}", secret), "***");
        assert_eq!(format!("{:?}", secret), "SecretValue(***)");
        assert_eq!(secret.expose(), "sk_live_123");
    }

    #[test]
    fn response_success_range() {
        let ok = ExternalResponse { status: 202, body: serde_json::Value::Null };
        let bad = ExternalResponse { status: 500, body: serde_json::Value::Null };
        assert!(ok.is_success());
        assert!(!bad.is_success());
    }
}
