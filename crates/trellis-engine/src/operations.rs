use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::{Operation, OperationContext};

/// Registry of operations available to Action steps.
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    /// Register an operation, replacing any with the same name.
    pub fn register(&mut self, operation: impl Operation) {
        let name = operation.name().to_string();
        self.operations.insert(name, Arc::new(operation));
    }

    pub fn register_arc(&mut self, operation: Arc<dyn Operation>) {
        self.operations
            .insert(operation.name().to_string(), operation);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.operations.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Execute an operation by name under its timeout.
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        ctx: OperationContext,
    ) -> Result<Value> {
        let operation = self
            .get(name)
            .ok_or_else(|| TrellisError::OperationNotFound(name.to_string()))?;

        let timeout = Duration::from_secs(operation.timeout_secs());
        debug!(operation = name, key = %ctx.idempotency_key, "Executing operation");

        match tokio::time::timeout(timeout, operation.execute(params, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(TrellisError::OperationTimeout {
                operation: name.to_string(),
                timeout_secs: operation.timeout_secs(),
            }),
        }
    }

    /// Create a registry with the built-in operations registered.
    pub fn with_builtins(http_timeout_secs: u64) -> Self {
        let mut registry = Self::new();
        registry.register(SetOperation);
        registry.register(HttpRequestOperation::new(http_timeout_secs));
        registry
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Echoes its parameters; used to copy rendered values into context.
pub struct SetOperation;

impl Operation for SetOperation {
    fn name(&self) -> &str {
        "set"
    }

    fn description(&self) -> &str {
        "Return the rendered parameters unchanged."
    }

    fn execute(&self, params: Value, _ctx: OperationContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move { Ok(params) })
    }
}

/// Generic HTTP call: `{url, method?, headers?, body?}` → `{status, body}`.
///
/// The step secret, if any, is sent as a bearer token. The idempotency key
/// is sent as `Idempotency-Key` so replays are safe on supporting servers.
pub struct HttpRequestOperation {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpRequestOperation {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout_secs,
        }
    }
}

impl Operation for HttpRequestOperation {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Perform an HTTP request and return its status and JSON body."
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn execute(&self, params: Value, ctx: OperationContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let url = params
                .get("url")
                .and_then(|v| v.as_str())
                .ok_or_else(|| TrellisError::StepFailure {
                    step: "http_request".into(),
                    message: "missing 'url' parameter".into(),
                    retryable: false,
                })?;
            let method = params
                .get("method")
                .and_then(|v| v.as_str())
                .unwrap_or("POST")
                .to_uppercase();
            let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| {
                TrellisError::StepFailure {
                    step: "http_request".into(),
                    message: format!("invalid method: {}", e),
                    retryable: false,
                }
            })?;

            let mut req = self
                .client
                .request(method, url)
                .header("Idempotency-Key", &ctx.idempotency_key);
            if let Some(headers) = params.get("headers").and_then(|v| v.as_object()) {
                for (k, v) in headers {
                    if let Some(v) = v.as_str() {
                        req = req.header(k.as_str(), v);
                    }
                }
            }
            if let Some(secret) = &ctx.secret {
                req = req.bearer_auth(secret.expose());
            }
            if let Some(body) = params.get("body") {
                req = req.json(body);
            }

            let resp = req.send().await.map_err(|e| TrellisError::StepFailure {
                step: "http_request".into(),
                message: e.to_string(),
                retryable: true,
            })?;
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

            if !status.is_success() {
                return Err(TrellisError::StepFailure {
                    step: "http_request".into(),
                    message: format!("HTTP {}", status.as_u16()),
                    retryable: status.is_server_error() || status.as_u16() == 429,
                });
            }
            Ok(json!({ "status": status.as_u16(), "body": body }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::types::InstanceId;

    struct SlowOperation;

    impl Operation for SlowOperation {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn timeout_secs(&self) -> u64 {
            1
        }
        fn execute(&self, _params: Value, _ctx: OperationContext) -> BoxFuture<'_, Result<Value>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            })
        }
    }

    fn ctx() -> OperationContext {
        let id = InstanceId::from_string("wfi_test");
        OperationContext {
            idempotency_key: format!("{}:0", id),
            instance_id: id,
            step_index: 0,
            attempt: 1,
            secret: None,
        }
    }

    #[tokio::test]
    async fn set_echoes_params() {
        let registry = OperationRegistry::with_builtins(10);
        let out = registry
            .execute("set", json!({"x": 1}), ctx())
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 1}));
        assert_eq!(registry.list(), vec!["http_request", "set"]);
    }

    #[tokio::test]
    async fn unknown_operation() {
        let registry = OperationRegistry::new();
        let err = registry.execute("nope", Value::Null, ctx()).await.unwrap_err();
        assert!(matches!(err, TrellisError::OperationNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn operation_timeout() {
        let mut registry = OperationRegistry::new();
        registry.register(SlowOperation);
        let err = registry.execute("slow", Value::Null, ctx()).await.unwrap_err();
        assert!(matches!(err, TrellisError::OperationTimeout { timeout_secs: 1, .. }));
    }

    #[tokio::test]
    async fn http_request_requires_url() {
        let op = HttpRequestOperation::new(5);
        let err = op.execute(json!({}), ctx()).await.unwrap_err();
        assert!(matches!(err, TrellisError::StepFailure { retryable: false, .. }));
    }
}
