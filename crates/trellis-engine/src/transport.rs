use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::{ExternalRequest, ExternalResponse, ExternalTransport};

/// reqwest-backed transport for External steps.
///
/// The rendered body is sent wrapped as `{"callback_url": ..., "data": ...}`
/// so the remote system knows where to report back.
pub struct HttpExternalTransport {
    client: reqwest::Client,
}

impl HttpExternalTransport {
    pub fn new(timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl ExternalTransport for HttpExternalTransport {
    fn send(&self, request: ExternalRequest) -> BoxFuture<'_, Result<ExternalResponse>> {
        Box::pin(async move {
            let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
                .map_err(|e| TrellisError::Transport(format!("invalid method: {}", e)))?;

            let mut req = self
                .client
                .request(method, &request.url)
                .header("Idempotency-Key", &request.idempotency_key)
                .json(&json!({
                    "callback_url": request.callback_url,
                    "data": request.body,
                }));
            if let Some(secret) = &request.bearer {
                req = req.bearer_auth(secret.expose());
            }

            let resp = req
                .send()
                .await
                .map_err(|e| TrellisError::Transport(e.to_string()))?;
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            let body = if text.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            };
            debug!(url = %request.url, status, "External request sent");
            Ok(ExternalResponse { status, body })
        })
    }
}
