use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Duration;
use futures::future::BoxFuture;
use rand::RngCore;
use serde_json::{json, Value};
use tracing::{debug, warn};

use trellis_core::error::ErrorKind;
use trellis_core::traits::{ExternalRequest, ExternalTransport};
use trellis_core::types::{StepKind, StepType, WakeCondition};
use trellis_store::SqliteStore;

use super::action::idempotency_key;
use super::{Resolution, StepContext, StepFailure, StepOutcome, StepStrategy, Suspension};
use crate::render::{render_str, render_value};
use crate::secrets::SecretResolver;

/// Hex blake3 digest of a callback token. Only the digest is persisted.
pub fn hash_token(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

/// 256 random bits, URL-safe.
fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Calls a remote system and suspends until it reports back through the
/// single-use callback URL.
///
/// The token hash is stored on the step before the request goes out, so a
/// remote that answers before its HTTP response returns is still heard.
pub struct ExternalStrategy {
    transport: Arc<dyn ExternalTransport>,
    secrets: Arc<SecretResolver>,
    store: Arc<SqliteStore>,
    callback_base_url: String,
    default_timeout_secs: u64,
}

impl ExternalStrategy {
    pub fn new(
        transport: Arc<dyn ExternalTransport>,
        secrets: Arc<SecretResolver>,
        store: Arc<SqliteStore>,
        callback_base_url: impl Into<String>,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            transport,
            secrets,
            store,
            callback_base_url: callback_base_url.into().trim_end_matches('/').to_string(),
            default_timeout_secs,
        }
    }

    fn callback_url(&self, token: &str) -> String {
        format!("{}/api/callbacks/{}", self.callback_base_url, token)
    }
}

impl StepStrategy for ExternalStrategy {
    fn step_type(&self) -> StepType {
        StepType::External
    }

    fn execute<'a>(&'a self, ctx: StepContext<'a>) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            let StepKind::External(cfg) = &ctx.step.config_snapshot.kind else {
                return StepOutcome::Failed(StepFailure::fatal("not an external step"));
            };
            // Replayed after the remote already answered: never send twice
            if ctx.step.callback_consumed_at.is_some() {
                return self.resume(ctx).await;
            }
            let data = ctx.context.data();
            let url = match render_str(&cfg.url, data) {
                Ok(u) => u,
                Err(e) => return e.into(),
            };
            let body = match render_value(&cfg.body, data) {
                Ok(b) => b,
                Err(e) => return e.into(),
            };
            let bearer = match &cfg.secret {
                Some(name) => match self.secrets.resolve(&ctx.instance.template_id, name) {
                    Ok(s) => Some(s),
                    Err(e) => return e.into(),
                },
                None => None,
            };

            let timeout = ctx
                .step
                .config_snapshot
                .timeout_secs
                .unwrap_or(self.default_timeout_secs);
            let deadline = (timeout > 0).then(|| ctx.now + Duration::seconds(timeout as i64));

            let token = mint_token();
            let token_hash = hash_token(&token);
            match self.store.record_callback_token(
                &ctx.instance.id,
                ctx.step.step_index,
                &token_hash,
                deadline,
            ) {
                Ok(true) => {}
                Ok(false) => {
                    return StepOutcome::Failed(StepFailure::fatal("step is no longer running"))
                }
                Err(e) => return e.into(),
            }

            let request = ExternalRequest {
                url: url.clone(),
                method: cfg.method.clone(),
                body: body.clone(),
                callback_url: self.callback_url(&token),
                idempotency_key: idempotency_key(&ctx),
                bearer,
            };

            let response = match self.transport.send(request).await {
                Ok(r) => r,
                Err(e) => return e.into(),
            };
            if !response.is_success() {
                warn!(
                    instance_id = %ctx.instance.id,
                    step = %ctx.step.step_name,
                    status = response.status,
                    "External request refused"
                );
                return StepOutcome::Failed(StepFailure {
                    message: format!("external system answered {}", response.status),
                    retryable: response.status >= 500 || response.status == 429,
                    kind: ErrorKind::StepFailure,
                });
            }

            debug!(instance_id = %ctx.instance.id, step = %ctx.step.step_name, url = %url, "Awaiting callback");
            StepOutcome::Suspended(Suspension {
                wake: WakeCondition::Callback,
                deadline,
                external_request: Some(json!({
                    "url": url,
                    "method": cfg.method,
                    "body": body,
                    "callback_url": self.callback_url("***"),
                    "response": response,
                })),
                callback_token_hash: Some(token_hash),
            })
        })
    }

    fn resume<'a>(&'a self, ctx: StepContext<'a>) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            let StepKind::External(cfg) = &ctx.step.config_snapshot.kind else {
                return StepOutcome::Failed(StepFailure::fatal("not an external step"));
            };
            let payload = ctx.step.external_response.clone().unwrap_or(Value::Null);

            if payload.get("status").and_then(Value::as_str) == Some("failed") {
                let reason = payload
                    .get("reason")
                    .or_else(|| payload.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("external system reported failure");
                return StepOutcome::Failed(StepFailure::rejected(reason.to_string()));
            }

            let output = payload.get("data").cloned().unwrap_or(payload);
            StepOutcome::Resolved(Resolution::merged(
                ctx.output_key(cfg.output_key.as_ref()),
                output,
            ))
        })
    }
}
