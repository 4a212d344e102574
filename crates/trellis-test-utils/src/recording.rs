use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Notify;

use trellis_core::error::Result;
use trellis_core::traits::{
    ExternalRequest, ExternalResponse, ExternalTransport, NotificationMessage, NotificationSink,
    Operation, OperationContext,
};

/// One recorded operation call.
#[derive(Debug, Clone)]
pub struct OperationCall {
    pub params: Value,
    pub attempt: u32,
    pub idempotency_key: String,
    pub had_secret: bool,
}

/// Operation that records every call and returns its params.
pub struct RecordingOperation {
    name: String,
    calls: Arc<Mutex<Vec<OperationCall>>>,
}

impl RecordingOperation {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle to the call log that stays valid after the operation is
    /// moved into a registry.
    pub fn calls(&self) -> Arc<Mutex<Vec<OperationCall>>> {
        self.calls.clone()
    }
}

impl Operation for RecordingOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "records calls and echoes params"
    }

    fn execute(&self, params: Value, ctx: OperationContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(OperationCall {
                params: params.clone(),
                attempt: ctx.attempt,
                idempotency_key: ctx.idempotency_key,
                had_secret: ctx.secret.is_some(),
            });
            Ok(params)
        })
    }
}

/// Operation that blocks mid-call until released.
///
/// `started` fires when the call begins; the call returns once `release`
/// is notified.
pub struct BlockingOperation {
    name: String,
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl BlockingOperation {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

impl Operation for BlockingOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "blocks until released"
    }

    fn execute(&self, params: Value, _ctx: OperationContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            self.started.notify_one();
            self.release.notified().await;
            Ok(params)
        })
    }
}

/// Notification sink that keeps delivered messages in memory.
pub struct RecordingSink {
    channel: String,
    messages: Mutex<Vec<NotificationMessage>>,
}

impl RecordingSink {
    pub fn new(channel: &str) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.to_string(),
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn messages(&self) -> Vec<NotificationMessage> {
        self.messages.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn deliver(&self, message: NotificationMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.messages.lock().unwrap().push(message);
            Ok(())
        })
    }
}

/// External transport that records requests and answers with a fixed
/// status.
pub struct RecordingTransport {
    status: u16,
    requests: Mutex<Vec<ExternalRequest>>,
}

impl RecordingTransport {
    /// Accepts every request with 202.
    pub fn accepting() -> Arc<Self> {
        Self::with_status(202)
    }

    pub fn with_status(status: u16) -> Arc<Self> {
        Arc::new(Self {
            status,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ExternalRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Token embedded in the most recent callback URL.
    pub fn last_token(&self) -> Option<String> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .and_then(|r| r.callback_url.rsplit('/').next().map(str::to_string))
    }
}

impl ExternalTransport for RecordingTransport {
    fn send(&self, request: ExternalRequest) -> BoxFuture<'_, Result<ExternalResponse>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            Ok(ExternalResponse {
                status: self.status,
                body: Value::Null,
            })
        })
    }
}
