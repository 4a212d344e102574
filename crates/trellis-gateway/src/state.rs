use trellis_core::config::GatewayConfig;
use trellis_engine::WorkflowEngine;

use std::sync::Arc;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Arc<WorkflowEngine>,
}
