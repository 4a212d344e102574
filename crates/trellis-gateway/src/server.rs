use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use trellis_core::config::GatewayConfig;
use trellis_engine::WorkflowEngine;

use crate::routes;
use crate::state::AppState;

/// All API routes over the given state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        // Templates
        .route(
            "/api/templates",
            get(routes::list_templates).post(routes::publish_template),
        )
        .route("/api/templates/{id}", get(routes::get_template))
        .route("/api/templates/{id}/active", post(routes::set_template_active))
        .route("/api/templates/{id}/instances", post(routes::start_instance))
        // Instances
        .route("/api/instances", get(routes::list_instances))
        .route("/api/instances/{id}", get(routes::get_instance))
        .route(
            "/api/instances/{id}/steps/{index}/decision",
            post(routes::decide),
        )
        .route("/api/instances/{id}/cancel", post(routes::cancel))
        .route("/api/instances/{id}/signal", post(routes::signal))
        // Inbound events
        .route("/api/callbacks/{token}", post(routes::callback))
        .route("/api/records/changes", post(routes::record_change))
        // Agent permissions
        .route("/api/permissions", post(routes::grant_permission))
        .route("/api/permissions/{id}", delete(routes::revoke_permission))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Arc<WorkflowEngine>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: Arc<WorkflowEngine>) -> Self {
        Self { config, engine }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
        });
        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use trellis_core::config::{ApiKeyConfig, ApiKeyRole, AppConfig};
    use trellis_core::types::{
        ApprovalConfig, InstanceId, InstanceStatus, StepDefinition, StepKind, TemplateDefinition,
    };
    use trellis_store::SqliteStore;

    fn key(name: &str, role: ApiKeyRole) -> ApiKeyConfig {
        ApiKeyConfig {
            name: name.into(),
            key: format!("tk_{}", name),
            role,
            agent_id: None,
            roles: vec![],
        }
    }

    fn setup() -> (Router, Arc<WorkflowEngine>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let engine = Arc::new(
            WorkflowEngine::builder(AppConfig::default(), store)
                .build()
                .unwrap(),
        );
        let config = GatewayConfig {
            api_keys: vec![
                key("admin", ApiKeyRole::Admin),
                key("reader", ApiKeyRole::Viewer),
                key("manager", ApiKeyRole::Operator),
            ],
            ..Default::default()
        };
        let app = router(Arc::new(AppState {
            config,
            engine: engine.clone(),
        }));
        (app, engine)
    }

    fn request(method: &str, uri: &str, key: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("authorization", format!("Bearer tk_{}", key));
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn approval_template() -> Value {
        let def = TemplateDefinition::new(
            "purchase",
            vec![StepDefinition::new(
                "review",
                StepKind::Approval(ApprovalConfig {
                    users: vec!["manager".into()],
                    ..Default::default()
                }),
            )],
        );
        serde_json::to_value(def).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let (app, _) = setup();
        let (status, body) = send(&app, request("GET", "/api/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn auth_and_roles_are_enforced() {
        let (app, _) = setup();
        let (status, _) = send(&app, request("GET", "/api/templates", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, request("GET", "/api/templates", Some("reader"), None)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            request("POST", "/api/templates", Some("reader"), Some(approval_template())),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "forbidden");
    }

    #[tokio::test]
    async fn publish_start_and_decide() {
        let (app, engine) = setup();
        let (status, template) = send(
            &app,
            request("POST", "/api/templates", Some("admin"), Some(approval_template())),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(template["version"], 1);
        let template_id = template["id"].as_str().unwrap().to_string();

        let (status, started) = send(
            &app,
            request(
                "POST",
                &format!("/api/templates/{}/instances", template_id),
                Some("manager"),
                Some(json!({"payload": {"amount": 120}})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = InstanceId::from_string(started["instance_id"].as_str().unwrap());
        assert_eq!(engine.drive(&id).await.unwrap(), InstanceStatus::Paused);

        // The admin key is not a listed approver
        let uri = format!("/api/instances/{}/steps/0/decision", id);
        let (status, _) = send(
            &app,
            request("POST", &uri, Some("admin"), Some(json!({"decision": "approve"}))),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            &app,
            request("POST", &uri, Some("manager"), Some(json!({"decision": "approve", "reason": "ok"}))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");

        let (status, _) = send(
            &app,
            request("POST", &uri, Some("manager"), Some(json!({"decision": "approve"}))),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, detail) = send(
            &app,
            request("GET", &format!("/api/instances/{}", id), Some("reader"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["steps"][0]["decided_by"], "user:manager");
    }

    #[tokio::test]
    async fn unknown_resources_are_not_found() {
        let (app, _) = setup();
        let (status, _) = send(
            &app,
            request("GET", "/api/instances/wfi_missing", Some("reader"), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            request("POST", "/api/callbacks/bogus", None, Some(json!({"status": "ok"}))),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn inactive_template_cannot_start() {
        let (app, _) = setup();
        let (_, template) = send(
            &app,
            request("POST", "/api/templates", Some("admin"), Some(approval_template())),
        )
        .await;
        let template_id = template["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            request(
                "POST",
                &format!("/api/templates/{}/active", template_id),
                Some("admin"),
                Some(json!({"active": false})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            request(
                "POST",
                &format!("/api/templates/{}/instances", template_id),
                Some("manager"),
                Some(json!({"payload": {}})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
