use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use trellis_core::types::{
    AgentPermission, Decision, InstanceId, InstanceStatus, PermissionConditions, RecordChange,
    TemplateDefinition, TemplateId,
};
use trellis_engine::InstanceFilter;

use crate::auth;
use crate::error::ApiError;
use crate::middleware::Authenticated;
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

fn require_viewer(auth: &auth::AuthResult) -> ApiResult<()> {
    if auth::has_viewer_access(&auth.role) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("viewer"))
    }
}

fn require_operator(auth: &auth::AuthResult) -> ApiResult<()> {
    if auth::has_operator_access(&auth.role) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("operator"))
    }
}

fn require_admin(auth: &auth::AuthResult) -> ApiResult<()> {
    if auth::has_admin_access(&auth.role) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("admin"))
    }
}

// GET /api/health - no auth required
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Templates ───────────────────────────────────────────────────

// POST /api/templates - requires Admin
pub async fn publish_template(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(definition): Json<TemplateDefinition>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_admin(&auth_result)?;
    let template = state.engine.publish_template(&definition)?;
    info!(template = %template.name(), version = template.version, by = %auth_result.name, "Template published via API");
    Ok((StatusCode::CREATED, Json(json!(template))))
}

#[derive(Deserialize)]
pub struct TemplateQuery {
    #[serde(default)]
    pub tenant: Option<String>,
}

// GET /api/templates?tenant= - requires Viewer+
pub async fn list_templates(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<TemplateQuery>,
) -> ApiResult<Json<Value>> {
    require_viewer(&auth_result)?;
    let templates = state.engine.list_templates(q.tenant.as_deref())?;
    Ok(Json(json!({ "templates": templates })))
}

// GET /api/templates/{id} - requires Viewer+
pub async fn get_template(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_viewer(&auth_result)?;
    let template = state.engine.get_template(&TemplateId::from_string(&id))?;
    Ok(Json(json!(template)))
}

#[derive(Deserialize)]
pub struct ActiveBody {
    pub active: bool,
}

// POST /api/templates/{id}/active - requires Admin
pub async fn set_template_active(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ActiveBody>,
) -> ApiResult<Json<Value>> {
    require_admin(&auth_result)?;
    let id = TemplateId::from_string(&id);
    state.engine.set_template_active(&id, body.active)?;
    Ok(Json(json!({ "template_id": id, "active": body.active })))
}

#[derive(Deserialize)]
pub struct StartBody {
    #[serde(default)]
    pub payload: Value,
    /// Stated purpose, required by grants that demand reasoning.
    #[serde(default)]
    pub intent: Option<String>,
}

// POST /api/templates/{id}/instances - requires Operator+
pub async fn start_instance(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<StartBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_operator(&auth_result)?;
    let mut initiator = auth_result.actor();
    if let Some(intent) = body.intent {
        initiator = initiator.with_intent(intent);
    }
    let payload = match body.payload {
        Value::Null => json!({}),
        other => other,
    };
    let instance_id =
        state
            .engine
            .start_instance(&TemplateId::from_string(&id), payload, initiator)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "instance_id": instance_id,
            "status": InstanceStatus::Pending,
        })),
    ))
}

// ── Instances ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct InstanceQuery {
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

// GET /api/instances?tenant=&template_id=&status=&limit=50 - requires Viewer+
pub async fn list_instances(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<InstanceQuery>,
) -> ApiResult<Json<Value>> {
    require_viewer(&auth_result)?;
    let filter = InstanceFilter {
        tenant: q.tenant,
        template_id: q.template_id.as_deref().map(TemplateId::from_string),
        status: q
            .status
            .as_deref()
            .map(str::parse::<InstanceStatus>)
            .transpose()?,
        limit: Some(q.limit),
    };
    let instances = state.engine.list_instances(&filter)?;
    Ok(Json(json!({ "instances": instances })))
}

// GET /api/instances/{id} - requires Viewer+
pub async fn get_instance(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_viewer(&auth_result)?;
    let id = InstanceId::from_string(&id);
    let instance = state.engine.get_instance(&id)?;
    let steps = state.engine.list_steps(&id)?;
    Ok(Json(json!({ "instance": instance, "steps": steps })))
}

#[derive(Deserialize)]
pub struct DecisionBody {
    pub decision: Decision,
    #[serde(default)]
    pub reason: Option<String>,
    /// Agent deciders explain themselves here.
    #[serde(default)]
    pub reasoning: Option<String>,
}

// POST /api/instances/{id}/steps/{index}/decision - requires Operator+
pub async fn decide(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(String, usize)>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<Json<Value>> {
    require_operator(&auth_result)?;
    let id = InstanceId::from_string(&id);
    let status = state
        .engine
        .decide(
            &id,
            index,
            &auth_result.actor(),
            body.decision,
            body.reason,
            body.reasoning,
        )
        .await?;
    Ok(Json(json!({ "instance_id": id, "status": status })))
}

// POST /api/instances/{id}/cancel - requires Operator+
pub async fn cancel(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_operator(&auth_result)?;
    let id = InstanceId::from_string(&id);
    let status = state.engine.cancel(&id)?;
    info!(instance_id = %id, status = %status, by = %auth_result.name, "Cancel requested via API");
    Ok(Json(json!({ "instance_id": id, "status": status })))
}

#[derive(Deserialize)]
pub struct SignalBody {
    #[serde(default)]
    pub data: Map<String, Value>,
}

// POST /api/instances/{id}/signal - requires Operator+
pub async fn signal(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SignalBody>,
) -> ApiResult<Json<Value>> {
    require_operator(&auth_result)?;
    if body.data.is_empty() {
        return Err(ApiError::BadRequest("signal data must not be empty".into()));
    }
    let id = InstanceId::from_string(&id);
    let status = state.engine.signal(&id, body.data).await?;
    Ok(Json(json!({ "instance_id": id, "status": status })))
}

// ── Inbound events ──────────────────────────────────────────────

/// POST /api/callbacks/{token} : the token is the credential.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    let status = state.engine.callback(&token, payload).await?;
    debug!(status = %status, "Callback accepted");
    Ok(Json(json!({ "status": status })))
}

// POST /api/records/changes - requires Operator+
pub async fn record_change(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(change): Json<RecordChange>,
) -> ApiResult<Json<Value>> {
    require_operator(&auth_result)?;
    let created = state.engine.on_record_change(&change)?;
    Ok(Json(json!({ "instance_ids": created })))
}

// ── Permissions ─────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct GrantBody {
    pub agent_id: String,
    pub template_id: String,
    #[serde(default)]
    pub can_initiate: bool,
    #[serde(default)]
    pub can_approve: bool,
    #[serde(default)]
    pub conditions: PermissionConditions,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

// POST /api/permissions - requires Admin
pub async fn grant_permission(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(body): Json<GrantBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_admin(&auth_result)?;
    if !body.can_initiate && !body.can_approve {
        return Err(ApiError::BadRequest(
            "grant must allow initiate, approve or both".into(),
        ));
    }
    let template_id = TemplateId::from_string(&body.template_id);
    state.engine.get_template(&template_id)?;

    let mut grant = AgentPermission::new(body.agent_id, &template_id)
        .with_conditions(body.conditions);
    grant.can_initiate = body.can_initiate;
    grant.can_approve = body.can_approve;
    grant.expires_at = body.expires_at;
    let grant = state.engine.grant_permission(grant)?;
    Ok((StatusCode::CREATED, Json(json!(grant))))
}

// DELETE /api/permissions/{id} - requires Admin
pub async fn revoke_permission(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    require_admin(&auth_result)?;
    if state.engine.revoke_permission(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("grant {}", id)))
    }
}
