use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::WorkflowContext;
use crate::error::{Result, TrellisError};

/// Unique template identifier (stable across versions).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TemplateId(pub String);

impl TemplateId {
    pub fn new() -> Self {
        Self(format!("tpl_{}", Uuid::new_v4().simple()))
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for TemplateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique instance identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(format!("wfi_{}", Uuid::new_v4().simple()))
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    /// First 12 characters, for log lines and CLI tables.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Status enums ────────────────────────────────────────────────

/// Lifecycle of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(TrellisError::Validation(format!(
                "unknown instance status: {}",
                other
            ))),
        }
    }
}

/// Lifecycle of a single step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    WaitingApproval,
    WaitingExternal,
    Waiting,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl StepStatus {
    pub const WAITING: [StepStatus; 3] = [
        StepStatus::WaitingApproval,
        StepStatus::WaitingExternal,
        StepStatus::Waiting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::WaitingExternal => "waiting_external",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_waiting(&self) -> bool {
        Self::WAITING.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "waiting_external" => Ok(Self::WaitingExternal),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TrellisError::Validation(format!(
                "unknown step status: {}",
                other
            ))),
        }
    }
}

// ── Actors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    User,
    Agent,
    System,
    ApiKey,
}

/// Identity that initiates an instance or decides an approval step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub kind: ActorKind,
    pub id: String,
    /// Agent acting on behalf of this identity, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Free-form statement of what the caller is trying to achieve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl Actor {
    fn with_kind(kind: ActorKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            agent_id: None,
            intent: None,
            roles: Vec::new(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::with_kind(ActorKind::User, id)
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::with_kind(ActorKind::Agent, id)
    }

    pub fn system(id: impl Into<String>) -> Self {
        Self::with_kind(ActorKind::System, id)
    }

    pub fn api_key(name: impl Into<String>) -> Self {
        Self::with_kind(ActorKind::ApiKey, name)
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    pub fn on_behalf_of_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// The agent identity subject to permission checks, if this actor is
    /// (or acts through) an agent.
    pub fn agent_ref(&self) -> Option<&str> {
        match self.kind {
            ActorKind::Agent => Some(self.agent_id.as_deref().unwrap_or(&self.id)),
            _ => self.agent_id.as_deref(),
        }
    }

    pub fn label(&self) -> String {
        let kind = match self.kind {
            ActorKind::User => "user",
            ActorKind::Agent => "agent",
            ActorKind::System => "system",
            ActorKind::ApiKey => "api_key",
        };
        format!("{}:{}", kind, self.id)
    }
}

// ── Template definitions ────────────────────────────────────────

/// Where execution goes after a step resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Branch {
    #[default]
    Continue,
    SkipTo(usize),
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => f.write_str("continue"),
            Self::SkipTo(idx) => write!(f, "skip_to:{}", idx),
        }
    }
}

impl FromStr for Branch {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "continue" {
            return Ok(Self::Continue);
        }
        s.strip_prefix("skip_to:")
            .and_then(|n| n.trim().parse::<usize>().ok())
            .map(Self::SkipTo)
            .ok_or_else(|| TrellisError::Validation(format!("invalid branch target: {}", s)))
    }
}

impl TryFrom<String> for Branch {
    type Error = TrellisError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Branch> for String {
    fn from(value: Branch) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Approval,
    Condition,
    Action,
    Wait,
    Notification,
    External,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approval => "approval",
            Self::Condition => "condition",
            Self::Action => "action",
            Self::Wait => "wait",
            Self::Notification => "notification",
            Self::External => "external",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Explicit user identities allowed to decide.
    #[serde(default)]
    pub users: Vec<String>,
    /// Roles whose holders may decide.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Agents holding an approve grant for the template may decide.
    #[serde(default)]
    pub agents: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub expression: String,
    #[serde(default)]
    pub on_true: Branch,
    #[serde(default)]
    pub on_false: Branch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Name of the registered operation to invoke.
    pub operation: String,
    /// Parameters; strings may contain `{{path}}` placeholders.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Template secret passed to the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Context key receiving the output (default: the step name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// RFC 3339 timestamp or a `{{path}}` placeholder resolving to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    /// Cron expression; the wait ends at its next fire time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// Expression over the context; the wait ends once it holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

fn default_channel() -> String {
    "log".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_channel")]
    pub channel: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub body: serde_json::Value,
    /// Template secret sent as the bearer credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
}

/// Per-step behavior configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Approval(ApprovalConfig),
    Condition(ConditionConfig),
    Action(ActionConfig),
    Wait(WaitConfig),
    Notification(NotificationConfig),
    External(ExternalConfig),
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Approval(_) => StepType::Approval,
            Self::Condition(_) => StepType::Condition,
            Self::Action(_) => StepType::Action,
            Self::Wait(_) => StepType::Wait,
            Self::Notification(_) => StepType::Notification,
            Self::External(_) => StepType::External,
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 500 }
fn default_max_backoff_ms() -> u64 { 30_000 }

/// Opt-in bounded retry for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Deadline for the step once it starts waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Failure or rejection of an optional step does not fail the instance.
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            timeout_secs: None,
            optional: false,
            retry: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }
}

// ── Triggers ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    In,
    Exists,
    Changed,
}

/// One comparison against the record-change document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    /// Dotted path, e.g. `after.amount`. For `changed`, the path below
    /// `before`/`after`, e.g. `status`.
    pub field: String,
    pub op: CompareOp,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerRule {
    #[default]
    Manual,
    OnRecordChange {
        entity: String,
        /// Change kinds that fire the trigger; empty means all.
        #[serde(default)]
        events: Vec<ChangeKind>,
        /// ANDed comparisons.
        #[serde(default)]
        conditions: Vec<FieldCondition>,
    },
}

/// Notification about a changed business record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordChange {
    #[serde(default = "default_tenant")]
    pub tenant: String,
    pub entity: String,
    pub record_id: String,
    pub event: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
}

impl RecordChange {
    /// The document trigger conditions are evaluated against; also the
    /// trigger payload of instances it creates.
    pub fn document(&self) -> serde_json::Value {
        serde_json::json!({
            "entity": self.entity,
            "record_id": self.record_id,
            "event": self.event,
            "before": self.before.clone().unwrap_or(serde_json::Value::Null),
            "after": self.after.clone().unwrap_or(serde_json::Value::Null),
        })
    }
}

// ── Templates ───────────────────────────────────────────────────

fn default_tenant() -> String {
    "default".to_string()
}

/// The publishable part of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    #[serde(default = "default_tenant")]
    pub tenant: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub trigger: TriggerRule,
    pub steps: Vec<StepDefinition>,
    /// Default instance deadline, measured from creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TemplateDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            tenant: default_tenant(),
            name: name.into(),
            description: None,
            trigger: TriggerRule::Manual,
            steps,
            timeout_secs: None,
        }
    }

    pub fn with_trigger(mut self, trigger: TriggerRule) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Structural checks performed at publish time.
    ///
    /// Expression and cron syntax are checked by the engine, which owns
    /// those parsers.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TrellisError::Validation("template name is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(TrellisError::Validation(format!(
                "template '{}' has no steps",
                self.name
            )));
        }
        if let TriggerRule::OnRecordChange { entity, .. } = &self.trigger {
            if entity.trim().is_empty() {
                return Err(TrellisError::Validation(
                    "record-change trigger needs an entity".into(),
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for (idx, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(TrellisError::Validation(format!("step {} has no name", idx)));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(TrellisError::Validation(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
            if let Some(retry) = &step.retry {
                if retry.max_attempts == 0 {
                    return Err(TrellisError::Validation(format!(
                        "step '{}': retry.max_attempts must be at least 1",
                        step.name
                    )));
                }
            }
            match &step.kind {
                StepKind::Approval(cfg) => {
                    if cfg.users.is_empty() && cfg.roles.is_empty() && !cfg.agents {
                        return Err(TrellisError::Validation(format!(
                            "approval step '{}' has no approvers",
                            step.name
                        )));
                    }
                }
                StepKind::Condition(cfg) => {
                    for branch in [cfg.on_true, cfg.on_false] {
                        if let Branch::SkipTo(target) = branch {
                            if target <= idx || target >= self.steps.len() {
                                return Err(TrellisError::Validation(format!(
                                    "condition step '{}': skip_to:{} must jump forward within the template",
                                    step.name, target
                                )));
                            }
                        }
                    }
                }
                StepKind::Action(cfg) => {
                    if cfg.operation.trim().is_empty() {
                        return Err(TrellisError::Validation(format!(
                            "action step '{}' has no operation",
                            step.name
                        )));
                    }
                }
                StepKind::Wait(cfg) => {
                    if cfg.until.is_none()
                        && cfg.duration_secs.is_none()
                        && cfg.cron.is_none()
                        && cfg.condition.is_none()
                    {
                        return Err(TrellisError::Validation(format!(
                            "wait step '{}' needs until, duration_secs, cron or condition",
                            step.name
                        )));
                    }
                }
                StepKind::Notification(cfg) => {
                    if cfg.target.trim().is_empty() {
                        return Err(TrellisError::Validation(format!(
                            "notification step '{}' has no target",
                            step.name
                        )));
                    }
                }
                StepKind::External(cfg) => {
                    if cfg.url.trim().is_empty() {
                        return Err(TrellisError::Validation(format!(
                            "external step '{}' has no url",
                            step.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A published template version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: TemplateId,
    pub version: u32,
    pub active: bool,
    pub published_at: DateTime<Utc>,
    pub definition: TemplateDefinition,
}

impl WorkflowTemplate {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn tenant(&self) -> &str {
        &self.definition.tenant
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.definition.steps
    }
}

// ── Instances and steps ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub template_id: TemplateId,
    pub template_version: u32,
    pub tenant: String,
    pub status: InstanceStatus,
    pub step_index: usize,
    pub trigger_payload: serde_json::Value,
    pub context: WorkflowContext,
    pub initiator: Actor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Index of the first step whose failure ended the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl WorkflowInstance {
    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

impl FromStr for Decision {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "approve" | "approved" => Ok(Self::Approve),
            "reject" | "rejected" => Ok(Self::Reject),
            other => Err(TrellisError::Validation(format!(
                "unknown decision: {}",
                other
            ))),
        }
    }
}

/// Identities allowed to decide one approval step, resolved when it starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApproverSet {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub agents: Vec<String>,
}

/// What a suspended step is waiting for. Persisted with the step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WakeCondition {
    Decision { approvers: ApproverSet },
    Callback,
    Timer { at: DateTime<Utc> },
    Expression {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        not_after: Option<DateTime<Utc>>,
    },
}

impl WakeCondition {
    pub fn waiting_status(&self) -> StepStatus {
        match self {
            Self::Decision { .. } => StepStatus::WaitingApproval,
            Self::Callback => StepStatus::WaitingExternal,
            Self::Timer { .. } | Self::Expression { .. } => StepStatus::Waiting,
        }
    }

    pub fn wake_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timer { at } => Some(*at),
            Self::Expression { not_after, .. } => *not_after,
            _ => None,
        }
    }
}

/// Runtime record of one step of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub instance_id: InstanceId,
    pub step_index: usize,
    pub step_name: String,
    pub step_type: StepType,
    /// Frozen copy of the definition at schedule time.
    pub config_snapshot: StepDefinition,
    pub status: StepStatus,
    pub attempt: u32,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_condition: Option<WakeCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_request: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_response: Option<serde_json::Value>,
    /// blake3 hex digest of the callback token; the token itself is never stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_token_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_consumed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// A fresh, pending record for `definition` at `step_index`.
    pub fn scheduled(
        instance_id: &InstanceId,
        step_index: usize,
        definition: &StepDefinition,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id: instance_id.clone(),
            step_index,
            step_name: definition.name.clone(),
            step_type: definition.step_type(),
            config_snapshot: definition.clone(),
            status: StepStatus::Pending,
            attempt: 0,
            input: serde_json::Value::Null,
            output: None,
            error: None,
            wake_condition: None,
            decided_by: None,
            decision: None,
            decision_reason: None,
            agent_reasoning: None,
            external_request: None,
            external_response: None,
            callback_token_hash: None,
            callback_consumed_at: None,
            wake_at: None,
            deadline: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

// ── Agent permissions ───────────────────────────────────────────

fn default_amount_field() -> String {
    "amount".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionConditions {
    /// Upper bound on the amount found at `amount_field` in the context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<f64>,
    #[serde(default = "default_amount_field")]
    pub amount_field: String,
    /// Approval is limited to these step names when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_steps: Vec<String>,
    #[serde(default)]
    pub require_reasoning: bool,
}

impl Default for PermissionConditions {
    fn default() -> Self {
        Self {
            max_amount: None,
            amount_field: default_amount_field(),
            allowed_steps: Vec::new(),
            require_reasoning: false,
        }
    }
}

impl PermissionConditions {
    pub fn is_unconditional(&self) -> bool {
        self.max_amount.is_none() && self.allowed_steps.is_empty() && !self.require_reasoning
    }
}

/// Grant allowing an agent to initiate and/or approve one template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPermission {
    pub id: String,
    pub agent_id: String,
    pub template_id: TemplateId,
    #[serde(default)]
    pub can_initiate: bool,
    #[serde(default)]
    pub can_approve: bool,
    #[serde(default)]
    pub conditions: PermissionConditions,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AgentPermission {
    pub fn new(agent_id: impl Into<String>, template_id: &TemplateId) -> Self {
        Self {
            id: format!("perm_{}", Uuid::new_v4().simple()),
            agent_id: agent_id.into(),
            template_id: template_id.clone(),
            can_initiate: false,
            can_approve: false,
            conditions: PermissionConditions::default(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn initiate(mut self) -> Self {
        self.can_initiate = true;
        self
    }

    pub fn approve(mut self) -> Self {
        self.can_approve = true;
        self
    }

    pub fn with_conditions(mut self, conditions: PermissionConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| e <= now)
    }
}
