use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::info;

use trellis_core::config::AppConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EventBus, WorkflowEvent};
use trellis_core::traits::{ExternalTransport, NotificationSink, Operation};
use trellis_core::types::{
    Actor, AgentPermission, Decision, InstanceId, InstanceStatus, RecordChange, StepExecution,
    StepKind, TemplateDefinition, TemplateId, WorkflowInstance, WorkflowTemplate,
};
use trellis_store::{InstanceFilter, SqliteStore};

use crate::executor::Executor;
use crate::expr::Expression;
use crate::notify::NotificationRouter;
use crate::operations::OperationRegistry;
use crate::permission::{AgentPermissionGate, PermissionDecision, PermissionQuery};
use crate::render::has_placeholder;
use crate::secrets::SecretResolver;
use crate::strategy::{
    next_cron_fire, ActionStrategy, ApprovalStrategy, ConditionStrategy, ExternalStrategy,
    NotificationStrategy, StrategySet, WaitStrategy,
};
use crate::sweeper::{SweepReport, TimeoutSweeper};
use crate::transport::HttpExternalTransport;
use crate::trigger::TriggerEvaluator;
use crate::worker::WorkerPool;

/// Assembles a [`WorkflowEngine`] from config plus optional custom
/// operations, notification sinks and transport.
pub struct EngineBuilder {
    config: AppConfig,
    store: Arc<SqliteStore>,
    event_bus: Option<Arc<EventBus>>,
    operations: OperationRegistry,
    router: NotificationRouter,
    transport: Option<Arc<dyn ExternalTransport>>,
}

impl EngineBuilder {
    pub fn operation(mut self, operation: impl Operation) -> Self {
        self.operations.register(operation);
        self
    }

    pub fn notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.router.register(sink);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ExternalTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn build(self) -> Result<WorkflowEngine> {
        let engine_cfg = &self.config.engine;
        let store = self.store;
        let event_bus = self.event_bus.unwrap_or_default();
        let gate = Arc::new(AgentPermissionGate::new(store.clone(), event_bus.clone()));
        let secrets = Arc::new(SecretResolver::from_config(
            store.clone(),
            &self.config.secrets,
        )?);
        let operations = Arc::new(self.operations);
        let router = Arc::new(self.router);
        let transport: Arc<dyn ExternalTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpExternalTransport::new(engine_cfg.operation_timeout_secs)),
        };

        let mut strategies = StrategySet::new();
        strategies.register(Arc::new(ApprovalStrategy::new(
            gate.clone(),
            engine_cfg.default_approval_timeout_secs,
        )));
        strategies.register(Arc::new(ConditionStrategy));
        strategies.register(Arc::new(ActionStrategy::new(
            operations.clone(),
            secrets.clone(),
        )));
        strategies.register(Arc::new(WaitStrategy));
        strategies.register(Arc::new(NotificationStrategy::new(router.clone())));
        strategies.register(Arc::new(ExternalStrategy::new(
            transport,
            secrets.clone(),
            store.clone(),
            engine_cfg.callback_base_url.clone(),
            engine_cfg.default_external_timeout_secs,
        )));

        let executor = Arc::new(Executor::new(
            store.clone(),
            strategies,
            gate.clone(),
            event_bus.clone(),
            engine_cfg,
        ));
        let trigger = TriggerEvaluator::new(
            store.clone(),
            gate.clone(),
            event_bus.clone(),
            engine_cfg.default_instance_timeout_secs,
        );
        let sweeper = TimeoutSweeper::new(
            store.clone(),
            event_bus.clone(),
            self.config.sweeper.interval_secs,
        );

        Ok(WorkflowEngine {
            config: self.config,
            store,
            event_bus,
            gate,
            secrets,
            operations,
            router,
            executor,
            trigger,
            sweeper,
        })
    }
}

/// Entry point for everything the engine does.
pub struct WorkflowEngine {
    config: AppConfig,
    store: Arc<SqliteStore>,
    event_bus: Arc<EventBus>,
    gate: Arc<AgentPermissionGate>,
    secrets: Arc<SecretResolver>,
    operations: Arc<OperationRegistry>,
    router: Arc<NotificationRouter>,
    executor: Arc<Executor>,
    trigger: TriggerEvaluator,
    sweeper: TimeoutSweeper,
}

impl WorkflowEngine {
    pub fn builder(config: AppConfig, store: Arc<SqliteStore>) -> EngineBuilder {
        let operations = OperationRegistry::with_builtins(config.engine.operation_timeout_secs);
        let router = NotificationRouter::with_builtins(&config.notifications);
        EngineBuilder {
            config,
            store,
            event_bus: None,
            operations,
            router,
            transport: None,
        }
    }

    /// Engine with the built-in collaborators over the configured database.
    pub fn open(config: AppConfig) -> Result<Self> {
        let path = config.database_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Arc::new(SqliteStore::open(&path)?);
        Self::builder(config, store).build()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(self.executor.clone(), self.store.clone(), &self.config.engine)
    }

    pub fn sweeper(&self) -> &TimeoutSweeper {
        &self.sweeper
    }

    // ── Templates ───────────────────────────────────────────────

    /// Validate and publish a template as a new version. Expressions, cron
    /// schedules, operations and notification channels are checked here so
    /// that bad templates never reach an instance.
    pub fn publish_template(&self, definition: &TemplateDefinition) -> Result<WorkflowTemplate> {
        definition.validate()?;
        for step in &definition.steps {
            let invalid = |msg: String| {
                TrellisError::Validation(format!("step '{}': {}", step.name, msg))
            };
            match &step.kind {
                StepKind::Condition(cfg) => {
                    Expression::parse(&cfg.expression).map_err(|e| invalid(e.to_string()))?;
                }
                StepKind::Wait(cfg) => {
                    if let Some(cond) = &cfg.condition {
                        Expression::parse(cond).map_err(|e| invalid(e.to_string()))?;
                    }
                    if let Some(cron) = &cfg.cron {
                        next_cron_fire(cron, Utc::now()).map_err(|e| invalid(e.to_string()))?;
                    }
                }
                StepKind::Action(cfg) => {
                    if !self.operations.contains(&cfg.operation) {
                        return Err(invalid(format!("unknown operation '{}'", cfg.operation)));
                    }
                }
                StepKind::Notification(cfg) => {
                    if !has_placeholder(&cfg.channel) && !self.router.has_channel(&cfg.channel) {
                        return Err(invalid(format!("unknown channel '{}'", cfg.channel)));
                    }
                }
                StepKind::Approval(_) | StepKind::External(_) => {}
            }
        }

        let template = self.store.publish_template(definition, Utc::now())?;
        self.event_bus.publish(WorkflowEvent::TemplatePublished {
            template_id: template.id.clone(),
            name: template.name().to_string(),
            version: template.version,
        });
        Ok(template)
    }

    pub fn set_template_active(&self, id: &TemplateId, active: bool) -> Result<()> {
        if !self.store.set_template_active(id, active)? {
            return Err(TrellisError::TemplateNotFound(id.0.clone()));
        }
        info!(template_id = %id, active, "Template active flag changed");
        Ok(())
    }

    pub fn get_template(&self, id: &TemplateId) -> Result<WorkflowTemplate> {
        self.store
            .get_template(id)?
            .ok_or_else(|| TrellisError::TemplateNotFound(id.0.clone()))
    }

    pub fn find_template(&self, tenant: &str, name: &str) -> Result<Option<WorkflowTemplate>> {
        self.store.find_template_by_name(tenant, name)
    }

    pub fn list_templates(&self, tenant: Option<&str>) -> Result<Vec<WorkflowTemplate>> {
        self.store.list_templates(tenant)
    }

    // ── Instances ───────────────────────────────────────────────

    /// Create an instance. It runs on the next drive (worker pool or an
    /// explicit [`WorkflowEngine::drive`]).
    pub fn start_instance(
        &self,
        template_id: &TemplateId,
        payload: Value,
        initiator: Actor,
    ) -> Result<InstanceId> {
        self.trigger.start_instance(template_id, payload, initiator)
    }

    pub fn on_record_change(&self, change: &RecordChange) -> Result<Vec<InstanceId>> {
        self.trigger.on_record_change(change)
    }

    pub fn trigger(&self) -> &TriggerEvaluator {
        &self.trigger
    }

    pub async fn drive(&self, id: &InstanceId) -> Result<InstanceStatus> {
        self.executor.drive(id).await
    }

    pub async fn decide(
        &self,
        id: &InstanceId,
        step_index: usize,
        decider: &Actor,
        decision: Decision,
        reason: Option<String>,
        agent_reasoning: Option<String>,
    ) -> Result<InstanceStatus> {
        self.executor
            .decide(id, step_index, decider, decision, reason, agent_reasoning)
            .await
    }

    pub async fn callback(&self, token: &str, payload: Value) -> Result<InstanceStatus> {
        self.executor.callback(token, payload).await
    }

    pub async fn signal(&self, id: &InstanceId, data: Map<String, Value>) -> Result<InstanceStatus> {
        self.executor.signal(id, data).await
    }

    pub fn cancel(&self, id: &InstanceId) -> Result<InstanceStatus> {
        self.executor.cancel(id)
    }

    /// Resume timer waits due at `now` and drive the woken instances.
    pub async fn wake_due(&self, now: DateTime<Utc>) -> Result<Vec<InstanceId>> {
        let woken = self.executor.wake_due(now)?;
        for id in &woken {
            self.executor.drive(id).await?;
        }
        Ok(woken)
    }

    pub fn sweep_once(&self) -> Result<SweepReport> {
        self.sweeper.sweep_once(Utc::now())
    }

    pub fn get_instance(&self, id: &InstanceId) -> Result<WorkflowInstance> {
        self.store
            .get_instance(id)?
            .ok_or_else(|| TrellisError::InstanceNotFound(id.0.clone()))
    }

    pub fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>> {
        self.store.list_instances(filter)
    }

    pub fn list_steps(&self, id: &InstanceId) -> Result<Vec<StepExecution>> {
        self.get_instance(id)?;
        self.store.list_steps(id)
    }

    // ── Grants and secrets ──────────────────────────────────────

    pub fn grant_permission(&self, grant: AgentPermission) -> Result<AgentPermission> {
        self.gate.grant(grant)
    }

    pub fn revoke_permission(&self, grant_id: &str) -> Result<bool> {
        self.gate.revoke(grant_id)
    }

    pub fn check_permission(&self, query: &PermissionQuery<'_>) -> Result<PermissionDecision> {
        self.gate.check(query)
    }

    pub fn store_secret(&self, template_id: &TemplateId, name: &str, value: &str) -> Result<()> {
        self.get_template(template_id)?;
        self.secrets.store_secret(template_id, name, value)
    }

    pub fn list_secrets(&self, template_id: &TemplateId) -> Result<Vec<String>> {
        self.secrets.list(template_id)
    }
}
