pub mod audit;
pub mod engine;
pub mod executor;
pub mod expr;
pub mod notify;
pub mod operations;
pub mod permission;
pub mod render;
pub mod retry;
pub mod secrets;
pub mod strategy;
pub mod sweeper;
pub mod transport;
pub mod trigger;
pub mod worker;

pub use audit::AuditLog;
pub use engine::{EngineBuilder, WorkflowEngine};
pub use executor::Executor;
pub use expr::Expression;
pub use notify::{LogNotifier, NotificationRouter, WebhookNotifier};
pub use operations::{HttpRequestOperation, OperationRegistry, SetOperation};
pub use permission::{AgentPermissionGate, PermissionAction, PermissionDecision, PermissionQuery};
pub use secrets::SecretResolver;
pub use strategy::{StepStrategy, StrategySet};
pub use sweeper::{SweepReport, TimeoutSweeper};
pub use transport::HttpExternalTransport;
pub use trigger::TriggerEvaluator;
pub use worker::WorkerPool;

pub use trellis_store::InstanceFilter;
