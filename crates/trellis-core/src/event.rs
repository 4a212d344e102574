use serde::Serialize;

use crate::types::{Decision, InstanceId, InstanceStatus, StepStatus, TemplateId};

/// Lifecycle events published by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    TemplatePublished {
        template_id: TemplateId,
        name: String,
        version: u32,
    },
    InstanceCreated {
        instance_id: InstanceId,
        template_id: TemplateId,
        template_version: u32,
        initiator: String,
    },
    InstanceStatusChanged {
        instance_id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    CancelRequested {
        instance_id: InstanceId,
    },
    StepStarted {
        instance_id: InstanceId,
        step_index: usize,
        step_name: String,
        attempt: u32,
    },
    StepSuspended {
        instance_id: InstanceId,
        step_index: usize,
        status: StepStatus,
    },
    StepCompleted {
        instance_id: InstanceId,
        step_index: usize,
        step_name: String,
    },
    StepFailed {
        instance_id: InstanceId,
        step_index: usize,
        step_name: String,
        error: String,
        retryable: bool,
    },
    StepTimedOut {
        instance_id: InstanceId,
        step_index: usize,
    },
    DecisionRecorded {
        instance_id: InstanceId,
        step_index: usize,
        decided_by: String,
        decision: Decision,
    },
    CallbackReceived {
        instance_id: InstanceId,
        step_index: usize,
        status: String,
    },
    PermissionChecked {
        agent_id: String,
        template_id: TemplateId,
        action: String,
        allowed: bool,
        reason: String,
    },
    PermissionGranted {
        grant_id: String,
        agent_id: String,
        template_id: TemplateId,
        can_initiate: bool,
        can_approve: bool,
    },
    PermissionRevoked {
        grant_id: String,
    },
}

impl WorkflowEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TemplatePublished { .. } => "template_published",
            Self::InstanceCreated { .. } => "instance_created",
            Self::InstanceStatusChanged { .. } => "instance_status_changed",
            Self::CancelRequested { .. } => "cancel_requested",
            Self::StepStarted { .. } => "step_started",
            Self::StepSuspended { .. } => "step_suspended",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepTimedOut { .. } => "step_timed_out",
            Self::DecisionRecorded { .. } => "decision_recorded",
            Self::CallbackReceived { .. } => "callback_received",
            Self::PermissionChecked { .. } => "permission_checked",
            Self::PermissionGranted { .. } => "permission_granted",
            Self::PermissionRevoked { .. } => "permission_revoked",
        }
    }

    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            Self::InstanceCreated { instance_id, .. }
            | Self::InstanceStatusChanged { instance_id, .. }
            | Self::CancelRequested { instance_id }
            | Self::StepStarted { instance_id, .. }
            | Self::StepSuspended { instance_id, .. }
            | Self::StepCompleted { instance_id, .. }
            | Self::StepFailed { instance_id, .. }
            | Self::StepTimedOut { instance_id, .. }
            | Self::DecisionRecorded { instance_id, .. }
            | Self::CallbackReceived { instance_id, .. } => Some(instance_id),
            Self::TemplatePublished { .. }
            | Self::PermissionChecked { .. }
            | Self::PermissionGranted { .. }
            | Self::PermissionRevoked { .. } => None,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
