use thiserror::Error;

/// Coarse classification of failures, used for HTTP mapping and for deciding
/// how a step failure propagates to its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    PermissionDenied,
    NotFound,
    Conflict,
    StepFailure,
    Timeout,
    ExternalRejection,
    Internal,
}

#[derive(Debug, Error)]
pub enum TrellisError {
    // Template / trigger errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template is inactive: {0}")]
    TemplateInactive(String),

    // Authorization errors
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not authorized to decide step {step_index} of {instance_id}: {reason}")]
    NotAuthorized {
        instance_id: String,
        step_index: usize,
        reason: String,
    },

    // Instance / step state errors
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Step {step_index} of {instance_id} is not waiting")]
    StepNotWaiting {
        instance_id: String,
        step_index: usize,
    },

    #[error("Instance {0} is terminal")]
    InstanceTerminal(String),

    #[error("Invalid transition for {instance_id}: {from} -> {to}")]
    InvalidTransition {
        instance_id: String,
        from: String,
        to: String,
    },

    // Callback errors
    #[error("Callback token is invalid")]
    TokenInvalid,

    #[error("Callback token has expired")]
    TokenExpired,

    #[error("Callback token was already consumed")]
    AlreadyConsumed,

    // Step execution errors
    #[error("Step '{step}' failed: {message}")]
    StepFailure {
        step: String,
        message: String,
        retryable: bool,
    },

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Operation '{operation}' timed out after {timeout_secs}s")]
    OperationTimeout { operation: String, timeout_secs: u64 },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Step '{step}' rejected: {reason}")]
    ExternalRejection { step: String, reason: String },

    // Collaborator errors
    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Transport error: {0}")]
    Transport(String),

    // Secret errors
    #[error("Secret not found: {template_id}/{name}")]
    SecretNotFound { template_id: String, name: String },

    #[error("Crypto error: {0}")]
    Crypto(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrellisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Config(_) => ErrorKind::Validation,
            Self::PermissionDenied(_) | Self::NotAuthorized { .. } => ErrorKind::PermissionDenied,
            Self::TemplateNotFound(_)
            | Self::InstanceNotFound(_)
            | Self::OperationNotFound(_)
            | Self::SecretNotFound { .. }
            | Self::ConfigNotFound(_)
            | Self::TokenInvalid => ErrorKind::NotFound,
            Self::TemplateInactive(_)
            | Self::StepNotWaiting { .. }
            | Self::InstanceTerminal(_)
            | Self::InvalidTransition { .. }
            | Self::AlreadyConsumed => ErrorKind::Conflict,
            Self::StepFailure { .. } | Self::Notification(_) | Self::Transport(_) => {
                ErrorKind::StepFailure
            }
            Self::OperationTimeout { .. } | Self::Timeout(_) | Self::TokenExpired => {
                ErrorKind::Timeout
            }
            Self::ExternalRejection { .. } => ErrorKind::ExternalRejection,
            Self::Crypto(_) | Self::Database(_) | Self::Io(_) | Self::Json(_) => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_error_taxonomy() {
        assert_eq!(
            TrellisError::Validation("bad".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            TrellisError::PermissionDenied("no grant".into()).kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(TrellisError::AlreadyConsumed.kind(), ErrorKind::Conflict);
        assert_eq!(TrellisError::TokenExpired.kind(), ErrorKind::Timeout);
        assert_eq!(
            TrellisError::ExternalRejection {
                step: "review".into(),
                reason: "no".into()
            }
            .kind(),
            ErrorKind::ExternalRejection
        );
    }
}
