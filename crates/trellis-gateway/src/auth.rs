use trellis_core::config::{ApiKeyRole, GatewayConfig};
use trellis_core::types::Actor;

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub name: String,
    pub role: ApiKeyRole,
    /// Agent the key acts for, if any.
    pub agent_id: Option<String>,
    /// Approver roles the key holder carries.
    pub roles: Vec<String>,
}

impl AuthResult {
    fn admin(name: &str) -> Self {
        Self {
            name: name.into(),
            role: ApiKeyRole::Admin,
            agent_id: None,
            roles: Vec::new(),
        }
    }

    /// The engine identity requests made with this key act as.
    ///
    /// Keys bound to an agent act as that agent and are permission-gated;
    /// other keys act as a user named after the key.
    pub fn actor(&self) -> Actor {
        let mut actor = match &self.agent_id {
            Some(agent_id) => Actor::agent(agent_id.clone()),
            None => Actor::user(self.name.clone()),
        };
        actor.roles = self.roles.clone();
        actor
    }
}

/// Full validation: Bearer header -> api_keys -> legacy token -> anonymous.
///
/// Returns `Some(AuthResult)` on success, `None` on auth failure.
pub fn validate_auth(
    config: &GatewayConfig,
    bearer: Option<&str>,
    query_token: Option<&str>,
) -> Option<AuthResult> {
    // 1. Check bearer against api_keys, then legacy token
    if let Some(bearer_val) = bearer {
        for ak in &config.api_keys {
            if ak.key == bearer_val {
                return Some(AuthResult {
                    name: ak.name.clone(),
                    role: ak.role,
                    agent_id: ak.agent_id.clone(),
                    roles: ak.roles.clone(),
                });
            }
        }
        if config.token.as_deref() == Some(bearer_val) {
            return Some(AuthResult::admin("legacy-token"));
        }
        return None; // Bearer provided but no match
    }

    // 2. Legacy query-string auth
    if let Some(expected) = &config.token {
        if query_token == Some(expected.as_str()) {
            return Some(AuthResult::admin("legacy-token"));
        }
        return None;
    }

    // 3. No auth configured = anonymous access (only if no api_keys either)
    if config.api_keys.is_empty() {
        Some(AuthResult::admin("anonymous"))
    } else {
        None
    }
}

/// Extract token from the query string (?token=...).
pub fn extract_token_from_query(query: &str) -> Option<&str> {
    query.split('&').find_map(|pair| pair.strip_prefix("token="))
}

pub fn has_viewer_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Viewer | ApiKeyRole::Operator | ApiKeyRole::Admin)
}

pub fn has_operator_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Operator | ApiKeyRole::Admin)
}

pub fn has_admin_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Admin)
}
