use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};

/// Top-level Trellis configuration (`trellis.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database file. `~/` is expanded.
    #[serde(default = "default_database")]
    pub database: String,
    /// Identity written into instance claims.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    /// Maximum instances driven concurrently by the worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a claim is honored before another worker may take over.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
    /// Instance deadline when the template sets none. 0 disables it.
    #[serde(default = "default_instance_timeout_secs")]
    pub default_instance_timeout_secs: u64,
    #[serde(default = "default_step_timeout_secs")]
    pub default_approval_timeout_secs: u64,
    #[serde(default = "default_step_timeout_secs")]
    pub default_external_timeout_secs: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Public base URL external systems use to reach the callback route.
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            worker_id: default_worker_id(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            claim_lease_secs: default_claim_lease_secs(),
            default_instance_timeout_secs: default_instance_timeout_secs(),
            default_approval_timeout_secs: default_step_timeout_secs(),
            default_external_timeout_secs: default_step_timeout_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            callback_base_url: default_callback_base_url(),
        }
    }
}

fn default_database() -> String { "~/.trellis/trellis.db".to_string() }
fn default_worker_id() -> String { "worker-1".to_string() }
fn default_workers() -> usize { 4 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_claim_lease_secs() -> u64 { 300 }
fn default_instance_timeout_secs() -> u64 { 7 * 24 * 3600 }
fn default_step_timeout_secs() -> u64 { 24 * 3600 }
fn default_operation_timeout_secs() -> u64 { 30 }
fn default_callback_base_url() -> String { "http://127.0.0.1:18790".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweeper_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sweeper_interval")]
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweeper_enabled(),
            interval_secs: default_sweeper_interval(),
        }
    }
}

fn default_sweeper_enabled() -> bool { true }
fn default_sweeper_interval() -> u64 { 30 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Legacy single admin token.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            api_keys: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub role: ApiKeyRole,
    /// Agent this key acts for; agent-initiated work is permission-gated.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Roles the key holder carries when deciding approval steps.
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyRole {
    /// Read templates and instances only
    Viewer,
    /// Read + start, decide, cancel, signal
    #[default]
    Operator,
    /// Full access, including publishing and grants
    Admin,
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Base64-encoded 32-byte master key. Usually `${TRELLIS_MASTER_KEY}`.
    #[serde(default)]
    pub master_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,
    #[serde(default = "default_notify_retries")]
    pub max_retries: u32,
    #[serde(default = "default_notify_backoff")]
    pub initial_backoff_ms: u64,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            webhook_timeout_secs: default_webhook_timeout(),
            max_retries: default_notify_retries(),
            initial_backoff_ms: default_notify_backoff(),
        }
    }
}

fn default_webhook_timeout() -> u64 { 10 }
fn default_notify_retries() -> u32 { 3 }
fn default_notify_backoff() -> u64 { 1000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_audit_dir")]
    pub log_dir: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            log_dir: default_audit_dir(),
        }
    }
}

fn default_audit_enabled() -> bool { true }
fn default_audit_dir() -> String { "~/.trellis/audit".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TrellisError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| TrellisError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.workers == 0 {
            return Err(TrellisError::Config("engine.workers must be at least 1".into()));
        }
        if self.engine.claim_lease_secs == 0 {
            return Err(TrellisError::Config(
                "engine.claim_lease_secs must be positive".into(),
            ));
        }
        if self.sweeper.enabled && self.sweeper.interval_secs == 0 {
            return Err(TrellisError::Config(
                "sweeper.interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.engine.database)
    }

    /// Resolve the audit log directory (expand ~).
    pub fn audit_dir(&self) -> PathBuf {
        expand_home(&self.audit.log_dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_TRELLIS_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_TRELLIS_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_TRELLIS_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_TRELLIS_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_TRELLIS_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.engine.claim_lease_secs, 300);
        assert_eq!(config.engine.default_approval_timeout_secs, 86_400);
        assert!(config.sweeper.enabled);
        assert_eq!(config.sweeper.interval_secs, 30);
        assert!(config.gateway.is_none());
        assert!(config.secrets.master_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_gateway_api_keys() {
        let toml_str = r#"
[gateway]
bind = "0.0.0.0:8080"

[[gateway.api_keys]]
name = "dashboard"
key = "tk_viewer"
role = "viewer"

[[gateway.api_keys]]
name = "finance-bot"
key = "tk_agent"
agent_id = "finance-bot"
roles = ["finance"]
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let gw = config.gateway.unwrap();
        assert_eq!(gw.bind, "0.0.0.0:8080");
        assert_eq!(gw.api_keys[0].role, ApiKeyRole::Viewer);
        assert_eq!(gw.api_keys[1].role, ApiKeyRole::Operator);
        assert_eq!(gw.api_keys[1].agent_id.as_deref(), Some("finance-bot"));
        assert_eq!(gw.api_keys[1].roles, vec!["finance".to_string()]);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config: AppConfig = toml::from_str("[engine]\nworkers = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(TrellisError::Config(_))));
    }

    #[test]
    fn test_absolute_paths_untouched() {
        let config: AppConfig =
            toml::from_str("[engine]\ndatabase = \"/var/lib/trellis.db\"\n").unwrap();
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/trellis.db"));
    }
}
