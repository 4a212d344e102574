use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{Duration, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trellis_core::config::AppConfig;
use trellis_core::types::{
    Actor, AgentPermission, Decision, InstanceId, InstanceStatus, PermissionConditions,
    TemplateDefinition, TemplateId, WorkflowTemplate,
};
use trellis_engine::{AuditLog, InstanceFilter, SecretResolver, WorkflowEngine};
use trellis_gateway::GatewayServer;

#[derive(Parser)]
#[command(name = "trellis", version, about = "Template-driven workflow orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "TRELLIS_CONFIG", default_value = "trellis.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway, worker pool, timeout sweeper and audit log
    Serve,
    /// Publish a template from a TOML or JSON file as a new version
    Publish {
        file: PathBuf,
    },
    /// List templates
    Templates {
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Allow new instances of a template again
    Activate {
        template: String,
    },
    /// Stop new instances of a template; running ones are unaffected
    Deactivate {
        template: String,
    },
    /// Start an instance and drive it until it waits or finishes
    Start {
        /// Template id or name
        template: String,
        /// Trigger payload as JSON
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long, default_value = "default")]
        tenant: String,
        /// Initiating user
        #[arg(long = "as", default_value = "cli")]
        initiator: String,
    },
    /// List instances
    Instances {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        template: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show an instance with its step history
    Show {
        instance: String,
    },
    /// Approve or reject a waiting approval step
    Decide {
        instance: String,
        step: usize,
        /// approve or reject
        decision: String,
        /// Deciding user (or agent with --agent)
        #[arg(long = "as")]
        decider: String,
        #[arg(long)]
        agent: bool,
        /// Approver roles the decider holds
        #[arg(long)]
        role: Vec<String>,
        #[arg(long)]
        reason: Option<String>,
        /// Agent reasoning, required by some grants
        #[arg(long)]
        reasoning: Option<String>,
    },
    /// Cancel an instance
    Cancel {
        instance: String,
    },
    /// Merge data into a paused instance's context
    Signal {
        instance: String,
        /// JSON object to merge
        data: String,
    },
    /// Run one timeout sweep and exit
    Sweep,
    /// Grant an agent permission on a template
    Grant {
        agent: String,
        template: String,
        #[arg(long)]
        initiate: bool,
        #[arg(long)]
        approve: bool,
        /// Largest amount the agent may act on
        #[arg(long)]
        max_amount: Option<f64>,
        /// Context field holding the amount
        #[arg(long)]
        amount_field: Option<String>,
        /// Restrict approvals to these step names
        #[arg(long)]
        step: Vec<String>,
        #[arg(long)]
        require_reasoning: bool,
        /// Grant lifetime in hours
        #[arg(long)]
        expires_in_hours: Option<i64>,
    },
    /// Revoke an agent permission grant
    Revoke {
        grant: String,
    },
    /// Manage per-template secrets
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum SecretAction {
    /// Encrypt and store a secret for a template
    Set {
        template: String,
        name: String,
        value: String,
    },
    /// List secret names for a template
    List {
        template: String,
    },
    /// Print a fresh base64 master key for `[secrets] master_key`
    Generate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("trellis=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Commands that need no config or database
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "trellis", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Secret {
            action: SecretAction::Generate,
        } => {
            println!("{}", SecretResolver::generate_master_key());
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(&cli.config)?;
    let engine = Arc::new(WorkflowEngine::open(config)?);

    match cli.command {
        Commands::Serve => serve(engine).await?,
        Commands::Publish { file } => {
            let definition = read_template(&file)?;
            let template = engine.publish_template(&definition)?;
            println!(
                "Published {} v{} ({})",
                template.name(),
                template.version,
                template.id
            );
        }
        Commands::Templates { tenant } => {
            let templates = engine.list_templates(tenant.as_deref())?;
            if templates.is_empty() {
                println!("No templates.");
            }
            for t in templates {
                println!(
                    "{}  {}/{}  v{}  {}",
                    t.id,
                    t.tenant(),
                    t.name(),
                    t.version,
                    if t.active { "active" } else { "inactive" }
                );
            }
        }
        Commands::Activate { template } => {
            let template = resolve_template(&engine, &template, "default")?;
            engine.set_template_active(&template.id, true)?;
            println!("{} is active", template.name());
        }
        Commands::Deactivate { template } => {
            let template = resolve_template(&engine, &template, "default")?;
            engine.set_template_active(&template.id, false)?;
            println!("{} is inactive", template.name());
        }
        Commands::Start {
            template,
            payload,
            tenant,
            initiator,
        } => {
            let template = resolve_template(&engine, &template, &tenant)?;
            let payload: Value =
                serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            let id = engine.start_instance(&template.id, payload, Actor::user(initiator))?;
            let status = engine.drive(&id).await?;
            println!("{}  {}", id, status);
        }
        Commands::Instances {
            status,
            template,
            limit,
        } => {
            let filter = InstanceFilter {
                tenant: None,
                template_id: template
                    .map(|t| resolve_template(&engine, &t, "default"))
                    .transpose()?
                    .map(|t| t.id),
                status: status
                    .as_deref()
                    .map(str::parse::<InstanceStatus>)
                    .transpose()?,
                limit: Some(limit),
            };
            let instances = engine.list_instances(&filter)?;
            if instances.is_empty() {
                println!("No instances.");
            }
            for inst in instances {
                println!(
                    "{}  {:<10} step {}  {}",
                    inst.id,
                    inst.status,
                    inst.step_index,
                    inst.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Show { instance } => {
            let id = InstanceId::from_string(&instance);
            let inst = engine.get_instance(&id)?;
            let steps = engine.list_steps(&id)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "instance": inst,
                    "steps": steps,
                }))?
            );
        }
        Commands::Decide {
            instance,
            step,
            decision,
            decider,
            agent,
            role,
            reason,
            reasoning,
        } => {
            let decision: Decision = decision.parse()?;
            let mut actor = if agent {
                Actor::agent(decider)
            } else {
                Actor::user(decider)
            };
            actor.roles = role;
            let id = InstanceId::from_string(&instance);
            let status = engine
                .decide(&id, step, &actor, decision, reason, reasoning)
                .await?;
            println!("{}  {}", id, status);
        }
        Commands::Cancel { instance } => {
            let id = InstanceId::from_string(&instance);
            let status = engine.cancel(&id)?;
            if status == InstanceStatus::Running {
                println!("{}  cancel requested; takes effect at the next step boundary", id);
            } else {
                println!("{}  {}", id, status);
            }
        }
        Commands::Signal { instance, data } => {
            let data: Map<String, Value> =
                serde_json::from_str(&data).context("signal data must be a JSON object")?;
            let id = InstanceId::from_string(&instance);
            let status = engine.signal(&id, data).await?;
            println!("{}  {}", id, status);
        }
        Commands::Sweep => {
            let report = engine.sweep_once()?;
            println!(
                "Timed out {} step(s) and {} instance(s)",
                report.timed_out_steps.len(),
                report.timed_out_instances.len()
            );
        }
        Commands::Grant {
            agent,
            template,
            initiate,
            approve,
            max_amount,
            amount_field,
            step,
            require_reasoning,
            expires_in_hours,
        } => {
            if !initiate && !approve {
                bail!("pass --initiate, --approve or both");
            }
            let template = resolve_template(&engine, &template, "default")?;
            let mut conditions = PermissionConditions {
                max_amount,
                allowed_steps: step,
                require_reasoning,
                ..Default::default()
            };
            if let Some(field) = amount_field {
                conditions.amount_field = field;
            }
            let mut grant = AgentPermission::new(agent, &template.id).with_conditions(conditions);
            grant.can_initiate = initiate;
            grant.can_approve = approve;
            grant.expires_at = expires_in_hours.map(|h| Utc::now() + Duration::hours(h));
            let grant = engine.grant_permission(grant)?;
            println!("Granted {} on {} ({})", grant.agent_id, template.name(), grant.id);
        }
        Commands::Revoke { grant } => {
            if engine.revoke_permission(&grant)? {
                println!("Revoked {}", grant);
            } else {
                bail!("no grant with id {}", grant);
            }
        }
        Commands::Secret { action } => match action {
            SecretAction::Set {
                template,
                name,
                value,
            } => {
                let template = resolve_template(&engine, &template, "default")?;
                engine.store_secret(&template.id, &name, &value)?;
                println!("Stored secret {} for {}", name, template.name());
            }
            SecretAction::List { template } => {
                let template = resolve_template(&engine, &template, "default")?;
                for name in engine.list_secrets(&template.id)? {
                    println!("{}", name);
                }
            }
            SecretAction::Generate => unreachable!("handled before config load"),
        },
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Run every long-lived component until Ctrl-C.
async fn serve(engine: Arc<WorkflowEngine>) -> anyhow::Result<()> {
    let config = engine.config().clone();
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    // Graceful shutdown on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        cancel_clone.cancel();
    });

    let mut tasks = Vec::new();

    if config.audit.enabled {
        let audit = AuditLog::new(config.audit_dir());
        tasks.push(tokio::spawn(
            audit.run(engine.event_bus().clone(), cancel.clone()),
        ));
    }

    let pool = engine.worker_pool();
    let pool_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move { pool.run(pool_cancel).await }));

    if config.sweeper.enabled {
        let sweeper_engine = engine.clone();
        let sweeper_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            sweeper_engine.sweeper().run(sweeper_cancel).await
        }));
    } else {
        warn!("Timeout sweeper disabled; expired waits will not be timed out");
    }

    match config.gateway.clone() {
        Some(gateway_config) => {
            info!(bind = %gateway_config.bind, "Starting HTTP gateway");
            let server = GatewayServer::new(gateway_config, engine.clone());
            if let Err(e) = server.run(cancel.clone()).await {
                error!(error = %e, "Gateway server error");
                cancel.cancel();
            }
        }
        None => {
            info!("No [gateway] configured; running workers only");
            cancel.cancelled().await;
        }
    }

    for task in tasks {
        task.await.ok();
    }
    info!("Trellis stopped");
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".trellis").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

/// Parse a template file; `.json` files as JSON, anything else as TOML.
fn read_template(path: &Path) -> anyhow::Result<TemplateDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let definition = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content)?
    } else {
        toml::from_str(&content)?
    };
    Ok(definition)
}

/// Look a template up by id, falling back to its name within `tenant`.
fn resolve_template(
    engine: &WorkflowEngine,
    key: &str,
    tenant: &str,
) -> anyhow::Result<WorkflowTemplate> {
    if let Ok(template) = engine.get_template(&TemplateId::from_string(key)) {
        return Ok(template);
    }
    engine
        .find_template(tenant, key)?
        .with_context(|| format!("no template with id or name '{}'", key))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
