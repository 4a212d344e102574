use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{StepKind, StepType, WaitConfig, WakeCondition};

use super::{Resolution, StepContext, StepFailure, StepOutcome, StepStrategy, Suspension};
use crate::expr::Expression;
use crate::render::render_str;

/// Next fire time of `expr` strictly after `after`.
///
/// Accepts the usual five-field form as well as the six/seven-field form
/// with seconds.
pub fn next_cron_fire(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    };
    let schedule = Schedule::from_str(&normalized)
        .map_err(|e| TrellisError::Validation(format!("invalid cron '{}': {}", expr, e)))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| TrellisError::Validation(format!("cron '{}' never fires", expr)))
}

/// Suspends until a wall-clock time or until a context condition holds.
pub struct WaitStrategy;

impl WaitStrategy {
    /// Earliest of the configured wall-clock times, if any.
    fn wake_time(cfg: &WaitConfig, ctx: &StepContext<'_>) -> Result<Option<DateTime<Utc>>> {
        let mut times = Vec::new();
        if let Some(until) = &cfg.until {
            let rendered = render_str(until, ctx.context.data())?;
            let at = DateTime::parse_from_rfc3339(rendered.trim())
                .map_err(|e| {
                    TrellisError::Validation(format!("wait until '{}' is not RFC 3339: {}", rendered, e))
                })?
                .with_timezone(&Utc);
            times.push(at);
        }
        if let Some(secs) = cfg.duration_secs {
            times.push(ctx.now + Duration::seconds(secs as i64));
        }
        if let Some(expr) = &cfg.cron {
            times.push(next_cron_fire(expr, ctx.now)?);
        }
        Ok(times.into_iter().min())
    }
}

impl StepStrategy for WaitStrategy {
    fn step_type(&self) -> StepType {
        StepType::Wait
    }

    fn execute<'a>(&'a self, ctx: StepContext<'a>) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            let StepKind::Wait(cfg) = &ctx.step.config_snapshot.kind else {
                return StepOutcome::Failed(StepFailure::fatal("not a wait step"));
            };
            let wake_at = match Self::wake_time(cfg, &ctx) {
                Ok(t) => t,
                Err(e) => return e.into(),
            };
            let deadline = ctx
                .step
                .config_snapshot
                .timeout_secs
                .map(|secs| ctx.now + Duration::seconds(secs as i64));

            if let Some(source) = &cfg.condition {
                let expression = match Expression::parse(source) {
                    Ok(e) => e,
                    Err(e) => return e.into(),
                };
                if expression.evaluate(ctx.context.data()) {
                    return StepOutcome::Resolved(Resolution::output_only(Value::Null));
                }
                if matches!(wake_at, Some(at) if at <= ctx.now) {
                    return StepOutcome::Resolved(Resolution::output_only(Value::Null));
                }
                debug!(instance_id = %ctx.instance.id, step = %ctx.step.step_name, "Waiting for condition");
                return StepOutcome::Suspended(Suspension::new(
                    WakeCondition::Expression {
                        expression: source.clone(),
                        not_after: wake_at,
                    },
                    deadline,
                ));
            }

            match wake_at {
                Some(at) if at > ctx.now => {
                    debug!(instance_id = %ctx.instance.id, step = %ctx.step.step_name, wake_at = %at, "Waiting");
                    StepOutcome::Suspended(Suspension::new(WakeCondition::Timer { at }, deadline))
                }
                _ => StepOutcome::Resolved(Resolution::output_only(Value::Null)),
            }
        })
    }
}
