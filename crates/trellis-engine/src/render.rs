//! `{{path}}` substitution of context values into step parameters.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use trellis_core::error::{Result, TrellisError};

use crate::expr::lookup;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][\w.]*)\s*\}\}").expect("valid regex"))
}

/// Render every string inside `template`.
///
/// A string consisting of exactly one placeholder is replaced by the
/// referenced value with its JSON type intact; placeholders embedded in
/// longer strings are stringified. A placeholder whose path is missing is
/// an error.
pub fn render_value(template: &Value, data: &Map<String, Value>) -> Result<Value> {
    match template {
        Value::String(s) => render_string_value(s, data),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, data))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, data)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Render a string, always producing a string.
pub fn render_str(template: &str, data: &Map<String, Value>) -> Result<String> {
    let mut missing = None;
    let rendered = placeholder().replace_all(template, |caps: &regex::Captures<'_>| {
        let path = &caps[1];
        match lookup(data, path) {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => {
                missing.get_or_insert_with(|| path.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(path) => Err(TrellisError::Validation(format!(
            "template placeholder '{{{{{}}}}}' has no value in context",
            path
        ))),
        None => Ok(rendered.into_owned()),
    }
}

fn render_string_value(s: &str, data: &Map<String, Value>) -> Result<Value> {
    let trimmed = s.trim();
    if let Some(caps) = placeholder().captures(trimmed) {
        if caps.get(0).is_some_and(|m| m.as_str().len() == trimmed.len()) {
            let path = &caps[1];
            return lookup(data, path).cloned().ok_or_else(|| {
                TrellisError::Validation(format!(
                    "template placeholder '{{{{{}}}}}' has no value in context",
                    path
                ))
            });
        }
    }
    render_str(s, data).map(Value::String)
}

/// Whether a string contains at least one placeholder.
pub fn has_placeholder(s: &str) -> bool {
    placeholder().is_match(s)
}
