use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Accumulated key/value state of one workflow instance.
///
/// Seeded from the trigger payload and grown by step outputs. Keys are only
/// ever added or overwritten, never removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowContext {
    data: Map<String, Value>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a trigger payload. Non-object payloads land under `payload`.
    pub fn from_payload(payload: &Value) -> Self {
        match payload {
            Value::Object(map) => Self { data: map.clone() },
            Value::Null => Self::default(),
            other => {
                let mut data = Map::new();
                data.insert("payload".to_string(), other.clone());
                Self { data }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Resolve a dotted path such as `invoice.lines.0.amount`.
    ///
    /// Numeric segments index into arrays.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.data.get(first)?;
        for seg in segments {
            current = match current {
                Value::Object(map) => map.get(seg)?,
                Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Merge a patch into this context (overwrites on conflict).
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        for (k, v) in patch {
            self.data.insert(k.clone(), v.clone());
        }
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
