use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Per-step form values keyed by step number.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepAnswers {
    steps: BTreeMap<u32, Value>,
}

impl StepAnswers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, step: u32) -> Option<&Value> {
        self.steps.get(&step)
    }

    pub fn insert(&mut self, step: u32, answer: Value) -> Option<Value> {
        self.steps.insert(step, answer)
    }

    /// True when the step has no answer or only a structurally empty one.
    pub fn is_empty_for(&self, step: u32) -> bool {
        self.get(step).is_none_or(is_structurally_empty)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn retain(&mut self, keep: impl FnMut(&u32, &mut Value) -> bool) {
        self.steps.retain(keep);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Value)> {
        self.steps.iter().map(|(step, value)| (*step, value))
    }
}

/// `null`, `{}` and `[]` carry no user input.
pub fn is_structurally_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Layers `prefill` under `user`: populated user values always win, null or
/// missing user fields take the prefill value, and objects merge key by key.
pub fn merge_prefill(user: &Value, prefill: &Value) -> Value {
    match (user, prefill) {
        (Value::Null, _) => prefill.clone(),
        (Value::Object(user_fields), Value::Object(prefill_fields)) => {
            Value::Object(merge_objects(user_fields, prefill_fields))
        }
        (Value::Array(items), Value::Array(_)) if items.is_empty() => prefill.clone(),
        _ => user.clone(),
    }
}

fn merge_objects(user: &Map<String, Value>, prefill: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = user.clone();
    for (key, prefill_value) in prefill {
        let value = match user.get(key) {
            Some(user_value) => merge_prefill(user_value, prefill_value),
            None => prefill_value.clone(),
        };
        merged.insert(key.clone(), value);
    }
    merged
}
