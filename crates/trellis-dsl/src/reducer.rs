//! State reducers: how a node's update for a field is folded into state.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Fold `update` into `current` (`Value::Null` when the field is unset).
pub type Reducer = Arc<dyn Fn(&Value, Value) -> Value + Send + Sync>;

/// Name of the overwrite reducer
pub const DEFAULT_REDUCER: &str = "default";

/// Replace the current value.
pub fn overwrite(_current: &Value, update: Value) -> Value {
    update
}

/// Concatenate arrays; a scalar update is appended as one element.
pub fn append(current: &Value, update: Value) -> Value {
    let mut items = match current {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    };
    match update {
        Value::Array(more) => items.extend(more),
        Value::Null => {}
        one => items.push(one),
    }
    Value::Array(items)
}

/// Append chat messages. An object `{"replace": [...]}` swaps the whole list.
pub fn messages(current: &Value, update: Value) -> Value {
    if let Value::Object(map) = &update {
        if let Some(Value::Array(replacement)) = map.get("replace") {
            return Value::Array(replacement.clone());
        }
    }
    append(current, update)
}

/// Shallow-merge objects; keys in the update win.
pub fn merge(current: &Value, update: Value) -> Value {
    match (current, update) {
        (Value::Object(base), Value::Object(more)) => {
            let mut merged = base.clone();
            merged.extend(more);
            Value::Object(merged)
        }
        (_, update) => update,
    }
}

/// Append strings only; non-string elements are dropped.
pub fn string_slice(current: &Value, update: Value) -> Value {
    match append(current, update) {
        Value::Array(items) => Value::Array(items.into_iter().filter(Value::is_string).collect()),
        other => other,
    }
}

/// Named reducers available to state variables and node outputs.
#[derive(Clone)]
pub struct ReducerRegistry {
    reducers: BTreeMap<String, Reducer>,
}

impl fmt::Debug for ReducerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReducerRegistry").field("names", &self.names()).finish()
    }
}

impl Default for ReducerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReducerRegistry {
    /// Registry with `default`, `append`, `message`, `merge` and `string_slice`.
    pub fn new() -> Self {
        let mut reducers: BTreeMap<String, Reducer> = BTreeMap::new();
        reducers.insert(DEFAULT_REDUCER.to_string(), Arc::new(overwrite));
        reducers.insert("append".to_string(), Arc::new(append));
        reducers.insert("message".to_string(), Arc::new(messages));
        reducers.insert("merge".to_string(), Arc::new(merge));
        reducers.insert("string_slice".to_string(), Arc::new(string_slice));
        Self { reducers }
    }

    /// Add or replace a reducer
    pub fn register(&mut self, name: impl Into<String>, reducer: Reducer) {
        self.reducers.insert(name.into(), reducer);
    }

    /// Reducer by name
    pub fn get(&self, name: &str) -> Option<Reducer> {
        self.reducers.get(name).cloned()
    }

    /// Resolve an optional name; absent or empty means overwrite.
    pub fn resolve(&self, name: Option<&str>) -> Option<Reducer> {
        match name.map(str::trim) {
            None | Some("") => self.get(DEFAULT_REDUCER),
            Some(name) => self.get(name),
        }
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.reducers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn append_handles_scalars_and_arrays() {
        assert_eq!(append(&Value::Null, json!(1)), json!([1]));
        assert_eq!(append(&json!([1]), json!([2, 3])), json!([1, 2, 3]));
        assert_eq!(append(&json!("a"), json!("b")), json!(["a", "b"]));
    }

    #[test]
    fn merge_is_shallow() {
        let merged = merge(&json!({"a": {"x": 1}, "b": 2}), json!({"a": {"y": 2}}));
        assert_eq!(merged, json!({"a": {"y": 2}, "b": 2}));
        assert_eq!(merge(&json!(3), json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn messages_can_be_replaced() {
        let current = json!([{"role": "user", "content": "hi"}]);
        let appended = messages(&current, json!([{"role": "assistant", "content": "hello"}]));
        assert_eq!(appended.as_array().unwrap().len(), 2);
        let replaced = messages(&current, json!({"replace": []}));
        assert_eq!(replaced, json!([]));
    }

    #[test]
    fn string_slice_keeps_strings() {
        assert_eq!(string_slice(&json!(["a"]), json!([1, "b", null])), json!(["a", "b"]));
    }

    #[test]
    fn registry_resolution() {
        let registry = ReducerRegistry::new();
        assert!(registry.resolve(None).is_some());
        assert!(registry.resolve(Some("")).is_some());
        assert!(registry.resolve(Some("merge")).is_some());
        assert!(registry.resolve(Some("median")).is_none());
        assert_eq!(registry.names(), vec!["append", "default", "merge", "message", "string_slice"]);
    }
}
