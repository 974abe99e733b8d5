//! State schema and its inference from a graph document.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{error_codes, ValidationError};
use crate::graph::{node_types, Graph, TargetKind};
use crate::reducer::{Reducer, ReducerRegistry};
use crate::registry::ComponentRegistry;

/// Conversation so far
pub const STATE_KEY_MESSAGES: &str = "messages";
/// Text the run was started with
pub const STATE_KEY_USER_INPUT: &str = "user_input";
/// Latest assistant text
pub const STATE_KEY_LAST_RESPONSE: &str = "last_response";
/// Assistant text per node id
pub const STATE_KEY_NODE_RESPONSES: &str = "node_responses";
/// Structured output per node id
pub const STATE_KEY_NODE_STRUCTURED: &str = "node_structured";
/// Decision of the last user approval node
pub const STATE_KEY_APPROVAL_RESULT: &str = "approval_result";
/// Reserved for the execution context; never stored in state
pub const STATE_KEY_EXEC_CONTEXT: &str = "__exec_context__";

/// One state field
#[derive(Clone)]
pub struct StateField {
    /// Value kind hint
    pub kind: String,
    /// How updates are folded in
    pub reducer: Reducer,
    /// Initial value
    pub default: Option<Value>,
    /// Declared as required by a component
    pub required: bool,
}

impl fmt::Debug for StateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateField")
            .field("kind", &self.kind)
            .field("default", &self.default)
            .field("required", &self.required)
            .finish()
    }
}

/// Fields known to a compiled graph
#[derive(Debug, Clone, Default)]
pub struct StateSchema {
    fields: BTreeMap<String, StateField>,
}

impl StateSchema {
    /// Empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, keeping any existing definition
    pub fn add_field_if_absent(&mut self, name: impl Into<String>, field: StateField) {
        self.fields.entry(name.into()).or_insert(field);
    }

    /// Field by name
    pub fn field(&self, name: &str) -> Option<&StateField> {
        self.fields.get(name)
    }

    /// Field names, sorted
    pub fn names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    /// Initial run state: defaults overlaid with the caller's values.
    pub fn initial_state(&self, input: Map<String, Value>) -> Map<String, Value> {
        let mut state: Map<String, Value> = self
            .fields
            .iter()
            .filter_map(|(name, field)| field.default.clone().map(|d| (name.clone(), d)))
            .collect();
        for (key, value) in input {
            if key != STATE_KEY_EXEC_CONTEXT {
                state.insert(key, value);
            }
        }
        state
    }

    /// Fold a node update into state through the field reducers.
    /// Unknown fields are overwritten.
    pub fn apply(&self, state: &mut Map<String, Value>, update: Map<String, Value>) {
        for (key, value) in update {
            if key == STATE_KEY_EXEC_CONTEXT {
                continue;
            }
            let next = match self.fields.get(&key) {
                Some(field) => {
                    let current = state.get(&key).cloned().unwrap_or(Value::Null);
                    (field.reducer)(&current, value)
                }
                None => value,
            };
            state.insert(key, next);
        }
    }
}

fn default_for_kind(kind: &str) -> Option<Value> {
    match kind {
        "string" => Some(json!("")),
        "number" => Some(json!(0)),
        "boolean" => Some(json!(false)),
        "object" => Some(json!({})),
        "array" => Some(json!([])),
        _ => None,
    }
}

fn builtin_field(reducers: &ReducerRegistry, kind: &str, reducer: &str, default: Option<Value>) -> StateField {
    StateField {
        kind: kind.to_string(),
        reducer: reducers
            .get(reducer)
            .unwrap_or_else(|| std::sync::Arc::new(crate::reducer::overwrite)),
        default,
        required: false,
    }
}

fn resolve_reducer(
    reducers: &ReducerRegistry,
    name: Option<&str>,
    node_id: Option<&str>,
    field: &str,
) -> Result<Reducer, ValidationError> {
    reducers.resolve(name).ok_or_else(|| {
        let err = ValidationError::new(
            error_codes::UNKNOWN_REDUCER,
            format!("unknown reducer {:?} for state field {}", name.unwrap_or_default(), field),
        )
        .in_field(field.to_string());
        match node_id {
            Some(id) => err.at_node(id),
            None => err,
        }
    })
}

/// Infer the state schema of a graph.
///
/// Builtin fields come first, then declared state variables. Component
/// output metadata and node outputs targeting state only add fields that
/// are not declared explicitly.
pub fn infer_schema(
    graph: &Graph,
    components: &ComponentRegistry,
    reducers: &ReducerRegistry,
) -> Result<StateSchema, ValidationError> {
    let mut schema = StateSchema::new();

    schema.add_field_if_absent(STATE_KEY_MESSAGES, builtin_field(reducers, "array", "message", Some(json!([]))));
    schema.add_field_if_absent(STATE_KEY_USER_INPUT, builtin_field(reducers, "string", "default", None));
    schema.add_field_if_absent(STATE_KEY_LAST_RESPONSE, builtin_field(reducers, "string", "default", None));
    schema.add_field_if_absent(STATE_KEY_NODE_RESPONSES, builtin_field(reducers, "object", "merge", Some(json!({}))));
    schema.add_field_if_absent(STATE_KEY_NODE_STRUCTURED, builtin_field(reducers, "object", "merge", Some(json!({}))));

    for var in &graph.state_variables {
        let name = var.name.trim();
        if name.is_empty() {
            continue;
        }
        let kind = var.kind.clone().unwrap_or_else(|| "opaque".to_string());
        let reducer = resolve_reducer(reducers, var.reducer.as_deref(), None, name)?;
        let default = var.default.clone().or_else(|| default_for_kind(&kind));
        schema.add_field_if_absent(name, StateField { kind, reducer, default, required: false });
    }

    for node in &graph.nodes {
        if let Some(component) = components.get(&node.node_type) {
            for output in component.metadata().outputs {
                let reducer = resolve_reducer(reducers, output.reducer.as_deref(), Some(&node.id), &output.name)?;
                schema.add_field_if_absent(
                    output.name.clone(),
                    StateField {
                        kind: output.kind.clone(),
                        reducer,
                        default: output.default.clone(),
                        required: output.required,
                    },
                );
            }
        }

        if node.node_type == node_types::WHILE {
            continue;
        }
        for output in &node.outputs {
            let Some(target) = &output.target else { continue };
            if target.kind != TargetKind::State {
                continue;
            }
            let field = target.field.clone().unwrap_or_else(|| output.name.clone());
            let reducer = resolve_reducer(reducers, output.reducer.as_deref(), Some(&node.id), &field)?;
            schema.add_field_if_absent(
                field,
                StateField {
                    kind: output.type_hint.clone().unwrap_or_else(|| "opaque".to_string()),
                    reducer,
                    default: None,
                    required: output.required,
                },
            );
        }
    }

    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{IOTarget, Node, NodeIO, StateVariable};
    use pretty_assertions::assert_eq;

    fn graph_with(vars: Vec<StateVariable>, nodes: Vec<Node>) -> Graph {
        Graph { version: "1".into(), state_variables: vars, nodes, ..Default::default() }
    }

    #[test]
    fn builtin_fields_are_always_present() {
        let schema = infer_schema(&Graph::default(), &ComponentRegistry::new(), &ReducerRegistry::new()).unwrap();
        assert_eq!(
            schema.names(),
            vec!["last_response", "messages", "node_responses", "node_structured", "user_input"]
        );
        let state = schema.initial_state(Map::new());
        assert_eq!(Value::Object(state), json!({"messages": [], "node_responses": {}, "node_structured": {}}));
    }

    #[test]
    fn declared_variables_get_kind_defaults_and_reducers() {
        let graph = graph_with(
            vec![
                StateVariable { name: "counter".into(), kind: Some("number".into()), ..Default::default() },
                StateVariable {
                    name: "log".into(),
                    kind: Some("array".into()),
                    reducer: Some("append".into()),
                    ..Default::default()
                },
            ],
            vec![],
        );
        let schema = infer_schema(&graph, &ComponentRegistry::new(), &ReducerRegistry::new()).unwrap();
        let mut state = schema.initial_state(Map::new());
        assert_eq!(state.get("counter"), Some(&json!(0)));

        let mut update = Map::new();
        update.insert("log".into(), json!("first"));
        update.insert("counter".into(), json!(3));
        schema.apply(&mut state, update);
        let mut update = Map::new();
        update.insert("log".into(), json!("second"));
        schema.apply(&mut state, update);

        assert_eq!(state.get("log"), Some(&json!(["first", "second"])));
        assert_eq!(state.get("counter"), Some(&json!(3)));
    }

    #[test]
    fn unknown_reducer_is_an_error() {
        let graph = graph_with(
            vec![StateVariable { name: "x".into(), reducer: Some("median".into()), ..Default::default() }],
            vec![],
        );
        let err = infer_schema(&graph, &ComponentRegistry::new(), &ReducerRegistry::new()).unwrap_err();
        assert_eq!(err.code, error_codes::UNKNOWN_REDUCER);
        assert_eq!(err.field.as_deref(), Some("x"));
    }

    #[test]
    fn outputs_add_fields_without_overriding_declarations() {
        let node = Node {
            id: "t".into(),
            node_type: node_types::TRANSFORM.into(),
            outputs: vec![NodeIO {
                name: "result".into(),
                target: Some(IOTarget { kind: TargetKind::State, field: Some("tags".into()) }),
                reducer: Some("append".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let graph = graph_with(
            vec![StateVariable { name: "tags".into(), kind: Some("array".into()), ..Default::default() }],
            vec![node],
        );
        let schema = infer_schema(&graph, &ComponentRegistry::with_builtins(), &ReducerRegistry::new()).unwrap();
        assert!(schema.field("result").is_some());

        let mut state = schema.initial_state(Map::new());
        let mut update = Map::new();
        update.insert("tags".into(), json!(["a"]));
        schema.apply(&mut state, update);
        let mut update = Map::new();
        update.insert("tags".into(), json!(["b"]));
        schema.apply(&mut state, update);
        // declared field keeps overwrite semantics
        assert_eq!(state.get("tags"), Some(&json!(["b"])));
    }

    #[test]
    fn exec_context_key_is_never_stored() {
        let schema = StateSchema::new();
        let mut input = Map::new();
        input.insert(STATE_KEY_EXEC_CONTEXT.into(), json!({"x": 1}));
        let mut state = schema.initial_state(input.clone());
        assert!(state.is_empty());
        schema.apply(&mut state, input);
        assert!(state.is_empty());
    }
}
