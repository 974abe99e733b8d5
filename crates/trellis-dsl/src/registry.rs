//! Component registry.
//!
//! Node types that are not handled natively by the runtime resolve to a
//! registered [`Component`]. The registry is populated before compilation
//! and read-only afterwards.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use trellis_core::{Context, CoreError, Result};

use crate::graph::node_types;

/// One declared parameter of a component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParameterSpec {
    /// Parameter name
    pub name: String,

    /// `string`, `number`, `boolean`, `object`, `array` or `opaque`
    #[serde(default)]
    pub kind: String,

    /// Must be present
    #[serde(default)]
    pub required: bool,

    /// Fallback value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Reducer for the matching state field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer: Option<String>,
}

impl ParameterSpec {
    /// Parameter with a name and kind
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { name: name.into(), kind: kind.into(), ..Default::default() }
    }
}

/// Static description of a component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ComponentMetadata {
    /// Node type name the component answers to
    pub name: String,

    /// What the component does
    #[serde(default)]
    pub description: String,

    /// State fields read
    #[serde(default)]
    pub inputs: Vec<ParameterSpec>,

    /// Fields produced
    #[serde(default)]
    pub outputs: Vec<ParameterSpec>,
}

impl ComponentMetadata {
    /// Output parameter by name
    pub fn output(&self, name: &str) -> Option<&ParameterSpec> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

/// A reusable node implementation.
#[async_trait]
pub trait Component: Send + Sync {
    /// Static description
    fn metadata(&self) -> ComponentMetadata;

    /// Check a node's config at compile time
    fn validate(&self, _config: &Map<String, Value>) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Run with the node's config against the current state; returns output values by name.
    async fn execute(&self, ctx: &Context, config: &Map<String, Value>, state: &Value) -> Result<Map<String, Value>>;
}

/// Components by node type name
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    components: BTreeMap<String, Arc<dyn Component>>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry").field("names", &self.names()).finish()
    }
}

impl ComponentRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the builtin components (`builtin.transform`)
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TransformComponent));
        registry
    }

    /// Register under the component's metadata name, replacing any previous one
    pub fn register(&mut self, component: Arc<dyn Component>) {
        let name = component.metadata().name;
        debug!(component = %name, "registering component");
        self.components.insert(name, component);
    }

    /// Component by node type
    pub fn get(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.components.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.components.keys().cloned().collect()
    }
}

/// `builtin.transform`: evaluates one expression over state and emits it as `result`.
///
/// Config: `expr` (required) and `language`, either `jexl` (default, the
/// graph's expression language with `state.*` bound) or `jmespath`
/// (evaluated directly against the state object).
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformComponent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransformLanguage {
    Jexl,
    JmesPath,
}

impl TransformComponent {
    fn parse(config: &Map<String, Value>) -> std::result::Result<(TransformLanguage, String), String> {
        let expr = config
            .get("expr")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| "expr is required".to_string())?;
        let language = match config.get("language").and_then(Value::as_str).unwrap_or("jexl") {
            "jexl" | "" => TransformLanguage::Jexl,
            "jmespath" => TransformLanguage::JmesPath,
            other => return Err(format!("unsupported language {:?}", other)),
        };
        Ok((language, expr.to_string()))
    }
}

#[async_trait]
impl Component for TransformComponent {
    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            name: node_types::TRANSFORM.to_string(),
            description: "Evaluate an expression over state".to_string(),
            inputs: vec![],
            outputs: vec![ParameterSpec::new("result", "opaque")],
        }
    }

    fn validate(&self, config: &Map<String, Value>) -> std::result::Result<(), String> {
        let (language, expr) = Self::parse(config)?;
        match language {
            TransformLanguage::Jexl => trellis_core::compile(&expr).map(|_| ()).map_err(|e| e.to_string()),
            TransformLanguage::JmesPath => jmespath::compile(&expr)
                .map(|_| ())
                .map_err(|e| format!("Failed to compile JMESPath expression: {}", e)),
        }
    }

    async fn execute(&self, _ctx: &Context, config: &Map<String, Value>, state: &Value) -> Result<Map<String, Value>> {
        let (language, expr) = Self::parse(config).map_err(CoreError::ValidationError)?;
        let result = match language {
            TransformLanguage::Jexl => trellis_core::eval(&expr, state, &json!({}))?,
            TransformLanguage::JmesPath => {
                let compiled = jmespath::compile(&expr).map_err(|e| {
                    CoreError::ExpressionError(format!("Failed to compile JMESPath expression: {}", e))
                })?;
                let found = compiled.search(state).map_err(|e| {
                    CoreError::ExpressionError(format!("Failed to evaluate JMESPath expression: {}", e))
                })?;
                serde_json::to_value(&*found)?
            }
        };
        let mut out = Map::new();
        out.insert("result".to_string(), result);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn builtins_contain_transform() {
        let registry = ComponentRegistry::with_builtins();
        assert_eq!(registry.names(), vec![node_types::TRANSFORM]);
        assert!(registry.get("custom.missing").is_none());
    }

    #[test]
    fn transform_validation() {
        let transform = TransformComponent;
        assert_eq!(transform.validate(&Map::new()).unwrap_err(), "expr is required");
        assert!(transform.validate(&config(json!({"expr": "state.a +"}))).is_err());
        assert!(transform.validate(&config(json!({"expr": "items[?", "language": "jmespath"}))).is_err());
        assert!(transform.validate(&config(json!({"expr": "x", "language": "cel"}))).is_err());
        assert!(transform.validate(&config(json!({"expr": "state.a + 1"}))).is_ok());
    }

    #[tokio::test]
    async fn transform_evaluates_jexl() {
        let out = TransformComponent
            .execute(&Context::new(), &config(json!({"expr": "state.count * 2"})), &json!({"count": 21}))
            .await
            .unwrap();
        assert_eq!(out.get("result").and_then(Value::as_f64), Some(42.0));
    }

    #[tokio::test]
    async fn transform_evaluates_jmespath() {
        let state = json!({"items": [{"name": "a", "ok": true}, {"name": "b", "ok": false}]});
        let out = TransformComponent
            .execute(
                &Context::new(),
                &config(json!({"expr": "items[?ok].name", "language": "jmespath"})),
                &state,
            )
            .await
            .unwrap();
        assert_eq!(out.get("result"), Some(&json!(["a"])));
    }
}
