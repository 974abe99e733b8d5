use serde_json::{Map, Value};

use trellis_core::BoolProgram;

use crate::error::{error_codes, DslError, Result, ValidationError};
use crate::graph::ConditionalEdge;
use crate::runtime::input_view;

/// One compiled routing case
pub struct CompiledCase {
    /// Case name, for logs
    pub name: String,
    /// Predicate over `(state, input)`
    pub predicate: BoolProgram,
    /// Target node id
    pub target: String,
}

/// Conditional edge with every predicate compiled
pub struct CompiledCondition {
    /// Source node
    pub from: String,
    /// Cases in document order
    pub cases: Vec<CompiledCase>,
    /// Fallback target
    pub default: Option<String>,
}

impl std::fmt::Debug for CompiledCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCondition")
            .field("from", &self.from)
            .field("cases", &self.cases.iter().map(|c| (&c.name, &c.target)).collect::<Vec<_>>())
            .field("default", &self.default)
            .finish()
    }
}

impl CompiledCondition {
    pub(crate) fn compile(edge: &ConditionalEdge) -> std::result::Result<Self, ValidationError> {
        if edge.condition.cases.is_empty() && edge.condition.default.is_none() {
            return Err(ValidationError::new(
                error_codes::MISSING_REQUIRED_FIELD,
                format!("conditional edge from {} has no cases", edge.from),
            )
            .at_node(edge.from.clone())
            .in_field("condition.cases"));
        }
        let mut cases = Vec::with_capacity(edge.condition.cases.len());
        for (i, case) in edge.condition.cases.iter().enumerate() {
            let name = case.name.clone().unwrap_or_else(|| format!("case_{}", i));
            let predicate = trellis_core::compile_bool(&case.predicate.expression).map_err(|e| {
                ValidationError::new(
                    error_codes::INVALID_EXPRESSION,
                    format!("invalid predicate for case {} on edge from {}: {}", name, edge.from, e),
                )
                .at_node(edge.from.clone())
                .in_field(format!("condition.cases[{}].predicate", i))
            })?;
            cases.push(CompiledCase { name, predicate, target: case.target.clone() });
        }
        Ok(Self { from: edge.from.clone(), cases, default: edge.condition.default.clone() })
    }

    /// Every node this edge can route to
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.cases.iter().map(|c| c.target.as_str()).chain(self.default.as_deref())
    }

    /// Pick the target for the current state. `input` is the source node's
    /// structured output.
    pub fn route(&self, state: &Map<String, Value>) -> Result<String> {
        let input = input_view(state, &self.from);
        let state_value = Value::Object(state.clone());
        for case in &self.cases {
            let matched = case.predicate.eval(&state_value, &input).map_err(|source| DslError::NodeFailed {
                node_id: self.from.clone(),
                source,
            })?;
            if matched {
                tracing::debug!(from = %self.from, case = %case.name, target = %case.target, "conditional route");
                return Ok(case.target.clone());
            }
        }
        self.default.clone().ok_or_else(|| DslError::NoRoute(self.from.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn edge(value: Value) -> ConditionalEdge {
        serde_json::from_value(value).unwrap()
    }

    fn state(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn first_matching_case_wins() {
        let cond = CompiledCondition::compile(&edge(json!({
            "from": "classify",
            "condition": {
                "cases": [
                    {"predicate": {"expression": "state.score > 5"}, "target": "high"},
                    {"predicate": {"expression": "state.score > 0"}, "target": "low"}
                ],
                "default": "none"
            }
        })))
        .unwrap();
        assert_eq!(cond.route(&state(json!({"score": 9}))).unwrap(), "high");
        assert_eq!(cond.route(&state(json!({"score": 2}))).unwrap(), "low");
        assert_eq!(cond.route(&state(json!({"score": 0}))).unwrap(), "none");
        assert_eq!(cond.targets().collect::<Vec<_>>(), vec!["high", "low", "none"]);
    }

    #[test]
    fn predicates_see_the_source_output_as_input() {
        let cond = CompiledCondition::compile(&edge(json!({
            "from": "llm",
            "condition": {"cases": [{"predicate": {"expression": "input.output_parsed.ok == true"}, "target": "yes"}]}
        })))
        .unwrap();
        let s = state(json!({"node_structured": {"llm": {"output_parsed": {"ok": true}}}}));
        assert_eq!(cond.route(&s).unwrap(), "yes");
    }

    #[test]
    fn no_match_without_default_is_no_route() {
        let cond = CompiledCondition::compile(&edge(json!({
            "from": "a",
            "condition": {"cases": [{"predicate": {"expression": "false"}, "target": "b"}]}
        })))
        .unwrap();
        let err = cond.route(&Map::new()).unwrap_err();
        assert_eq!(err.error_code(), "ERR_DSL_NO_ROUTE");
    }

    #[test]
    fn invalid_predicate_is_a_compile_error() {
        let err = CompiledCondition::compile(&edge(json!({
            "from": "a",
            "condition": {"cases": [{"predicate": {"expression": "state.x =="}, "target": "b"}]}
        })))
        .unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_EXPRESSION);
        assert_eq!(err.field.as_deref(), Some("condition.cases[0].predicate"));
    }
}
