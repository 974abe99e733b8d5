//! Structural `builtin.while` expansion.
//!
//! A while node carries its body as a nested sub-graph. Expansion flattens
//! the body into the enclosing graph, points the while node at the body
//! entry and adds a conditional edge from the body exit that loops back to
//! the entry while the condition holds and otherwise leaves for the node
//! that followed the while node.

use serde_json::Value;
use std::collections::HashSet;

use crate::error::{error_codes, ValidationError};
use crate::graph::{node_types, Case, Condition, ConditionalEdge, Edge, Expression, Graph, Node, WhileConfig};

/// One expanded loop
#[derive(Debug, Clone, PartialEq)]
pub struct WhileExpansion {
    /// The while node
    pub while_id: String,
    /// First body node of each iteration
    pub body_entry: String,
    /// Last body node of each iteration
    pub body_exit: String,
    /// Where the loop exits to
    pub after: String,
    /// Loop condition, evaluated with `input` bound to the body exit's output
    pub condition: String,
}

fn invalid(while_id: &str, field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::new(error_codes::INVALID_WHILE, message).at_node(while_id).in_field(field)
}

/// Validate one while node against the current graph and return its body.
fn build_expansion(
    node: &Node,
    edges: &[Edge],
    node_ids: &HashSet<String>,
) -> Result<(WhileExpansion, WhileConfig), ValidationError> {
    let id = node.id.as_str();
    if node.config.is_empty() {
        return Err(invalid(id, "config", "config is required for builtin.while"));
    }
    let config: WhileConfig = serde_json::from_value(Value::Object(node.config.clone()))
        .map_err(|e| invalid(id, "config", format!("failed to decode builtin.while config: {}", e)))?;

    let body = &config.body;
    if body.nodes.is_empty() {
        return Err(invalid(id, "body.nodes", "body.nodes must contain at least one node"));
    }
    if body.start_node_id.trim().is_empty() {
        return Err(invalid(id, "body.start_node_id", "body.start_node_id is required for builtin.while"));
    }
    if body.exit_node_id.trim().is_empty() {
        return Err(invalid(id, "body.exit_node_id", "body.exit_node_id is required for builtin.while"));
    }

    let mut body_ids = HashSet::with_capacity(body.nodes.len());
    for n in &body.nodes {
        if n.id.trim().is_empty() {
            return Err(invalid(id, "body.nodes", "body node has empty id"));
        }
        if !body_ids.insert(n.id.as_str()) {
            return Err(invalid(id, "body.nodes", format!("duplicate node id {:?} in while body", n.id)));
        }
        if node_ids.contains(&n.id) {
            return Err(invalid(
                id,
                "body.nodes",
                format!("while body node id {:?} conflicts with existing graph node", n.id),
            ));
        }
    }
    if !body_ids.contains(body.start_node_id.as_str()) {
        return Err(invalid(
            id,
            "body.start_node_id",
            format!("body.start_node_id {:?} does not reference a node in body.nodes", body.start_node_id),
        ));
    }
    if !body_ids.contains(body.exit_node_id.as_str()) {
        return Err(invalid(
            id,
            "body.exit_node_id",
            format!("body.exit_node_id {:?} does not reference a node in body.nodes", body.exit_node_id),
        ));
    }

    for e in &body.edges {
        if e.source.trim().is_empty() || e.target.trim().is_empty() {
            return Err(invalid(id, "body.edges", "while body edge has empty source or target"));
        }
        if !body_ids.contains(e.source.as_str()) {
            return Err(invalid(id, "body.edges", format!("while body edge source {:?} is not a body node", e.source)));
        }
        if !body_ids.contains(e.target.as_str()) {
            return Err(invalid(id, "body.edges", format!("while body edge target {:?} is not a body node", e.target)));
        }
        if e.source == body.exit_node_id {
            return Err(invalid(
                id,
                "body.edges",
                format!("while body exit node {:?} must not have outgoing edges", e.source),
            ));
        }
    }
    for ce in &body.conditional_edges {
        if ce.from.trim().is_empty() {
            return Err(invalid(id, "body.conditional_edges", "while body conditional edge has empty from"));
        }
        if !body_ids.contains(ce.from.as_str()) {
            return Err(invalid(
                id,
                "body.conditional_edges",
                format!("while body conditional edge 'from' {:?} is not a body node", ce.from),
            ));
        }
        if ce.from == body.exit_node_id {
            return Err(invalid(
                id,
                "body.conditional_edges",
                format!("while body exit node {:?} must not have outgoing edges", ce.from),
            ));
        }
    }

    let mut after: Option<&str> = None;
    for e in edges.iter().filter(|e| e.source == id) {
        match after {
            None => after = Some(e.target.as_str()),
            Some(existing) if existing != e.target => {
                return Err(invalid(
                    id,
                    "edges",
                    format!("builtin.while node {} has multiple outgoing edges ({}, {})", id, existing, e.target),
                ))
            }
            Some(_) => {}
        }
    }
    let after = after
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| invalid(id, "edges", format!("builtin.while node {} must have exactly one outgoing edge", id)))?
        .to_string();

    let condition = config.condition.expression.trim().to_string();
    if condition.is_empty() {
        return Err(invalid(id, "condition.expression", "condition.expression is required for builtin.while"));
    }
    trellis_core::compile_bool(&condition).map_err(|e| {
        ValidationError::new(
            error_codes::INVALID_EXPRESSION,
            format!("while node {} has invalid condition expression: {}", id, e),
        )
        .at_node(id)
        .in_field("condition.expression")
    })?;

    let expansion = WhileExpansion {
        while_id: id.to_string(),
        body_entry: body.start_node_id.clone(),
        body_exit: body.exit_node_id.clone(),
        after,
        condition,
    };
    Ok((expansion, config))
}

/// Flatten every while node, nested ones included. The returned graph has
/// the while nodes' outgoing edges redirected to their body entries and one
/// synthesized conditional edge per loop.
pub fn expand_while(graph: &Graph) -> Result<(Graph, Vec<WhileExpansion>), ValidationError> {
    let mut out = graph.clone();
    let mut expansions = Vec::new();
    let mut done: HashSet<String> = HashSet::new();

    while let Some(idx) = out
        .nodes
        .iter()
        .position(|n| n.node_type == node_types::WHILE && !done.contains(&n.id))
    {
        let node = out.nodes[idx].clone();
        let node_ids: HashSet<String> = out.nodes.iter().map(|n| n.id.clone()).collect();
        let (expansion, config) = build_expansion(&node, &out.edges, &node_ids)?;

        out.nodes.extend(config.body.nodes);
        out.edges.retain(|e| e.source != node.id);
        out.edges.push(Edge::new(node.id.clone(), expansion.body_entry.clone()));
        out.edges.extend(config.body.edges);
        out.conditional_edges.extend(config.body.conditional_edges);

        if out.conditional_edges.iter().any(|ce| ce.from == expansion.body_exit) {
            return Err(invalid(
                &node.id,
                "body.exit_node_id",
                format!("while body exit node {:?} already has a conditional edge", expansion.body_exit),
            ));
        }
        out.conditional_edges.push(ConditionalEdge {
            id: Some(format!("{}__loop", node.id)),
            from: expansion.body_exit.clone(),
            condition: Condition {
                cases: vec![Case {
                    name: Some("continue".to_string()),
                    predicate: Expression::new(expansion.condition.clone()),
                    target: expansion.body_entry.clone(),
                }],
                default: Some(expansion.after.clone()),
            },
        });

        done.insert(node.id.clone());
        expansions.push(expansion);
    }

    Ok((out, expansions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn while_graph(body: Value, outgoing: &[&str]) -> Graph {
        let mut edges = vec![json!({"source": "start", "target": "loop"})];
        edges.extend(outgoing.iter().map(|t| json!({"source": "loop", "target": t})));
        serde_json::from_value(json!({
            "version": "1",
            "nodes": [
                {"id": "start", "node_type": "builtin.start"},
                {"id": "loop", "node_type": "builtin.while", "config": {
                    "body": body,
                    "condition": {"expression": "state.counter < 3"}
                }},
                {"id": "done", "node_type": "builtin.end"},
                {"id": "other", "node_type": "builtin.end"}
            ],
            "edges": edges
        }))
        .unwrap()
    }

    fn simple_body() -> Value {
        json!({
            "nodes": [
                {"id": "step", "node_type": "builtin.transform", "config": {"expr": "1"}},
                {"id": "check", "node_type": "builtin.transform", "config": {"expr": "2"}}
            ],
            "edges": [{"source": "step", "target": "check"}],
            "start_node_id": "step",
            "exit_node_id": "check"
        })
    }

    #[test]
    fn flattens_body_and_adds_loop_edge() {
        let (graph, expansions) = expand_while(&while_graph(simple_body(), &["done"])).unwrap();
        assert_eq!(
            expansions,
            vec![WhileExpansion {
                while_id: "loop".into(),
                body_entry: "step".into(),
                body_exit: "check".into(),
                after: "done".into(),
                condition: "state.counter < 3".into(),
            }]
        );
        assert!(graph.node("step").is_some() && graph.node("check").is_some());
        assert!(graph.edges.contains(&Edge::new("loop", "step")));
        assert!(!graph.edges.contains(&Edge::new("loop", "done")));
        let loop_edge = graph.conditional_edges.iter().find(|ce| ce.from == "check").unwrap();
        assert_eq!(loop_edge.condition.cases[0].target, "step");
        assert_eq!(loop_edge.condition.default.as_deref(), Some("done"));
    }

    #[test]
    fn rejects_several_exit_targets() {
        let err = expand_while(&while_graph(simple_body(), &["done", "other"])).unwrap_err();
        assert_eq!(err.message, "builtin.while node loop has multiple outgoing edges (done, other)");
        assert_eq!(err.node_id.as_deref(), Some("loop"));
    }

    #[test]
    fn duplicate_exit_edges_to_the_same_target_are_fine() {
        assert!(expand_while(&while_graph(simple_body(), &["done", "done"])).is_ok());
    }

    #[test]
    fn rejects_missing_exit() {
        let err = expand_while(&while_graph(simple_body(), &[])).unwrap_err();
        assert_eq!(err.message, "builtin.while node loop must have exactly one outgoing edge");
    }

    #[test]
    fn rejects_bad_bodies() {
        let cases = [
            (json!({"nodes": []}), "body.nodes must contain at least one node"),
            (
                json!({"nodes": [{"id": "a", "node_type": "x"}], "start_node_id": "a"}),
                "body.exit_node_id is required for builtin.while",
            ),
            (
                json!({"nodes": [{"id": "a", "node_type": "x"}, {"id": "a", "node_type": "x"}],
                       "start_node_id": "a", "exit_node_id": "a"}),
                "duplicate node id \"a\" in while body",
            ),
            (
                json!({"nodes": [{"id": "done", "node_type": "x"}], "start_node_id": "done", "exit_node_id": "done"}),
                "while body node id \"done\" conflicts with existing graph node",
            ),
            (
                json!({"nodes": [{"id": "a", "node_type": "x"}], "start_node_id": "b", "exit_node_id": "a"}),
                "body.start_node_id \"b\" does not reference a node in body.nodes",
            ),
            (
                json!({"nodes": [{"id": "a", "node_type": "x"}], "start_node_id": "a", "exit_node_id": "a",
                       "edges": [{"source": "a", "target": "done"}]}),
                "while body edge target \"done\" is not a body node",
            ),
        ];
        for (body, expected) in cases {
            let err = expand_while(&while_graph(body, &["done"])).unwrap_err();
            assert_eq!(err.message, expected);
            assert_eq!(err.code, error_codes::INVALID_WHILE);
        }
    }

    #[test]
    fn rejects_invalid_condition() {
        let mut graph = while_graph(simple_body(), &["done"]);
        graph.nodes[1].config.insert("condition".into(), json!({"expression": "state.x =="}));
        let err = expand_while(&graph).unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_EXPRESSION);
        assert_eq!(err.field.as_deref(), Some("condition.expression"));
    }

    #[test]
    fn expands_nested_loops() {
        let inner = json!({
            "nodes": [
                {"id": "inner", "node_type": "builtin.while", "config": {
                    "body": {
                        "nodes": [{"id": "work", "node_type": "builtin.transform", "config": {"expr": "1"}}],
                        "start_node_id": "work",
                        "exit_node_id": "work"
                    },
                    "condition": {"expression": "state.j < 2"}
                }},
                {"id": "tail", "node_type": "builtin.transform", "config": {"expr": "1"}}
            ],
            "edges": [{"source": "inner", "target": "tail"}],
            "start_node_id": "inner",
            "exit_node_id": "tail"
        });
        let (graph, expansions) = expand_while(&while_graph(inner, &["done"])).unwrap();
        assert_eq!(expansions.len(), 2);
        assert_eq!(expansions[1].while_id, "inner");
        assert_eq!(expansions[1].after, "tail");
        assert!(graph.edges.contains(&Edge::new("inner", "work")));
        assert_eq!(graph.conditional_edges.len(), 2);
    }
}
