use serde_json::{Map, Value};
use std::sync::Arc;

use trellis_core::{Context, CoreError, Result};

use super::structured_update;
use crate::graph::{NodeIO, TargetKind};
use crate::registry::Component;
use crate::schema::STATE_KEY_NODE_STRUCTURED;

/// A registered component bound to one node's config.
pub struct ComponentNode {
    pub(crate) name: String,
    pub(crate) component: Arc<dyn Component>,
    pub(crate) config: Map<String, Value>,
    pub(crate) outputs: Vec<NodeIO>,
}

impl ComponentNode {
    /// Component (node type) name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn run(&self, node_id: &str, ctx: &Context, state: &Map<String, Value>) -> Result<Map<String, Value>> {
        let result = self.component.execute(ctx, &self.config, &Value::Object(state.clone())).await?;

        let mut update = self.map_outputs(node_id, &result)?;
        update.insert(STATE_KEY_NODE_STRUCTURED.to_string(), structured_update(node_id, result));
        Ok(update)
    }

    /// Result fields pass through; mapped outputs are renamed to their state
    /// field or filled from their default.
    fn map_outputs(&self, node_id: &str, result: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut update = result.clone();
        for output in &self.outputs {
            let value = match result.get(&output.name) {
                Some(v) => v.clone(),
                None if output.required => {
                    return Err(CoreError::ValidationError(format!(
                        "node {}: required output {} missing from {} result",
                        node_id, output.name, self.name
                    )))
                }
                None => match &output.default {
                    Some(default) => default.clone(),
                    None => continue,
                },
            };
            let field = match &output.target {
                Some(target) if target.kind == TargetKind::State => {
                    target.field.clone().filter(|f| !f.is_empty()).unwrap_or_else(|| output.name.clone())
                }
                _ => output.name.clone(),
            };
            if field != output.name {
                update.remove(&output.name);
            }
            update.insert(field, value);
        }
        Ok(update)
    }
}
