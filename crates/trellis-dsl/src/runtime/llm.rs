use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use trellis_core::{
    Context, CoreError, Event, GenerationConfig, Message, Model, Request, Result, Role, StructuredOutput, Tool,
    ToolSet,
};

use super::{execute_tool_calls, extract_first_json, pending_user_input, state_messages, structured_update, ExecutionContext};
use crate::schema::{
    STATE_KEY_LAST_RESPONSE, STATE_KEY_MESSAGES, STATE_KEY_NODE_RESPONSES, STATE_KEY_NODE_STRUCTURED,
    STATE_KEY_USER_INPUT,
};

/// Tool loop bound for `builtin.llmagent`
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// `builtin.llm`: one model call over the conversation in state.
pub struct LlmNode {
    pub(crate) model: Arc<dyn Model>,
    pub(crate) model_name: String,
    pub(crate) instruction: String,
    pub(crate) tools: Vec<Arc<dyn Tool>>,
    pub(crate) generation: GenerationConfig,
    pub(crate) structured_output: Option<StructuredOutput>,
}

impl LlmNode {
    /// Model name this node was compiled against
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Generation parameters
    pub fn generation(&self) -> &GenerationConfig {
        &self.generation
    }

    pub(crate) async fn run(
        &self,
        node_id: &str,
        ctx: &Context,
        exec: &ExecutionContext,
        state: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let mut turn = Turn::start(state, &self.instruction);
        let request = turn.request(&self.tools, &self.generation, &self.structured_output);
        let reply = call_model(self.model.as_ref(), node_id, ctx, exec, request).await?;
        turn.push(reply);
        Ok(turn.finish(node_id, self.structured_output.is_some()))
    }
}

/// `builtin.llmagent`: model and tools in a loop until the model stops calling tools.
pub struct AgentNode {
    pub(crate) model: Arc<dyn Model>,
    pub(crate) model_name: String,
    pub(crate) instruction: String,
    pub(crate) description: String,
    pub(crate) tools: Vec<Arc<dyn Tool>>,
    pub(crate) toolsets: Vec<Arc<dyn ToolSet>>,
    pub(crate) generation: GenerationConfig,
    pub(crate) structured_output: Option<StructuredOutput>,
    pub(crate) max_iterations: usize,
}

impl AgentNode {
    /// Model name this node was compiled against
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Agent description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Names of the statically bound tools
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.declaration().name).collect()
    }

    async fn resolve_tools(&self, ctx: &Context) -> Result<BTreeMap<String, Arc<dyn Tool>>> {
        let mut tools: BTreeMap<String, Arc<dyn Tool>> = BTreeMap::new();
        for tool in &self.tools {
            tools.insert(tool.declaration().name, Arc::clone(tool));
        }
        for set in &self.toolsets {
            for tool in set.tools(ctx).await? {
                let name = tool.declaration().name;
                if tools.contains_key(&name) {
                    warn!(toolset = set.name(), tool = %name, "tool name already bound, keeping the first");
                    continue;
                }
                tools.insert(name, tool);
            }
        }
        Ok(tools)
    }

    pub(crate) async fn run(
        &self,
        node_id: &str,
        ctx: &Context,
        exec: &ExecutionContext,
        state: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let tools = self.resolve_tools(ctx).await?;
        let tool_list: Vec<Arc<dyn Tool>> = tools.values().cloned().collect();
        let mut turn = Turn::start(state, &self.instruction);

        for iteration in 0..self.max_iterations {
            if ctx.is_cancelled() {
                return Err(CoreError::Cancelled(format!("agent {} cancelled", node_id)));
            }
            let request = turn.request(&tool_list, &self.generation, &self.structured_output);
            let reply = call_model(self.model.as_ref(), node_id, ctx, exec, request).await?;
            let calls = reply.tool_calls.clone();
            turn.push(reply);
            if calls.is_empty() {
                return Ok(turn.finish(node_id, self.structured_output.is_some()));
            }
            debug!(node_id, iteration, calls = calls.len(), "agent running tool calls");
            for result in execute_tool_calls(ctx, &tools, &calls).await {
                turn.push(result);
            }
        }
        warn!(node_id, max_iterations = self.max_iterations, "agent stopped at iteration limit");
        Ok(turn.finish(node_id, self.structured_output.is_some()))
    }
}

/// Conversation state of one node run.
struct Turn {
    history: Vec<Message>,
    added: Vec<Message>,
    consumed_input: bool,
}

impl Turn {
    fn start(state: &Map<String, Value>, instruction: &str) -> Self {
        let mut history = Vec::new();
        if !instruction.trim().is_empty() {
            history.push(Message::system(instruction));
        }
        history.extend(state_messages(state));
        let mut added = Vec::new();
        let consumed_input = match pending_user_input(state) {
            Some(input) => {
                let msg = Message::user(input);
                history.push(msg.clone());
                added.push(msg);
                true
            }
            None => false,
        };
        Self { history, added, consumed_input }
    }

    fn request(
        &self,
        tools: &[Arc<dyn Tool>],
        generation: &GenerationConfig,
        structured_output: &Option<StructuredOutput>,
    ) -> Request {
        Request {
            messages: self.history.clone(),
            tools: tools.iter().map(|t| {
                let decl = t.declaration();
                (decl.name.clone(), decl)
            }).collect(),
            generation_config: generation.clone(),
            structured_output: structured_output.clone(),
        }
    }

    fn push(&mut self, message: Message) {
        self.history.push(message.clone());
        self.added.push(message);
    }

    fn last_text(&self) -> Option<&str> {
        self.added
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.content.is_empty())
            .map(|m| m.content.as_str())
    }

    fn finish(self, node_id: &str, structured: bool) -> Map<String, Value> {
        let mut update = Map::new();
        if self.consumed_input {
            update.insert(STATE_KEY_USER_INPUT.to_string(), Value::String(String::new()));
        }
        if let Some(text) = self.last_text() {
            update.insert(STATE_KEY_LAST_RESPONSE.to_string(), Value::String(text.to_string()));
            let mut responses = Map::new();
            responses.insert(node_id.to_string(), Value::String(text.to_string()));
            update.insert(STATE_KEY_NODE_RESPONSES.to_string(), Value::Object(responses));

            if structured {
                match extract_first_json(text) {
                    Some(parsed) => {
                        let mut entry = Map::new();
                        entry.insert("output_parsed".to_string(), parsed);
                        update.insert(STATE_KEY_NODE_STRUCTURED.to_string(), structured_update(node_id, entry));
                    }
                    None => warn!(node_id, "no JSON found in structured output"),
                }
            }
        }
        let added: Vec<Value> = self
            .added
            .iter()
            .filter_map(|m| serde_json::to_value(m).ok())
            .collect();
        update.insert(STATE_KEY_MESSAGES.to_string(), Value::Array(added));
        update
    }
}

/// Stream one model call, forwarding every response as an event. Returns
/// the final assistant message; partial chunks are concatenated when no
/// complete message arrives.
async fn call_model(
    model: &dyn Model,
    node_id: &str,
    ctx: &Context,
    exec: &ExecutionContext,
    request: Request,
) -> Result<Message> {
    let mut stream = model.generate_content(ctx, request).await?;
    let mut final_message: Option<Message> = None;
    let mut partial_text = String::new();

    while let Some(response) = stream.next().await {
        exec.forward(Event::new(exec.invocation_id.clone(), node_id, Some(response.clone()))).await;
        if let Some(err) = &response.error {
            return Err(CoreError::UpstreamError(format!("LLM error: {}", err.message)));
        }
        let Some(message) = response.first_message() else { continue };
        if response.is_partial {
            partial_text.push_str(&message.content);
        } else if message.has_payload() {
            final_message = Some(message.clone());
        }
    }

    Ok(final_message.unwrap_or_else(|| Message::assistant(partial_text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{calls, echo_tool, scripted, sequenced, text};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;
    use trellis_core::Response;

    fn llm_node(model: Arc<dyn Model>, structured: bool) -> LlmNode {
        LlmNode {
            model,
            model_name: "test".into(),
            instruction: "Be brief.".into(),
            tools: vec![],
            generation: GenerationConfig::default(),
            structured_output: structured.then(|| StructuredOutput { name: "output".into(), schema: json!({}) }),
        }
    }

    fn state(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn llm_consumes_user_input_and_writes_results() {
        let (model, seen) = scripted(vec![text("Result: {\"label\": \"bug\"}")]);
        let node = llm_node(model, true);
        let (tx, mut rx) = mpsc::channel(8);
        let exec = ExecutionContext { invocation_id: "inv".into(), events: Some(tx), resume: None };

        let update = node
            .run("classify", &Context::new(), &exec, &state(json!({"user_input": "it crashes", "messages": []})))
            .await
            .unwrap();

        assert_eq!(update["user_input"], json!(""));
        assert_eq!(update["last_response"], json!("Result: {\"label\": \"bug\"}"));
        assert_eq!(update["node_responses"], json!({"classify": "Result: {\"label\": \"bug\"}"}));
        assert_eq!(update["node_structured"], json!({"classify": {"output_parsed": {"label": "bug"}}}));
        assert_eq!(update["messages"].as_array().unwrap().len(), 2);

        let requests = seen.lock().unwrap();
        assert_eq!(requests[0].messages[0], Message::system("Be brief."));
        assert_eq!(requests[0].messages[1], Message::user("it crashes"));
        assert!(requests[0].structured_output.is_some());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.author, "classify");
        assert_eq!(event.invocation_id, "inv");
    }

    #[tokio::test]
    async fn partial_chunks_are_concatenated() {
        let mut a = text("Hel");
        a.is_partial = true;
        a.done = false;
        let mut b = text("lo");
        b.is_partial = true;
        b.done = false;
        let (model, _) = scripted(vec![a, b]);
        let update = llm_node(model, false)
            .run("n", &Context::new(), &ExecutionContext::default(), &Map::new())
            .await
            .unwrap();
        assert_eq!(update["last_response"], json!("Hello"));
        assert!(!update.contains_key("node_structured"));
    }

    #[tokio::test]
    async fn model_errors_fail_the_node() {
        let (model, _) = scripted(vec![Response::from_error("overloaded", "try later")]);
        let err = llm_node(model, false)
            .run("n", &Context::new(), &ExecutionContext::default(), &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::UpstreamError("LLM error: try later".into()));
    }

    #[tokio::test]
    async fn agent_loops_through_tool_calls() {
        let (model, seen) = sequenced(vec![
            vec![calls(&[("echo", json!({"q": 1}))])],
            vec![text("all done")],
        ]);
        let node = AgentNode {
            model,
            model_name: "test".into(),
            instruction: String::new(),
            description: String::new(),
            tools: vec![echo_tool("echo")],
            toolsets: vec![],
            generation: GenerationConfig::default(),
            structured_output: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        };

        let update = node
            .run("agent", &Context::new(), &ExecutionContext::default(), &state(json!({"user_input": "go"})))
            .await
            .unwrap();

        assert_eq!(update["last_response"], json!("all done"));
        let messages: Vec<Message> = serde_json::from_value(update["messages"].clone()).unwrap();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].tools.contains_key("echo"));
        assert_eq!(requests[1].messages.last().unwrap().role, Role::Tool);
    }

    #[tokio::test]
    async fn agent_stops_at_iteration_limit() {
        let (model, seen) = sequenced(vec![vec![calls(&[("echo", json!({}))])]; 5]);
        let node = AgentNode {
            model,
            model_name: "test".into(),
            instruction: String::new(),
            description: String::new(),
            tools: vec![echo_tool("echo")],
            toolsets: vec![],
            generation: GenerationConfig::default(),
            structured_output: None,
            max_iterations: 2,
        };
        let update = node
            .run("agent", &Context::new(), &ExecutionContext::default(), &Map::new())
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(!update.contains_key("last_response"));
    }
}
