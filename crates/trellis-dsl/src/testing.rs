//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use futures::stream;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use trellis_core::{
    Context, FunctionTool, Message, Model, ModelInfo, Request, Response, ResponseStream, Result, Tool,
    ToolCall, ToolDeclaration,
};

/// Requests seen by a scripted model
pub type Seen = Arc<Mutex<Vec<Request>>>;

/// Model replaying canned responses; each call pops the next script.
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Vec<Response>>>,
    repeat: Option<Vec<Response>>,
    seen: Seen,
}

#[async_trait]
impl Model for ScriptedModel {
    async fn generate_content(&self, _ctx: &Context, request: Request) -> Result<ResponseStream> {
        self.seen.lock().unwrap().push(request);
        let next = self.scripts.lock().unwrap().pop_front();
        let responses = next.or_else(|| self.repeat.clone()).unwrap_or_default();
        Ok(Box::pin(stream::iter(responses)))
    }

    fn info(&self) -> ModelInfo {
        ModelInfo { name: "scripted".into() }
    }
}

/// Model answering every call with `responses`.
pub fn scripted(responses: Vec<Response>) -> (Arc<dyn Model>, Seen) {
    let seen = Seen::default();
    let model = ScriptedModel { scripts: Mutex::new(VecDeque::new()), repeat: Some(responses), seen: seen.clone() };
    (Arc::new(model), seen)
}

/// Model answering call `i` with `scripts[i]`; later calls yield nothing.
pub fn sequenced(scripts: Vec<Vec<Response>>) -> (Arc<dyn Model>, Seen) {
    let seen = Seen::default();
    let model = ScriptedModel { scripts: Mutex::new(scripts.into()), repeat: None, seen: seen.clone() };
    (Arc::new(model), seen)
}

/// Completed assistant text response
pub fn text(content: &str) -> Response {
    Response::from_message(Message::assistant(content))
}

/// Assistant response calling the given tools
pub fn calls(list: &[(&str, Value)]) -> Response {
    let mut message = Message::assistant("");
    message.tool_calls = list
        .iter()
        .enumerate()
        .map(|(i, (name, args))| ToolCall::new(format!("call_{}", i), *name, args))
        .collect();
    Response::from_message(message)
}

/// Tool answering `{"echo": args}`
pub fn echo_tool(name: &str) -> Arc<dyn Tool> {
    Arc::new(FunctionTool::new(
        ToolDeclaration::new(name, "echoes its arguments", json!({"type": "object"})),
        |args: Value| async move { Ok(json!({"echo": args})) },
    ))
}
