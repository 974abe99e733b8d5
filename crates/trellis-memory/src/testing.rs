use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use trellis_core::{Context, Message, Model, ModelInfo, Request, Response, ResponseStream, Result, ToolCall};

mockall::mock! {
    pub Llm {}

    #[async_trait]
    impl Model for Llm {
        async fn generate_content(&self, ctx: &Context, request: Request) -> Result<ResponseStream>;
        fn info(&self) -> ModelInfo;
    }
}

/// Assistant response carrying the given tool calls.
pub(crate) fn calls(calls: &[(&str, Value)]) -> Response {
    let mut msg = Message::assistant("");
    msg.tool_calls = calls
        .iter()
        .enumerate()
        .map(|(i, (name, args))| ToolCall::new(format!("call-{}", i), *name, args))
        .collect();
    Response::from_message(msg)
}

/// Model answering every call with `responses`, recording each request.
pub(crate) fn scripted(responses: Vec<Response>) -> (Arc<MockLlm>, Arc<Mutex<Vec<Request>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let mut model = MockLlm::new();
    model.expect_generate_content().returning(move |_, req| {
        record.lock().unwrap().push(req);
        Ok(futures::stream::iter(responses.clone()).boxed())
    });
    model.expect_info().returning(|| ModelInfo { name: "scripted".into() });
    (Arc::new(model), seen)
}
