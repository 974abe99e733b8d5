//! Shared fixtures for the cross-crate scenarios under `scenarios/`.

use async_trait::async_trait;
use futures::stream;
use std::sync::{Arc, Mutex};

use trellis_core::{Context, Message, Model, ModelInfo, Request, Response, ResponseStream, Result, ToolCall};
use trellis_session::{
    AppendEventHook, ConsecutiveUserHandler, GetSessionHook, SessionService, SessionServiceConfig, SessionSummarizer,
};
use trellis_session_inmemory::InMemorySessionService;
use trellis_session_sqlite::{SqliteConfig, SqliteDatabase, SqliteSessionService};

/// Which store a scenario runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    InMemory,
    Sqlite,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::InMemory, Backend::Sqlite];
}

/// Optional wiring for [`service`].
#[derive(Default, Clone)]
pub struct Wiring {
    pub consecutive: Option<ConsecutiveUserHandler>,
    pub summarizer: Option<Arc<dyn SessionSummarizer>>,
    pub append_hooks: Vec<Arc<dyn AppendEventHook>>,
    pub get_hooks: Vec<Arc<dyn GetSessionHook>>,
}

/// Build a session service of the given kind. SQLite runs against a
/// private in-memory database.
pub async fn service(backend: Backend, config: SessionServiceConfig, wiring: Wiring) -> Result<Arc<dyn SessionService>> {
    match backend {
        Backend::InMemory => {
            let mut builder = InMemorySessionService::builder(config);
            for hook in wiring.append_hooks {
                builder = builder.with_append_event_hook(hook);
            }
            for hook in wiring.get_hooks {
                builder = builder.with_get_session_hook(hook);
            }
            if let Some(handler) = wiring.consecutive {
                builder = builder.with_consecutive_user_handler(handler);
            }
            if let Some(summarizer) = wiring.summarizer {
                builder = builder.with_summarizer(summarizer);
            }
            Ok(Arc::new(builder.build()))
        }
        Backend::Sqlite => {
            let db = SqliteDatabase::connect(&SqliteConfig::in_memory()).await?;
            let mut builder = SqliteSessionService::builder(db, config);
            for hook in wiring.append_hooks {
                builder = builder.with_append_event_hook(hook);
            }
            for hook in wiring.get_hooks {
                builder = builder.with_get_session_hook(hook);
            }
            if let Some(handler) = wiring.consecutive {
                builder = builder.with_consecutive_user_handler(handler);
            }
            if let Some(summarizer) = wiring.summarizer {
                builder = builder.with_summarizer(summarizer);
            }
            Ok(Arc::new(builder.build()))
        }
    }
}

/// Model that replays the same responses for every call and records
/// the requests it receives.
pub struct ScriptedModel {
    responses: Vec<Response>,
    pub seen: Mutex<Vec<Request>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Response>) -> Arc<Self> {
        Arc::new(Self { responses, seen: Mutex::new(Vec::new()) })
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<Request> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Model for ScriptedModel {
    async fn generate_content(&self, _ctx: &Context, request: Request) -> Result<ResponseStream> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request);
        }
        Ok(Box::pin(stream::iter(self.responses.clone())))
    }

    fn info(&self) -> ModelInfo {
        ModelInfo { name: "scripted".into() }
    }
}

/// Assistant response carrying the given tool calls.
pub fn tool_calls(calls: &[(&str, serde_json::Value)]) -> Response {
    let mut msg = Message::assistant("");
    msg.tool_calls = calls
        .iter()
        .enumerate()
        .map(|(i, (name, args))| ToolCall::new(format!("call-{}", i), *name, args))
        .collect();
    Response::from_message(msg)
}

pub use trellis_monitoring::init_test_tracing;
