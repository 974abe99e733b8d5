//! Memory extraction.
//!
//! An extractor shows the model the recent conversation together with the
//! user's existing memories and the memory tools it may call, then turns
//! the returned tool calls into [`Operation`]s.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Write};
use std::sync::Arc;
use tracing::{debug, warn};

use trellis_core::{Context, CoreError, Message, Model, ModelCallbacks, Request, ResponseStream, Result};

use crate::entry::Entry;
use crate::operation::{parse_tool_call, Operation};
use crate::tool::{
    background_declarations, ADD_TOOL_NAME, BACKGROUND_TOOL_NAMES, CLEAR_TOOL_NAME, DELETE_TOOL_NAME,
    UPDATE_TOOL_NAME,
};

mod checker;

pub use checker::{
    check_message_threshold, check_time_interval, checks_all, checks_any, Checker, ExtractionContext,
};

/// Turns conversation into memory operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    /// Operations for `messages` given the `existing` memories. Only the
    /// `enabled` background tools are offered; empty offers all of them.
    async fn extract(
        &self,
        ctx: &Context,
        messages: &[Message],
        existing: &[Entry],
        enabled: &BTreeSet<String>,
    ) -> Result<Vec<Operation>>;

    /// Whether extraction should run now
    fn should_extract(&self, ctx: &ExtractionContext) -> bool;

    /// Descriptive metadata
    fn metadata(&self) -> HashMap<String, Value>;
}

const METADATA_MODEL_NAME: &str = "model_name";
const METADATA_MODEL_AVAILABLE: &str = "model_available";

fn action_description(name: &str) -> Option<&'static str> {
    match name {
        ADD_TOOL_NAME => Some("Add a new memory (only if genuinely new information)."),
        UPDATE_TOOL_NAME => Some(
            "Update an existing memory with new or corrected information. Prefer updating over adding a near-duplicate.",
        ),
        DELETE_TOOL_NAME => Some("Delete a memory when the user explicitly asks to forget something."),
        CLEAR_TOOL_NAME => Some("Clear all memories only when the user explicitly asks to forget everything."),
        _ => None,
    }
}

/// Extractor backed by a model.
#[derive(Clone, Default)]
pub struct LlmExtractor {
    model: Option<Arc<dyn Model>>,
    prompt: Option<String>,
    checkers: Vec<Checker>,
    callbacks: ModelCallbacks,
}

impl fmt::Debug for LlmExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmExtractor")
            .field("model", &self.model.as_ref().map(|m| m.info().name))
            .field("custom_prompt", &self.prompt.is_some())
            .field("checkers", &self.checkers.len())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

impl LlmExtractor {
    /// Extractor using `model` and the default prompt
    pub fn new(model: Arc<dyn Model>) -> Self {
        Self { model: Some(model), ..Default::default() }
    }

    /// Replace the model
    pub fn with_model(mut self, model: Arc<dyn Model>) -> Self {
        self.model = Some(model);
        self
    }

    /// Replace the instruction prompt; empty keeps the current one.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        if !prompt.is_empty() {
            self.prompt = Some(prompt);
        }
        self
    }

    /// Add a checker; all checkers must pass.
    pub fn with_checker(mut self, checker: Checker) -> Self {
        self.checkers.push(checker);
        self
    }

    /// Replace the checkers with one that passes when any of `checkers` does.
    pub fn with_checkers_any(mut self, checkers: Vec<Checker>) -> Self {
        self.checkers = vec![checks_any(checkers)];
        self
    }

    /// Callbacks around the model call
    pub fn with_model_callbacks(mut self, callbacks: ModelCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// System prompt: instructions, the permitted actions and the
    /// memories the model may update or delete.
    pub fn system_prompt(&self, existing: &[Entry], enabled: &BTreeSet<String>) -> String {
        let mut prompt = self.prompt.clone().unwrap_or_else(|| DEFAULT_PROMPT.to_string());

        prompt.push_str("\n<available_actions>\n");
        let mut listed = false;
        for name in BACKGROUND_TOOL_NAMES {
            if !enabled.is_empty() && !enabled.contains(name) {
                continue;
            }
            if let Some(desc) = action_description(name) {
                let _ = writeln!(prompt, "- {}: {}", name, desc);
                listed = true;
            }
        }
        if !listed {
            prompt.push_str("No actions available.\n");
        }
        prompt.push_str("</available_actions>\n");

        if !existing.is_empty() {
            prompt.push_str("\n<existing_memories>\n");
            for entry in existing {
                let _ = writeln!(prompt, "- [{}] {}", entry.id, entry.memory.memory);
            }
            prompt.push_str("</existing_memories>\n");
        }
        prompt
    }
}

#[async_trait]
impl MemoryExtractor for LlmExtractor {
    async fn extract(
        &self,
        ctx: &Context,
        messages: &[Message],
        existing: &[Entry],
        enabled: &BTreeSet<String>,
    ) -> Result<Vec<Operation>> {
        let Some(model) = &self.model else {
            return Err(CoreError::ConfigurationError("no model configured for memory extraction".to_string()));
        };
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let mut conversation = Vec::with_capacity(messages.len() + 1);
        conversation.push(Message::system(self.system_prompt(existing, enabled)));
        conversation.extend_from_slice(messages);
        let tools: BTreeMap<_, _> =
            background_declarations(enabled).into_iter().map(|decl| (decl.name.clone(), decl)).collect();
        let mut request = Request { messages: conversation, tools, ..Default::default() };

        let mut stream: ResponseStream = match self.callbacks.run_before(ctx, &mut request)? {
            Some(custom) => futures::stream::iter(vec![custom]).boxed(),
            None => model.generate_content(ctx, request.clone()).await.map_err(|e| {
                warn!(error = %e, "memory extraction model call failed");
                e
            })?,
        };

        let mut ops = Vec::new();
        while let Some(rsp) = stream.next().await {
            let rsp = self.callbacks.run_after(ctx, &request, &rsp)?.unwrap_or(rsp);
            if let Some(err) = &rsp.error {
                return Err(CoreError::UpstreamError(format!("model error: {}", err.message)));
            }
            if let Some(msg) = rsp.first_message() {
                ops.extend(msg.tool_calls.iter().filter_map(parse_tool_call));
            }
        }
        debug!(operations = ops.len(), "memory extraction finished");
        Ok(ops)
    }

    fn should_extract(&self, ctx: &ExtractionContext) -> bool {
        self.checkers.iter().all(|c| c(ctx))
    }

    fn metadata(&self) -> HashMap<String, Value> {
        let name = self.model.as_ref().map(|m| m.info().name).unwrap_or_default();
        HashMap::from([
            (METADATA_MODEL_NAME.to_string(), json!(name)),
            (METADATA_MODEL_AVAILABLE.to_string(), json!(self.model.is_some())),
        ])
    }
}

/// Instructions given to the model before the available actions.
pub const DEFAULT_PROMPT: &str = r#"You are a Memory Manager for an AI Assistant.
Your task is to analyze the conversation and manage user memories.

<instructions>
1. Analyze the conversation to identify any new or updated information about the
   user that should be remembered.
2. Check if this information is already captured in existing memories.
3. Determine if any memories need to be added, updated, or deleted.
4. You can call multiple tools in parallel to handle all necessary changes at once.
5. Use the available tools to make the necessary changes.
6. If no memory changes are needed, do not call any tools.
</instructions>

<guidelines>
- Create memories as brief, third-person statements that capture key
  information, e.g., "User enjoys hiking on weekends."
- Keep each memory focused on a single piece of information. Create
  multiple memories if needed rather than one long complex memory.
- Do not repeat the same information in multiple memories; update
  existing memories instead.
- When updating a memory, append new information to the existing
  memory rather than completely overwriting it.
- When a user's preferences change, update the relevant memory to
  reflect the new state.
- Only use delete when the user explicitly asks to forget something.
- Only use clear when the user explicitly asks to forget everything.
- Write memory content and topics in the same language as the user's
  input message.
- Do not create memories for:
  - Transient requests or questions
  - Information already captured in existing memories
  - Generic conversation that doesn't reveal personal information
</guidelines>

<memory_types>
Capture meaningful personal information such as:
- Personal details: name, age, location, occupation
- Preferences: likes, dislikes, favorites
- Interests and hobbies
- Goals and aspirations
- Important relationships
- Significant life events
- Opinions and beliefs
- Work and education background
</memory_types>
"#;

#[cfg(test)]
mod tests;
