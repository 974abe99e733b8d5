//! Session summarizer contract, trigger checks and the LLM-backed implementation.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use trellis_core::{Context, CoreError, Event, GenerationConfig, Message, Model, Request, Result};

use crate::session::Session;

/// State key recording the timestamp of the newest summarized event.
pub const LAST_INCLUDED_TS_KEY: &str = "summary:last_included_ts";

const CONVERSATION_TEXT_PLACEHOLDER: &str = "{conversation_text}";
const MAX_SUMMARY_WORDS_PLACEHOLDER: &str = "{max_summary_words}";
const AUTHOR_UNKNOWN: &str = "unknown";

/// Produces summaries of (possibly filtered) sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionSummarizer: Send + Sync {
    /// Whether the session warrants a new summary.
    fn should_summarize(&self, session: &Session) -> bool;

    /// Summarize the session's events. May record bookkeeping in `session.state`.
    async fn summarize(&self, ctx: &Context, session: &mut Session) -> Result<String>;

    /// Descriptive metadata
    fn metadata(&self) -> HashMap<String, Value>;
}

/// Predicate deciding whether to summarize
pub type SummaryChecker = Arc<dyn Fn(&Session) -> bool + Send + Sync>;

/// Parse the recorded last-included timestamp, if valid.
pub fn read_last_included_timestamp(session: &Session) -> Option<DateTime<Utc>> {
    let raw = session.get_state(LAST_INCLUDED_TS_KEY)?;
    let text = std::str::from_utf8(raw).ok()?;
    DateTime::parse_from_rfc3339(text).ok().map(|t| t.with_timezone(&Utc))
}

fn delta_events(session: &Session) -> Vec<&Event> {
    match read_last_included_timestamp(session) {
        Some(since) => session.events.iter().filter(|e| e.timestamp > since).collect(),
        None => session.events.iter().collect(),
    }
}

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// True when more than `threshold` events arrived since the last summary.
pub fn check_event_threshold(threshold: usize) -> SummaryChecker {
    Arc::new(move |session: &Session| delta_events(session).len() > threshold)
}

/// True when the newest event is older than `interval`.
pub fn check_time_threshold(interval: Duration) -> SummaryChecker {
    Arc::new(move |session: &Session| {
        let Some(last) = session.events.last() else {
            return false;
        };
        match chrono::Duration::from_std(interval) {
            Ok(interval) => Utc::now() - last.timestamp > interval,
            Err(_) => false,
        }
    })
}

/// True when the conversation text since the last summary exceeds `threshold` tokens.
pub fn check_token_threshold(threshold: usize) -> SummaryChecker {
    Arc::new(move |session: &Session| {
        let events: Vec<Event> = delta_events(session).into_iter().cloned().collect();
        let text = conversation_text(&events);
        !text.is_empty() && estimate_tokens(&text) > threshold
    })
}

/// Every check must pass (empty passes).
pub fn checks_all(checks: Vec<SummaryChecker>) -> SummaryChecker {
    Arc::new(move |session: &Session| checks.iter().all(|c| c(session)))
}

/// Some check must pass (empty fails).
pub fn checks_any(checks: Vec<SummaryChecker>) -> SummaryChecker {
    Arc::new(move |session: &Session| checks.iter().any(|c| c(session)))
}

/// `author: content` lines of the content-bearing events.
pub fn conversation_text(events: &[Event]) -> String {
    events
        .iter()
        .filter_map(|e| {
            let content = e.content();
            if content.is_empty() {
                return None;
            }
            let author = if e.author.is_empty() { AUTHOR_UNKNOWN } else { e.author.as_str() };
            Some(format!("{}: {}", author, content.trim()))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn default_prompt(max_words: usize) -> String {
    let mut prompt = String::from(
        "Analyze the following conversation between a user and an assistant, and provide a concise summary \
         focusing on important information that would be helpful for future interactions. Keep the summary \
         concise and to the point. Only include relevant information. Do not make anything up.",
    );
    if max_words > 0 {
        prompt.push_str(" Please keep the summary within ");
        prompt.push_str(MAX_SUMMARY_WORDS_PLACEHOLDER);
        prompt.push_str(" words.");
    }
    format!(
        "{}\n\n<conversation>\n{}\n</conversation>\n\nSummary:",
        prompt, CONVERSATION_TEXT_PLACEHOLDER
    )
}

/// Summarizer that asks a model for the summary.
#[derive(Clone)]
pub struct LlmSummarizer {
    model: Arc<dyn Model>,
    prompt: Option<String>,
    checks: Vec<SummaryChecker>,
    max_summary_words: usize,
}

impl fmt::Debug for LlmSummarizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmSummarizer")
            .field("model", &self.model.info().name)
            .field("checks", &self.checks.len())
            .field("max_summary_words", &self.max_summary_words)
            .finish()
    }
}

impl LlmSummarizer {
    /// Summarizer with the default prompt and no checks.
    pub fn new(model: Arc<dyn Model>) -> Self {
        Self { model, prompt: None, checks: Vec::new(), max_summary_words: 0 }
    }

    /// Custom prompt; must contain `{conversation_text}`.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        if !prompt.is_empty() {
            self.prompt = Some(prompt);
        }
        self
    }

    /// Add a trigger check; all checks must pass.
    pub fn with_check(mut self, check: SummaryChecker) -> Self {
        self.checks.push(check);
        self
    }

    /// Word budget substituted into `{max_summary_words}`.
    pub fn with_max_summary_words(mut self, words: usize) -> Self {
        self.max_summary_words = words;
        self
    }

    fn render_prompt(&self, conversation: &str) -> String {
        let template = self.prompt.clone().unwrap_or_else(|| default_prompt(self.max_summary_words));
        let words = if self.max_summary_words > 0 { self.max_summary_words.to_string() } else { String::new() };
        template
            .replacen(CONVERSATION_TEXT_PLACEHOLDER, conversation, 1)
            .replacen(MAX_SUMMARY_WORDS_PLACEHOLDER, &words, 1)
    }

    async fn generate(&self, ctx: &Context, conversation: &str) -> Result<String> {
        let request = Request {
            messages: vec![Message::user(self.render_prompt(conversation))],
            generation_config: GenerationConfig { stream: false, ..Default::default() },
            ..Default::default()
        };
        let mut stream = self.model.generate_content(ctx, request).await?;
        let mut summary = String::new();
        while let Some(rsp) = stream.next().await {
            if let Some(err) = &rsp.error {
                return Err(CoreError::UpstreamError(format!(
                    "model error during summarization: {}",
                    err.message
                )));
            }
            if let Some(msg) = rsp.first_message() {
                summary.push_str(&msg.content);
            }
            if rsp.done {
                break;
            }
        }
        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return Err(CoreError::UpstreamError(format!(
                "generated empty summary (input_chars={})",
                conversation.len()
            )));
        }
        Ok(summary)
    }
}

#[async_trait]
impl SessionSummarizer for LlmSummarizer {
    fn should_summarize(&self, session: &Session) -> bool {
        if session.events.is_empty() {
            return false;
        }
        self.checks.iter().all(|c| c(session))
    }

    async fn summarize(&self, ctx: &Context, session: &mut Session) -> Result<String> {
        if session.events.is_empty() {
            return Err(CoreError::ValidationError(format!(
                "no events to summarize for session {}",
                session.id
            )));
        }
        let conversation = conversation_text(&session.events);
        if conversation.is_empty() {
            return Err(CoreError::ValidationError(format!(
                "no conversation text extracted for session {} (events={})",
                session.id,
                session.events.len()
            )));
        }
        let text = self.generate(ctx, &conversation).await?;

        if let Some(last) = session.events.last() {
            let ts = last.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
            session.state.insert(LAST_INCLUDED_TS_KEY.to_string(), ts.into_bytes());
        }
        Ok(text)
    }

    fn metadata(&self) -> HashMap<String, Value> {
        HashMap::from([
            ("model_name".to_string(), json!(self.model.info().name)),
            ("model_available".to_string(), json!(true)),
            ("max_summary_words".to_string(), json!(self.max_summary_words)),
            ("check_functions".to_string(), json!(self.checks.len())),
        ])
    }
}
