//! Conversation events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::model::{Message, Response, Role};

/// Raw state values keyed by (possibly prefixed) state key.
pub type StateMap = HashMap<String, Vec<u8>>;

/// Author used for synthetic runtime events.
pub const AUTHOR_SYSTEM: &str = "system";
/// Author used for user input events.
pub const AUTHOR_USER: &str = "user";

/// One entry of a session's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event id
    pub id: String,
    /// Invocation that produced the event
    #[serde(default)]
    pub invocation_id: String,
    /// Parent invocation, for nested agents
    #[serde(default)]
    pub parent_invocation_id: String,
    /// Author (agent name, `user`, `system`)
    #[serde(default)]
    pub author: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Model response carried by the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    /// The producer expects a completion signal
    #[serde(default)]
    pub requires_completion: bool,
    /// Hierarchical filter key (`a/b/c`)
    #[serde(default)]
    pub filter_key: String,
    /// Branch of the agent tree that produced it
    #[serde(default)]
    pub branch: String,
    /// Free-form tag
    #[serde(default)]
    pub tag: String,
    /// Streaming delta; never persisted
    #[serde(default)]
    pub partial: bool,
    /// State changes applied together with the append
    #[serde(default)]
    pub state_delta: StateMap,
}

impl Event {
    /// New event with a fresh id and the current time
    pub fn new(invocation_id: impl Into<String>, author: impl Into<String>, response: Option<Response>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            invocation_id: invocation_id.into(),
            parent_invocation_id: String::new(),
            author: author.into(),
            timestamp: Utc::now(),
            response,
            requires_completion: false,
            filter_key: String::new(),
            branch: String::new(),
            tag: String::new(),
            partial: false,
            state_delta: StateMap::new(),
        }
    }

    /// Event carrying a single message
    pub fn from_message(invocation_id: impl Into<String>, author: impl Into<String>, message: Message) -> Self {
        Self::new(invocation_id, author, Some(Response::from_message(message)))
    }

    /// Convenience: user text event
    pub fn user_text(invocation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::from_message(invocation_id, AUTHOR_USER, Message::user(text))
    }

    /// Set the timestamp
    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    /// Set the filter key
    pub fn with_filter_key(mut self, key: impl Into<String>) -> Self {
        self.filter_key = key.into();
        self
    }

    /// Add a state delta entry
    pub fn with_state_delta(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.state_delta.insert(key.into(), value);
        self
    }

    /// Non-partial, has a response, and some choice carries content or tool calls.
    pub fn is_valid_content(&self) -> bool {
        if self.partial {
            return false;
        }
        match &self.response {
            Some(rsp) => rsp.choices.iter().any(|c| c.message.has_payload()),
            None => false,
        }
    }

    /// First choice's message has the user role.
    pub fn is_user_message(&self) -> bool {
        self.first_message().map(|m| m.role == Role::User).unwrap_or(false)
    }

    /// First choice's message
    pub fn first_message(&self) -> Option<&Message> {
        self.response.as_ref().and_then(|r| r.first_message())
    }

    /// Text of the first choice, or empty
    pub fn content(&self) -> &str {
        self.first_message().map(|m| m.content.as_str()).unwrap_or("")
    }

    /// Hierarchical filter match: an empty filter or empty event key matches;
    /// otherwise one key must be a `/`-delimited prefix of the other.
    pub fn matches_filter(&self, filter: &str) -> bool {
        if filter.is_empty() || self.filter_key.is_empty() {
            return true;
        }
        let filter = format!("{}/", filter);
        let key = format!("{}/", self.filter_key);
        filter.starts_with(&key) || key.starts_with(&filter)
    }
}
