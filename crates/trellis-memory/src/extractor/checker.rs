//! Extraction triggers.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use trellis_core::Message;

use crate::entry::UserKey;

/// What a checker sees when deciding whether to extract.
#[derive(Debug, Clone, Default)]
pub struct ExtractionContext {
    /// Owner of the memories
    pub user_key: UserKey,
    /// Conversation messages since the last extraction
    pub messages: Vec<Message>,
    /// Previous extraction time, unset on the first run
    pub last_extract_at: Option<DateTime<Utc>>,
}

/// Predicate deciding whether to extract
pub type Checker = Arc<dyn Fn(&ExtractionContext) -> bool + Send + Sync>;

/// More than `threshold` new messages.
pub fn check_message_threshold(threshold: usize) -> Checker {
    Arc::new(move |ctx: &ExtractionContext| ctx.messages.len() > threshold)
}

/// Never extracted, or more than `interval` since the last extraction.
pub fn check_time_interval(interval: Duration) -> Checker {
    Arc::new(move |ctx: &ExtractionContext| {
        let Some(last) = ctx.last_extract_at else {
            return true;
        };
        match chrono::Duration::from_std(interval) {
            Ok(interval) => Utc::now() - last > interval,
            Err(_) => false,
        }
    })
}

/// Every check must pass (empty passes).
pub fn checks_all(checks: Vec<Checker>) -> Checker {
    Arc::new(move |ctx: &ExtractionContext| checks.iter().all(|c| c(ctx)))
}

/// Some check must pass (empty fails).
pub fn checks_any(checks: Vec<Checker>) -> Checker {
    Arc::new(move |ctx: &ExtractionContext| checks.iter().any(|c| c(ctx)))
}
