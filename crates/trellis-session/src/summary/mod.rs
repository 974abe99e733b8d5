//! Session summarization: delta computation, per-key summarization and the
//! branch-to-session cascade shared by the synchronous and pooled paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use trellis_core::{Context, Event, Message, Result, AUTHOR_SYSTEM};

use crate::session::{Key, Session, Summary, SUMMARY_FILTER_KEY_ALL_CONTENTS};

pub mod summarizer;

pub use summarizer::{
    check_event_threshold, check_time_threshold, check_token_threshold, checks_all, checks_any, conversation_text,
    estimate_tokens, read_last_included_timestamp, LlmSummarizer, SessionSummarizer, SummaryChecker,
    LAST_INCLUDED_TS_KEY,
};

/// Storage of summaries by `(session, filter_key)`.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Current summary for the key, if any.
    async fn load_summary(&self, ctx: &Context, key: &Key, filter_key: &str) -> Result<Option<Summary>>;

    /// Store `summary` unless a newer one is already present. Returns whether it was written.
    async fn store_summary(&self, ctx: &Context, key: &Key, filter_key: &str, summary: Summary) -> Result<bool>;
}

/// Events newer than `since` matching `filter_key`, plus the newest timestamp seen.
pub fn compute_delta_since(
    session: &Session,
    since: Option<DateTime<Utc>>,
    filter_key: &str,
) -> (Vec<Event>, Option<DateTime<Utc>>) {
    let mut latest = None;
    let delta: Vec<Event> = session
        .events
        .iter()
        .filter(|e| since.map_or(true, |s| e.timestamp > s))
        .filter(|e| e.matches_filter(filter_key))
        .inspect(|e| {
            if latest.map_or(true, |l| e.timestamp > l) {
                latest = Some(e.timestamp);
            }
        })
        .cloned()
        .collect();
    (delta, latest)
}

/// Put the previous summary text in front of the delta as a system event.
pub fn prepend_prev_summary(prev: Option<&Summary>, delta: Vec<Event>) -> Vec<Event> {
    let Some(prev) = prev.filter(|p| !p.summary.is_empty()) else {
        return delta;
    };
    let mut events = Vec::with_capacity(delta.len() + 1);
    events.push(Event::from_message("", AUTHOR_SYSTEM, Message::system(prev.summary.clone())).with_timestamp(prev.updated_at));
    events.extend(delta);
    events
}

/// Summarize one filter key of a session.
///
/// Returns `None` when there is nothing new (and `force` is off), when the
/// summarizer declines, or when it produces empty text.
pub async fn summarize_session(
    ctx: &Context,
    summarizer: &dyn SessionSummarizer,
    session: &Session,
    filter_key: &str,
    prev: Option<&Summary>,
    force: bool,
) -> Result<Option<Summary>> {
    let (delta, latest) = compute_delta_since(session, prev.map(|p| p.updated_at), filter_key);
    if delta.is_empty() && !force {
        debug!(session_id = %session.id, filter_key, "no new events to summarize");
        return Ok(None);
    }
    let has_delta = !delta.is_empty();

    let mut tmp = Session::new(
        session.app_name.clone(),
        session.user_id.clone(),
        format!("{}:{}", session.id, filter_key),
    );
    tmp.state = session.state.clone();
    tmp.events = prepend_prev_summary(prev, delta);
    tmp.created_at = session.created_at;

    if !force && !summarizer.should_summarize(&tmp) {
        debug!(session_id = %session.id, filter_key, "summarizer declined");
        return Ok(None);
    }

    let text = summarizer.summarize(ctx, &mut tmp).await?;
    if text.is_empty() {
        return Ok(None);
    }

    let updated_at = if has_delta {
        read_last_included_timestamp(&tmp).or(latest).unwrap_or_else(Utc::now)
    } else {
        prev.map(|p| p.updated_at).unwrap_or_else(Utc::now)
    };
    Ok(Some(Summary { summary: text, topics: Vec::new(), updated_at }))
}

/// Summarize `filter_key` against the stored previous summary and store the result.
pub async fn summarize_and_store(
    ctx: &Context,
    store: &dyn SummaryStore,
    summarizer: &dyn SessionSummarizer,
    session: &Session,
    filter_key: &str,
    force: bool,
) -> Result<Option<Summary>> {
    let key = session.key();
    let prev = store.load_summary(ctx, &key, filter_key).await?;
    let Some(summary) = summarize_session(ctx, summarizer, session, filter_key, prev.as_ref(), force).await? else {
        return Ok(None);
    };
    let written = store.store_summary(ctx, &key, filter_key, summary.clone()).await?;
    debug!(session_id = %session.id, filter_key, written, "summary stored");
    Ok(Some(summary))
}

/// True when every event of the session falls under `filter_key`.
pub fn all_events_match(session: &Session, filter_key: &str) -> bool {
    session.events.iter().all(|e| e.matches_filter(filter_key))
}

/// Summarize `filter_key` and keep the full-session summary current.
pub async fn create_session_summary_with_cascade(
    ctx: &Context,
    store: &dyn SummaryStore,
    summarizer: &dyn SessionSummarizer,
    session: &Session,
    filter_key: &str,
    force: bool,
) -> Result<()> {
    if filter_key == SUMMARY_FILTER_KEY_ALL_CONTENTS {
        summarize_and_store(ctx, store, summarizer, session, filter_key, force).await?;
        return Ok(());
    }

    let branch = summarize_and_store(ctx, store, summarizer, session, filter_key, force).await?;
    if all_events_match(session, filter_key) {
        if let Some(summary) = branch {
            store
                .store_summary(ctx, &session.key(), SUMMARY_FILTER_KEY_ALL_CONTENTS, summary)
                .await?;
        }
        return Ok(());
    }
    summarize_and_store(ctx, store, summarizer, session, SUMMARY_FILTER_KEY_ALL_CONTENTS, force).await?;
    Ok(())
}

/// Summary text for `filter_key`, falling back to the full-session summary.
/// Empty summaries and those older than `min_time` are ignored.
pub fn pick_summary_text(
    summaries: &HashMap<String, Summary>,
    filter_key: &str,
    min_time: Option<DateTime<Utc>>,
) -> Option<String> {
    let usable = |s: &&Summary| !s.summary.is_empty() && min_time.map_or(true, |t| s.updated_at >= t);
    summaries
        .get(filter_key)
        .filter(usable)
        .or_else(|| summaries.get(SUMMARY_FILTER_KEY_ALL_CONTENTS).filter(usable))
        .map(|s| s.summary.clone())
}

/// Set-if-newer on a summary map; returns whether `summary` was written.
///
/// Only a strictly newer `updated_at` replaces the stored summary.
pub fn store_if_newer(summaries: &mut HashMap<String, Summary>, filter_key: &str, summary: Summary) -> bool {
    match summaries.get(filter_key) {
        Some(existing) if existing.updated_at >= summary.updated_at => false,
        _ => {
            summaries.insert(filter_key.to_string(), summary);
            true
        }
    }
}
