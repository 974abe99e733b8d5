//!
//! Trellis Session - conversation sessions and their storage contract
//!
//! The session model with its scoped state and event log, the
//! `SessionService` trait implemented by the stores, append/get hooks,
//! consecutive-user handling, summarization and the background
//! persistence and summary pools.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Service configuration
pub mod config;

/// Consecutive user message handlers
pub mod consecutive;

/// Append/get middleware
pub mod hook;

/// Background worker pools
pub mod pool;

/// The store contract
pub mod service;

/// Session model
pub mod session;

/// Summarization
pub mod summary;

pub use config::SessionServiceConfig;
pub use consecutive::{
    insert_placeholder, merge_into_previous, remove_previous, skip_current, ConsecutiveUserHandler,
    INTERRUPTED_PLACEHOLDER,
};
pub use hook::{
    AppendEventBase, AppendEventContext, AppendEventHook, AppendEventNext, GetSessionBase, GetSessionContext,
    GetSessionHook, GetSessionNext, Hooks,
};
pub use pool::{EventPersister, PersistJob, PersistPool, SummaryJob, SummaryPool, WorkerShards};
pub use service::SessionService;
pub use session::{
    AppendOutcome, EventChanges, GetOptions, Key, ScopedDelta, Session, Summary, TrackEvent, UpsertedEvent, UserKey,
    STATE_PREFIX_APP, STATE_PREFIX_TEMP, STATE_PREFIX_USER, SUMMARY_FILTER_KEY_ALL_CONTENTS,
};
pub use summary::{
    create_session_summary_with_cascade, pick_summary_text, summarize_session, LlmSummarizer, SessionSummarizer,
    SummaryChecker, SummaryStore,
};
