//!
//! Trellis Memory - long-term user memory
//!
//! Memory entries keyed by `(app, user)`, the `MemoryService` contract with
//! an in-memory implementation, the agent-facing memory tools, and the
//! extractor plus background worker that turn conversations into memory
//! operations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Background extraction
pub mod auto;

/// Memory records
pub mod entry;

/// Model-driven extraction
pub mod extractor;

/// Memory mutations
pub mod operation;

/// Service contract and in-memory store
pub mod service;

/// Memory tools
pub mod tool;

#[cfg(test)]
mod testing;

pub use auto::{AutoMemoryConfig, AutoMemoryWorker, MemoryJob, MemoryOperator, LAST_EXTRACT_AT_KEY};
pub use entry::{match_memory, search_tokens, Entry, Memory, MemoryKey, UserKey, DEFAULT_MEMORY_LIMIT};
pub use extractor::{
    check_message_threshold, check_time_interval, checks_all, checks_any, Checker, ExtractionContext, LlmExtractor,
    MemoryExtractor,
};
pub use operation::{parse_tool_call, Operation};
pub use service::{InMemoryMemoryService, InMemoryMemoryServiceBuilder, MemoryService};
pub use tool::MemoryTool;
