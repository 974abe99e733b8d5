//!
//! Trellis Core - shared contracts for the agent runtime
//!
//! Models, events, tools, the expression evaluator, token accounting,
//! rate-limit retry and shard hashing. Every other crate in the
//! workspace builds on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Invocation context and cancellation
pub mod context;

/// Error types
pub mod error;

/// Conversation events
pub mod event;

/// Expression evaluator
pub mod expression;

/// Shard hashing
pub mod hash;

/// Model contract and message types
pub mod model;

/// Rate-limit retry
pub mod retry;

/// Token usage accounting
pub mod token_tracker;

/// Tool contracts
pub mod tool;

pub use context::{Context, InvocationScope};
pub use error::{CoreError, ErrorKind, Result};
pub use event::{Event, StateMap, AUTHOR_SYSTEM, AUTHOR_USER};
pub use expression::{compile, compile_bool, eval, BoolProgram, ValueProgram};
pub use model::{
    AfterModelCallback, BeforeModelCallback, Choice, FunctionCall, GenerationConfig, Message, Model,
    ModelCallbacks, ModelInfo, Request, Response, ResponseError, ResponseStream, Role, StructuredOutput,
    ToolCall, Usage,
};
pub use retry::{retry_on_rate_limit, RateLimitRetryModel, RetryConfig};
pub use token_tracker::{TokenTracker, TokenUsage};
pub use tool::{FunctionTool, Tool, ToolDeclaration, ToolProvider, ToolRegistry, ToolSet};
