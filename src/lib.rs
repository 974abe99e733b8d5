//!
//! Trellis - agent runtime core
//!
//! Facade over the workspace crates: sessions and their stores, memory
//! extraction, and the graph DSL compiler/executor.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use trellis_core as core;
pub use trellis_dsl as dsl;
pub use trellis_memory as memory;
pub use trellis_monitoring as monitoring;
pub use trellis_session as session;
pub use trellis_session_inmemory as session_inmemory;
#[cfg(feature = "sqlite")]
pub use trellis_session_sqlite as session_sqlite;

pub use trellis_core::{Context, CoreError, ErrorKind};
