//! # Trellis DSL
//!
//! Declarative agent graphs. A graph document (JSON or YAML) lists nodes,
//! static edges, conditional edges and state variables; the [`Compiler`]
//! turns it into a [`CompiledGraph`] and the [`Executor`] runs it over a
//! shared state map.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::{json, Map};
//! use trellis_dsl::{Compiler, Executor, RunOutcome};
//!
//! let yaml = r#"
//! version: "1"
//! name: double
//! nodes:
//!   - id: start
//!     node_type: builtin.start
//!   - id: double
//!     node_type: builtin.transform
//!     config:
//!       expr: "state.n * 2"
//!     outputs:
//!       - name: result
//!         target: { type: state, field: n }
//!   - id: end
//!     node_type: builtin.end
//! edges:
//!   - { source: start, target: double }
//!   - { source: double, target: end }
//! "#;
//!
//! let graph = Compiler::new().compile_yaml(yaml).unwrap();
//! let executor = Executor::new(Arc::new(graph));
//! let mut input = Map::new();
//! input.insert("n".into(), json!(21));
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! let outcome = rt.block_on(executor.run(&trellis_core::Context::new(), "doc", input)).unwrap();
//! assert_eq!(outcome.state()["n"].as_f64(), Some(42.0));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod compiler;
pub mod error;
pub mod executor;
pub mod external;
pub mod graph;
pub mod model_spec;
pub mod numconv;
pub mod reducer;
pub mod registry;
pub mod runtime;
pub mod schema;
pub mod tool_compiler;
pub mod web_search;

#[cfg(test)]
mod testing;

pub use compiler::{CompiledGraph, CompiledNode, Compiler, CompilerBuilder};
pub use error::{error_codes, DslError, Result, ValidationError};
pub use executor::{
    Checkpoint, CheckpointSaver, Executor, InMemoryCheckpointSaver, InterruptInfo, RunOutcome, DEFAULT_MAX_STEPS,
};
pub use external::{CodeExecutorFactory, KnowledgeFactory, KnowledgeSearchSpec, McpConnectionConfig, McpConnector};
pub use graph::{parse_graph_json, parse_graph_yaml, Graph, Node};
pub use model_spec::{ModelProvider, ModelSpec, StaticModelProvider};
pub use reducer::ReducerRegistry;
pub use registry::{Component, ComponentMetadata, ComponentRegistry, ParameterSpec};
pub use schema::StateSchema;
