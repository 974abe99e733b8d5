use std::fmt;
use thiserror::Error;
use trellis_core::CoreError;

/// A compile-time problem in a graph document, located by node and field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Error code (one of [`error_codes`])
    pub code: &'static str,

    /// Human-readable error message
    pub message: String,

    /// Node the error belongs to, if any
    pub node_id: Option<String>,

    /// Config field the error belongs to, if any
    pub field: Option<String>,
}

impl ValidationError {
    /// Error with a code and message
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), node_id: None, field: None }
    }

    /// Attach the offending node
    pub fn at_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Attach the offending field
    pub fn in_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        match (&self.node_id, &self.field) {
            (Some(node), Some(field)) => write!(f, " (node {}, field {})", node, field),
            (Some(node), None) => write!(f, " (node {})", node),
            (None, Some(field)) => write!(f, " (field {})", field),
            (None, None) => Ok(()),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validation error codes
pub mod error_codes {
    /// Edge or config references something that does not exist
    pub const INVALID_REFERENCE: &str = "ERR_DSL_VALIDATION_INVALID_REFERENCE";

    /// Duplicate or empty node id
    pub const DUPLICATE_ID: &str = "ERR_DSL_VALIDATION_DUPLICATE_ID";

    /// Missing required field
    pub const MISSING_REQUIRED_FIELD: &str = "ERR_DSL_VALIDATION_MISSING_REQUIRED_FIELD";

    /// Invalid configuration value
    pub const INVALID_CONFIG: &str = "ERR_DSL_VALIDATION_INVALID_CONFIG";

    /// Node type is neither builtin nor registered
    pub const UNKNOWN_NODE_TYPE: &str = "ERR_DSL_VALIDATION_UNKNOWN_NODE_TYPE";

    /// Reducer name is not registered
    pub const UNKNOWN_REDUCER: &str = "ERR_DSL_VALIDATION_UNKNOWN_REDUCER";

    /// Expression failed to compile
    pub const INVALID_EXPRESSION: &str = "ERR_DSL_VALIDATION_INVALID_EXPRESSION";

    /// Structural while loop is malformed
    pub const INVALID_WHILE: &str = "ERR_DSL_VALIDATION_INVALID_WHILE";

    /// Node requires a single upstream but has several
    pub const MULTIPLE_UPSTREAMS: &str = "ERR_DSL_VALIDATION_MULTIPLE_UPSTREAMS";

    /// Tools configuration is invalid or collides
    pub const INVALID_TOOLS: &str = "ERR_DSL_VALIDATION_INVALID_TOOLS";

    /// Graph has no usable entry point or too many start nodes
    pub const INVALID_ENTRY: &str = "ERR_DSL_VALIDATION_INVALID_ENTRY";
}

/// All possible errors that can occur while compiling or executing a graph
#[derive(Error, Debug)]
pub enum DslError {
    /// Errors that occur during YAML parsing
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Errors that occur during JSON processing
    #[error("JSON processing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A compile-time validation error
    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),

    /// Unsupported document version
    #[error("Unsupported DSL version: {0}")]
    UnsupportedVersion(String),

    /// A node failed while running
    #[error("node {node_id} failed: {source}")]
    NodeFailed {
        /// Failing node
        node_id: String,
        /// Underlying cause
        source: CoreError,
    },

    /// No conditional case matched and no default is set
    #[error("no case matched for conditional edge from {0} and no default specified")]
    NoRoute(String),

    /// The step guard tripped
    #[error("graph exceeded {0} steps")]
    MaxStepsExceeded(usize),

    /// Checkpoint lookup or resume failure
    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    /// Run cancelled through its context
    #[error("execution cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl DslError {
    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            DslError::YamlError(_) => "ERR_DSL_YAML_PARSE",
            DslError::JsonError(_) => "ERR_DSL_JSON_PARSE",
            DslError::ValidationError(err) => err.code,
            DslError::UnsupportedVersion(_) => "ERR_DSL_UNSUPPORTED_VERSION",
            DslError::NodeFailed { .. } => "ERR_DSL_NODE_FAILED",
            DslError::NoRoute(_) => "ERR_DSL_NO_ROUTE",
            DslError::MaxStepsExceeded(_) => "ERR_DSL_MAX_STEPS",
            DslError::CheckpointError(_) => "ERR_DSL_CHECKPOINT",
            DslError::Cancelled => "ERR_DSL_CANCELLED",
            DslError::InternalError(_) => "ERR_DSL_INTERNAL",
        }
    }

    /// The validation error, if this is one
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            DslError::ValidationError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DslError> for CoreError {
    fn from(err: DslError) -> Self {
        match err {
            DslError::NodeFailed { source, .. } => source,
            DslError::Cancelled => CoreError::Cancelled("graph execution cancelled".to_string()),
            DslError::CheckpointError(msg) => CoreError::NotFound(msg),
            DslError::YamlError(_) | DslError::JsonError(_) => CoreError::SerializationError(err.to_string()),
            DslError::ValidationError(_) | DslError::UnsupportedVersion(_) => CoreError::ValidationError(err.to_string()),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

/// Result alias for DSL operations
pub type Result<T> = std::result::Result<T, DslError>;
