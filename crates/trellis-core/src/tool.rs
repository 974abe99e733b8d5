//! Tool contracts and a simple registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{CoreError, Result};

/// Declaration a model sees for one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ToolDeclaration {
    /// Unique tool name
    pub name: String,
    /// What the tool does
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments object
    #[serde(default)]
    pub parameters: Value,
}

impl ToolDeclaration {
    /// Build a declaration
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self { name: name.into(), description: description.into(), parameters }
    }
}

/// A tool the model may call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Declaration shown to the model
    fn declaration(&self) -> ToolDeclaration;

    /// Execute with JSON arguments. Declaration-only tools keep the default.
    async fn call(&self, _ctx: &Context, _args: Value) -> Result<Value> {
        Err(CoreError::ValidationError(format!(
            "tool {} is declaration-only and cannot be called",
            self.declaration().name
        )))
    }
}

/// A dynamic group of tools (e.g. one MCP server).
#[async_trait]
pub trait ToolSet: Send + Sync {
    /// Toolset name, used to namespace and deduplicate
    fn name(&self) -> &str;

    /// Tools currently exposed
    async fn tools(&self, ctx: &Context) -> Result<Vec<Arc<dyn Tool>>>;

    /// Release transport resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Looks tools up by name.
pub trait ToolProvider: Send + Sync {
    /// Tool by name
    fn get(&self, name: &str) -> Option<Arc<dyn Tool>>;

    /// Several tools; unknown names are an error
    fn get_multiple(&self, names: &[String]) -> Result<Vec<Arc<dyn Tool>>> {
        names
            .iter()
            .map(|n| self.get(n).ok_or_else(|| CoreError::NotFound(format!("tool {} not found", n))))
            .collect()
    }

    /// Every tool
    fn get_all(&self) -> Vec<Arc<dyn Tool>>;
}

/// Name-keyed tool registry
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.declaration().name, tool);
    }

    /// Builder form of [`ToolRegistry::register`]
    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

impl ToolProvider for ToolRegistry {
    fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    fn get_all(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.values().cloned().collect()
    }
}

/// Tool built from a declaration and an async closure.
pub struct FunctionTool<F> {
    declaration: ToolDeclaration,
    func: F,
}

impl<F> FunctionTool<F> {
    /// Wrap a closure
    pub fn new(declaration: ToolDeclaration, func: F) -> Self {
        Self { declaration, func }
    }
}

#[async_trait]
impl<F, Fut> Tool for FunctionTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    fn declaration(&self) -> ToolDeclaration {
        self.declaration.clone()
    }

    async fn call(&self, _ctx: &Context, args: Value) -> Result<Value> {
        (self.func)(args).await
    }
}
