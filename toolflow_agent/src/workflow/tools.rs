//! Tool-invocation collaborator and the name-keyed tool registry.
//!
//! The orchestrator only ever sees a [`ToolInvoker`]: something that takes
//! a tool id and resolved parameters and returns a [`Value`]. What a tool
//! actually does is opaque to the engine.
//!
//! [`ToolRegistry`] is the standard invoker. It maps names to [`Tool`]
//! implementations, such as closure-backed [`FnTool`]s or the
//! [`GenerateTool`](crate::llm::GenerateTool) adapter.
//!
//! # Example
//!
//! ```ignore
//! use toolflow_agent::workflow::tools::{FnTool, ToolRegistry};
//! use toolflow_core::Value;
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(FnTool::new("echo", |params| async move {
//!     Ok(Value::Map(params))
//! }))?;
//! ```

use crate::llm::GenerationError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use toolflow_core::{Parameters, Value};

/// Errors that can occur during tool operations.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Tool not found in registry
    #[error("Tool not registered: {0}")]
    NotFound(String),

    /// Tool already registered
    #[error("Tool already registered: {0}")]
    AlreadyRegistered(String),

    /// Parameters rejected by the tool
    #[error("Invalid parameters for tool '{tool}': {reason}")]
    InvalidParameters { tool: String, reason: String },

    /// Tool ran and reported a failure
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Text-generation collaborator failed
    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    /// Any other error raised by a tool implementation
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ToolError {
    /// Returns false for errors a retry cannot fix.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ToolError::NotFound(_)
                | ToolError::AlreadyRegistered(_)
                | ToolError::InvalidParameters { .. }
        )
    }

    pub fn invalid_parameters(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::InvalidParameters {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}

/// The tool-invocation collaborator consumed by the orchestrator.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invokes `tool_id` with already-resolved parameters.
    async fn invoke(&self, tool_id: &str, parameters: &Parameters) -> Result<Value, ToolError>;
}

/// A named capability that can be registered in a [`ToolRegistry`].
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn invoke(&self, parameters: &Parameters) -> Result<Value, ToolError>;
}

/// Tool backed by an async closure.
///
/// The closure receives an owned copy of the parameters so the returned
/// future can be `'static`.
pub struct FnTool<F> {
    name: String,
    description: String,
    func: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Parameters) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            func,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Parameters) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, parameters: &Parameters) -> Result<Value, ToolError> {
        (self.func)(parameters.clone()).await
    }
}

impl<F> fmt::Debug for FnTool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool").field("name", &self.name).finish()
    }
}

/// Registry of tools indexed by name.
///
/// Cloning is cheap; clones share the registered tool objects.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Creates a new empty ToolRegistry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool under its own name.
    ///
    /// # Returns
    ///
    /// - `Ok(())` if registration succeeded
    /// - `Err(ToolError::AlreadyRegistered)` if a tool with the same name exists
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), ToolError> {
        self.register_arc(Arc::new(tool))
    }

    /// Registers a shared tool object.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::AlreadyRegistered(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Builder-style registration that replaces any tool with the same name.
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn list_tools(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list_tools())
            .finish()
    }
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    async fn invoke(&self, tool_id: &str, parameters: &Parameters) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(tool_id)
            .ok_or_else(|| ToolError::NotFound(tool_id.to_string()))?;
        tool.invoke(parameters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> impl Tool {
        FnTool::new("echo", |params: Parameters| async move { Ok(Value::Map(params)) })
            .with_description("Returns its parameters")
    }

    #[test]
    fn test_register_and_list() {
        let mut registry = ToolRegistry::new();
        registry.register(echo()).unwrap();
        registry
            .register(FnTool::new("noop", |_| async { Ok(Value::Bool(true)) }))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list_tools(), vec!["echo", "noop"]);
        assert!(registry.is_registered("echo"));
        assert_eq!(registry.get("echo").unwrap().description(), "Returns its parameters");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(echo()).unwrap();

        let err = registry.register(echo()).unwrap_err();
        assert!(matches!(err, ToolError::AlreadyRegistered(name) if name == "echo"));
    }

    #[tokio::test]
    async fn test_invoke_by_name() {
        let registry = ToolRegistry::new().with_tool(echo());
        let mut params = Parameters::new();
        params.insert("k".to_string(), Value::from("v"));

        let output = registry.invoke("echo", &params).await.unwrap();
        assert_eq!(output.as_map().unwrap()["k"], Value::from("v"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.invoke("missing", &Parameters::new()).await.unwrap_err();

        assert!(matches!(err, ToolError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_anyhow_errors_are_retryable() {
        let registry = ToolRegistry::new().with_tool(FnTool::new("flaky", |_| async {
            Err(anyhow::anyhow!("connection reset").into())
        }));

        let err = registry.invoke("flaky", &Parameters::new()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "connection reset");
    }
}
