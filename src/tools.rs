//! Tool handlers the model can call
//!
//! Tools are stateless; per-call context comes in through [`ToolContext`].

mod clock;
mod random;

pub use clock::CurrentTimeTool;
pub use random::RandomNumberTool;

use crate::error::ToolExecutionError;
use crate::protocol::ToolDefinition;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Context for one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Cancelled when the session closes
    pub cancel: CancellationToken,
    /// The call being served
    pub call_id: String,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken, call_id: impl Into<String>) -> Self {
        Self {
            cancel,
            call_id: call_id.into(),
        }
    }
}

/// A function the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name
    fn name(&self) -> &str;

    /// Description for the model
    fn description(&self) -> String;

    /// JSON schema for the arguments
    fn parameters(&self) -> Value;

    /// Run with parsed arguments.
    ///
    /// Long-running tools should watch `ctx.cancel` and stop when it fires.
    async fn run(&self, input: Value, ctx: ToolContext) -> Result<Value, ToolExecutionError>;
}

#[async_trait]
impl<T: Tool + ?Sized> Tool for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn description(&self) -> String {
        (**self).description()
    }

    fn parameters(&self) -> Value {
        (**self).parameters()
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> Result<Value, ToolExecutionError> {
        (**self).run(input, ctx).await
    }
}

/// Schema for a function that takes no arguments.
pub fn no_parameters() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolExecutionError>> + Send + Sync>;

/// A tool backed by a closure.
pub struct FnTool {
    name: String,
    description: String,
    parameters: Value,
    handler: Handler,
}

impl FnTool {
    /// Wrap a synchronous handler.
    pub fn sync<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Result<Value, ToolExecutionError> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |input: Value| {
                let handler = Arc::clone(&handler);
                async move { handler(input) }.boxed()
            }),
        }
    }

    /// Wrap an asynchronous handler.
    pub fn new_async<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolExecutionError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |input: Value| handler(input).boxed()),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> Result<Value, ToolExecutionError> {
        (self.handler)(input).await
    }
}

/// Applies the registry's timeout to a tool.
struct Timed {
    inner: Arc<dyn Tool>,
    timeout: Duration,
}

#[async_trait]
impl Tool for Timed {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> String {
        self.inner.description()
    }

    fn parameters(&self) -> Value {
        self.inner.parameters()
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> Result<Value, ToolExecutionError> {
        match tokio::time::timeout(self.timeout, self.inner.run(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ToolExecutionError::new(format!(
                "tool '{}' timed out after {}s",
                self.inner.name(),
                self.timeout.as_secs_f64()
            ))),
        }
    }
}

/// Tools available to a session, resolved by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    timeout: Option<Duration>,
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in tools.
    pub fn standard() -> Self {
        Self::new()
            .with_tool(CurrentTimeTool)
            .with_tool(RandomNumberTool)
    }

    /// Register a tool; a later tool with the same name replaces the earlier one.
    #[must_use]
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(Arc::new(tool));
        self
    }

    /// Fail calls that run longer than `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tool = Arc::clone(self.tools.iter().find(|t| t.name() == name)?);
        let Some(timeout) = self.timeout else {
            return Some(tool);
        };
        Some(Arc::new(Timed {
            inner: tool,
            timeout,
        }))
    }

    /// Definitions for `session.update`.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition::function(t.name(), t.description(), t.parameters()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
