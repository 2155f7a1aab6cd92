use crate::error::McpError;
use crate::types::{CallToolRequest, CallToolResponse, Tool};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::warn;

type ToolFn =
    Box<dyn Fn(CallToolRequest) -> BoxFuture<'static, anyhow::Result<CallToolResponse>> + Send + Sync>;

/// Named tools and their handlers. Filled once at startup, read-only afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tool_handlers: HashMap<String, ToolHandler>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, tool: Tool, f: F) -> Result<(), McpError>
    where
        F: Fn(CallToolRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<CallToolResponse>> + Send + 'static,
    {
        match self.tool_handlers.entry(tool.name.clone()) {
            Entry::Occupied(_) => Err(McpError::DuplicateTool(tool.name)),
            Entry::Vacant(slot) => {
                slot.insert(ToolHandler {
                    tool,
                    f: Box::new(move |req| f(req).boxed()),
                });
                Ok(())
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Result<&ToolHandler, McpError> {
        self.tool_handlers
            .get(name)
            .ok_or_else(|| McpError::UnknownTool(name.to_string()))
    }

    pub fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tool_handlers
            .get(name)
            .map(|tool_handler| tool_handler.tool.clone())
    }

    /// Every registered tool, ordered by name.
    pub fn list_tools(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self
            .tool_handlers
            .values()
            .map(|tool_handler| tool_handler.tool.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn len(&self) -> usize {
        self.tool_handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tool_handlers.is_empty()
    }

    /// Run the named tool.
    ///
    /// Only an unknown name is an `Err`; a failing or panicking handler
    /// produces an error-tagged response so the caller's loop keeps going.
    pub async fn call_tool(&self, request: CallToolRequest) -> Result<CallToolResponse, McpError> {
        let handler = self.lookup(&request.name)?;
        let name = request.name.clone();

        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| (handler.f)(request))) {
            Ok(future) => future,
            Err(panic) => return Ok(panicked(&name, panic.as_ref())),
        };

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                warn!("Tool {} failed: {:#}", name, e);
                Ok(CallToolResponse::error(format!(
                    "Error calling tool {}: {}",
                    name, e
                )))
            }
            Err(panic) => Ok(panicked(&name, panic.as_ref())),
        }
    }
}

fn panicked(name: &str, panic: &(dyn Any + Send)) -> CallToolResponse {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    warn!("Tool {} panicked: {}", name, reason);
    CallToolResponse::error(format!("Error calling tool {}: panicked: {}", name, reason))
}

pub struct ToolHandler {
    pub tool: Tool,
    f: ToolFn,
}
