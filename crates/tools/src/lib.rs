//! Tool contract and per-request registry.
//!
//! Concrete file/exec/web tools are supplied by the embedding host; the
//! engine builds a fresh [`ToolRegistry`] per inbound request with the
//! request's [`ToolContext`] injected, and dispatches calls under a
//! per-tool timeout. Tool failures inside a turn become data: dispatch
//! returns `(content, is_error)` and never an `Err`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sb_domain::tool::ToolDefinition;

/// Request-scoped context injected into every tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub channel: String,
    pub chat_id: String,
    pub session_id: String,
    pub sender_id: String,
    /// Nesting depth when running under a subagent; 0 at top level.
    pub subagent_depth: u32,
    /// Whether write/edit tools may mutate the workspace.
    pub allow_writes: bool,
}

/// A callable tool exposed to the LLM.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    /// Run the tool. An `Err` is surfaced to the model as the tool output.
    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> sb_domain::error::Result<String>;
}

/// The tool set for one inbound request.
pub struct ToolRegistry {
    ctx: ToolContext,
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Definition order, preserved for the provider request.
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new(ctx: ToolContext) -> Self {
        Self {
            ctx,
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a tool. A duplicate name replaces the earlier entry.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_owned();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    /// Tool definitions in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.definition())
            .collect()
    }

    /// Invoke a tool under `timeout`. Returns `(content, is_error)`;
    /// unknown tools, failures, and timeouts all come back as error text.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> (String, bool) {
        let Some(tool) = self.tools.get(name) else {
            return (format!("unknown tool: {name}"), true);
        };

        match tokio::time::timeout(timeout, tool.invoke(&self.ctx, arguments)).await {
            Ok(Ok(output)) => (output, false),
            Ok(Err(e)) => {
                tracing::warn!(tool = name, error = %e, "tool invocation failed");
                (e.to_string(), true)
            }
            Err(_) => {
                tracing::warn!(tool = name, timeout_ms = timeout.as_millis() as u64, "tool timed out");
                (
                    format!("tool {name} timed out after {}s", timeout.as_secs()),
                    true,
                )
            }
        }
    }
}
