//! Tool host trait.

use std::future::Future;

use mcp::ToolCallResult;

use crate::tools::{ToolCall, ToolError, ToolSpec};

/// Trait for tool execution hosts.
///
/// Implementations provide tool specifications and execute tool calls.
/// Tool-level failures are data inside the [`ToolCallResult`]; a
/// [`ToolError`] means the call never reached a working tool.
pub trait ToolHost: Send + Sync {
    /// Get available tool specifications.
    fn specs(&self) -> &[ToolSpec];

    /// Execute a tool call.
    fn execute(
        &self,
        call: &ToolCall,
    ) -> impl Future<Output = Result<ToolCallResult, ToolError>> + Send;
}
