use thiserror::Error;

/// Errors that keep a tool call from reaching a tool.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("timeout after {0}ms")]
    Timeout(u64),
    #[error("transport failed: {0}")]
    Transport(String),
}
