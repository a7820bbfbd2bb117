//! Client-side tool execution.
//!
//! A [`ToolHost`] is the boundary between whatever drives the conversation
//! and the tool servers doing the work.

pub mod errors;
mod registry_host;
mod r#trait;
mod types;

pub use errors::ToolError;
pub use r#trait::ToolHost;
pub use registry_host::{ConnectOptions, RegistryToolHost, Unreachable, probe};
pub use types::{ToolCall, ToolSpec};
