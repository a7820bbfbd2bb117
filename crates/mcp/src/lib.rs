//! Tool-server protocol library.
//!
//! Tool servers and their clients speak JSON-RPC 2.0 over TCP, one JSON
//! object per line, using MCP-style method names (`initialize`,
//! `tools/list`, `tools/call`, `resources/list`, `resources/read`, `ping`).
//!
//! The server half is a [`ToolService`] wrapped in a [`ToolServer`]; the
//! client half is a [`Channel`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mcp::{Channel, ToolCallRequest};
//!
//! # async fn example() -> mcp::Result<()> {
//! let addr = "127.0.0.1:8001".parse().unwrap();
//! let channel = Channel::connect("weather", addr, Duration::from_secs(2)).await?;
//! channel.initialize().await?;
//!
//! for tool in channel.tools().await {
//!     println!("Tool: {}", tool.tool_name);
//! }
//!
//! let mut arguments = serde_json::Map::new();
//! arguments.insert("city".into(), "Taipei".into());
//! let result = channel
//!     .call_tool(ToolCallRequest::new("query_weather", arguments))
//!     .await?;
//! println!("success: {}", result.success);
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod protocol;
pub mod schema;
mod server;

/// Largest single protocol message accepted on either side (16 MiB).
/// Sized for base64-encoded presentation files.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

pub use client::{Channel, DEFAULT_TIMEOUT};
pub use error::{Error, Result};
pub use protocol::{
    ErrorKind, InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    ListResourcesResult, ListToolsResult, PROTOCOL_VERSION, PeerInfo, ReadResourceParams,
    ReadResourceResult, RequestId, ResourceDescriptor, ServerCapabilities, ToolCallRequest,
    ToolCallResult, ToolDescriptor, methods,
};
pub use schema::{ArgKind, ArgValue, ArgumentSchema, Arguments, SchemaError};
pub use server::{ToolDefinition, ToolFailure, ToolServer, ToolService};
