//! Tool-server side of the protocol: service trait, dispatch, TCP accept loop.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    ErrorKind, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    ListResourcesResult, ListToolsResult, PROTOCOL_VERSION, PeerInfo, ReadResourceParams,
    ReadResourceResult, ResourceDescriptor, ServerCapabilities, ToolCallRequest, ToolCallResult,
    ToolDescriptor, methods,
};
use crate::schema::{ArgumentSchema, Arguments};
use crate::MAX_MESSAGE_SIZE;

/// A tool offered by a [`ToolService`].
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: ArgumentSchema,
}

impl ToolDefinition {
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            tool_name: self.name.to_string(),
            description: self.description.to_string(),
            argument_schema: self.schema.to_json_schema(),
        }
    }
}

/// Failure raised by a tool implementation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl ToolFailure {
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidArguments,
            message: message.into(),
        }
    }

    pub fn capability(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::CapabilityExecution,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A capability exposed as one or more tools.
///
/// Arguments reach [`ToolService::call`] already validated against the
/// schema of the named tool. Implementations must not keep per-call state.
pub trait ToolService: Send + Sync + 'static {
    /// Name and version announced during `initialize`.
    fn info(&self) -> PeerInfo;

    /// Tools offered by this service.
    fn tools(&self) -> Vec<ToolDefinition>;

    /// Run one tool.
    fn call(
        &self,
        tool: &str,
        arguments: Arguments,
    ) -> impl Future<Output = std::result::Result<Value, ToolFailure>> + Send;

    /// Read-only documents offered next to the tools.
    fn resources(&self) -> Vec<ResourceDescriptor> {
        Vec::new()
    }

    /// Read one resource by URI.
    fn read_resource(
        &self,
        uri: &str,
    ) -> impl Future<Output = std::result::Result<String, ToolFailure>> + Send {
        let uri = uri.to_string();
        async move { Err(ToolFailure::invalid_arguments(format!("unknown resource: {uri}"))) }
    }
}

/// Serves a [`ToolService`] to any number of connections.
pub struct ToolServer<S> {
    service: Arc<S>,
    tools: Arc<Vec<ToolDefinition>>,
}

impl<S> Clone for ToolServer<S> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            tools: Arc::clone(&self.tools),
        }
    }
}

impl<S: ToolService> ToolServer<S> {
    pub fn new(service: S) -> Self {
        let tools = service.tools();
        Self {
            service: Arc::new(service),
            tools: Arc::new(tools),
        }
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Each connection runs as its own task; calls interleave at await points.
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        let info = self.service.info();
        info!(
            server = %info.name,
            addr = %listener.local_addr()?,
            tools = self.tools.len(),
            "tool server listening"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(server = %info.name, "tool server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection opened");
                        let server = self.clone();
                        tokio::spawn(async move {
                            match server.handle_connection(stream).await {
                                Ok(()) => debug!(%peer, "connection closed"),
                                Err(e) => debug!(%peer, error = %e, "connection dropped"),
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            let limit = MAX_MESSAGE_SIZE as u64 + 1;
            let bytes_read = (&mut reader).take(limit).read_line(&mut line).await?;
            if bytes_read == 0 {
                return Ok(());
            }

            if line.len() > MAX_MESSAGE_SIZE {
                let response = JsonRpcResponse::failure(
                    None,
                    JsonRpcError::new(JsonRpcError::INVALID_REQUEST, "message too large"),
                );
                write_message(&mut write_half, &response).await?;
                return Err(Error::MessageTooLarge {
                    size: line.len(),
                    max: MAX_MESSAGE_SIZE,
                });
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Some(response) = self.handle_line(trimmed).await {
                write_message(&mut write_half, &response).await?;
            }
        }
    }

    /// Handle one raw message. Returns `None` for notifications.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        match serde_json::from_str::<JsonRpcRequest>(line) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => Some(JsonRpcResponse::failure(
                None,
                JsonRpcError::new(JsonRpcError::PARSE_ERROR, format!("parse error: {e}")),
            )),
        }
    }

    /// Handle one parsed request. Returns `None` for notifications.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let outcome = self.dispatch(&request.method, request.params).await;
        let id = request.id?;
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(Some(id), result),
            Err(error) => JsonRpcResponse::failure(Some(id), error),
        })
    }

    async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<Value, JsonRpcError> {
        match method {
            methods::INITIALIZE => to_value(InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: ServerCapabilities {
                    tools: true,
                    resources: !self.service.resources().is_empty(),
                },
                server_info: self.service.info(),
            }),
            methods::INITIALIZED => Ok(Value::Null),
            methods::PING => Ok(serde_json::json!({})),
            methods::TOOLS_LIST => to_value(ListToolsResult {
                tools: self.tools.iter().map(ToolDefinition::descriptor).collect(),
            }),
            methods::TOOLS_CALL => {
                let request: ToolCallRequest = parse_params(params)?;
                to_value(self.call_tool(request).await)
            }
            methods::RESOURCES_LIST => to_value(ListResourcesResult {
                resources: self.service.resources(),
            }),
            methods::RESOURCES_READ => {
                let ReadResourceParams { uri } = parse_params(params)?;
                match self.service.read_resource(&uri).await {
                    Ok(text) => to_value(ReadResourceResult { uri, text }),
                    Err(failure) => {
                        let code = match failure.kind {
                            ErrorKind::CapabilityExecution => JsonRpcError::INTERNAL_ERROR,
                            _ => JsonRpcError::INVALID_PARAMS,
                        };
                        Err(JsonRpcError::new(code, failure.message))
                    }
                }
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    /// Validate and run one tool call.
    ///
    /// Always produces a terminal result: schema violations, capability
    /// errors, and panics inside the tool all come back as data.
    pub async fn call_tool(&self, request: ToolCallRequest) -> ToolCallResult {
        let ToolCallRequest {
            tool_name,
            arguments,
        } = request;

        let Some(tool) = self.tools.iter().find(|t| t.name == tool_name) else {
            debug!(tool = %tool_name, "unknown tool requested");
            return ToolCallResult::failed(ErrorKind::UnknownTool, format!("unknown tool: {tool_name}"));
        };

        let arguments = match tool.schema.validate(&arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                debug!(tool = %tool_name, error = %e, "rejected arguments");
                return ToolCallResult::failed(ErrorKind::InvalidArguments, e.to_string());
            }
        };

        let service = Arc::clone(&self.service);
        let name = tool_name.clone();
        let task = tokio::spawn(async move { service.call(&name, arguments).await });

        match task.await {
            Ok(Ok(payload)) => {
                debug!(tool = %tool_name, "tool call succeeded");
                ToolCallResult::ok(payload)
            }
            Ok(Err(failure)) => {
                warn!(tool = %tool_name, kind = %failure.kind, error = %failure.message, "tool call failed");
                ToolCallResult::failed(failure.kind, failure.message)
            }
            Err(e) => {
                error!(tool = %tool_name, error = %e, "tool task aborted");
                ToolCallResult::failed(
                    ErrorKind::CapabilityExecution,
                    format!("tool `{tool_name}` aborted: {e}"),
                )
            }
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<Value>,
) -> std::result::Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(JsonRpcError::invalid_params)
}

fn to_value(value: impl serde::Serialize) -> std::result::Result<Value, JsonRpcError> {
    serde_json::to_value(value)
        .map_err(|e| JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, e.to_string()))
}

async fn write_message<W>(writer: &mut W, message: &impl serde::Serialize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ArgKind;
    use serde_json::json;

    struct Echo;

    impl ToolService for Echo {
        fn info(&self) -> PeerInfo {
            PeerInfo {
                name: "echo".to_string(),
                version: None,
            }
        }

        fn tools(&self) -> Vec<ToolDefinition> {
            vec![
                ToolDefinition {
                    name: "echo",
                    description: "Echo the text back",
                    schema: ArgumentSchema::new().required("text", ArgKind::String, "Text"),
                },
                ToolDefinition {
                    name: "explode",
                    description: "Always fails",
                    schema: ArgumentSchema::new(),
                },
                ToolDefinition {
                    name: "panic",
                    description: "Panics",
                    schema: ArgumentSchema::new(),
                },
            ]
        }

        async fn call(&self, tool: &str, arguments: Arguments) -> std::result::Result<Value, ToolFailure> {
            match tool {
                "echo" => Ok(json!({ "text": arguments.str("text") })),
                "explode" => Err(ToolFailure::capability("network unreachable")),
                _ => panic!("boom"),
            }
        }
    }

    fn call(tool: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest::new(tool, arguments.as_object().cloned().unwrap_or_default())
    }

    #[tokio::test]
    async fn invalid_arguments_are_data_and_server_stays_usable() {
        let server = ToolServer::new(Echo);

        let failed = server.call_tool(call("echo", json!({}))).await;
        assert!(!failed.success);
        assert_eq!(failed.error_kind, Some(ErrorKind::InvalidArguments));

        let ok = server.call_tool(call("echo", json!({"text": "hi"}))).await;
        assert!(ok.success);
        assert_eq!(ok.payload, Some(json!({"text": "hi"})));
    }

    #[tokio::test]
    async fn capability_failure_becomes_result() {
        let server = ToolServer::new(Echo);
        let result = server.call_tool(call("explode", json!({}))).await;
        assert_eq!(result.error_kind, Some(ErrorKind::CapabilityExecution));
        assert_eq!(result.message.as_deref(), Some("network unreachable"));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let server = ToolServer::new(Echo);
        let result = server.call_tool(call("panic", json!({}))).await;
        assert_eq!(result.error_kind, Some(ErrorKind::CapabilityExecution));

        let ok = server.call_tool(call("echo", json!({"text": "still here"}))).await;
        assert!(ok.success);
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let server = ToolServer::new(Echo);
        let result = server.call_tool(call("missing", json!({}))).await;
        assert_eq!(result.error_kind, Some(ErrorKind::UnknownTool));
    }

    #[tokio::test]
    async fn tools_call_never_returns_rpc_error_for_bad_arguments() {
        let server = ToolServer::new(Echo);
        let line = r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"tool_name":"echo","arguments":{"text":5}}}"#;
        let response = server.handle_line(line).await.unwrap();
        assert!(response.error.is_none());
        let result: ToolCallResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidArguments));
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let server = ToolServer::new(Echo);
        let line = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        assert!(server.handle_line(line).await.is_none());
    }

    #[tokio::test]
    async fn unknown_method_and_garbage() {
        let server = ToolServer::new(Echo);

        let response = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"prompts/list"}"#)
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, JsonRpcError::METHOD_NOT_FOUND);

        let response = server.handle_line("not json").await.unwrap();
        assert_eq!(response.id, None);
        assert_eq!(response.error.unwrap().code, JsonRpcError::PARSE_ERROR);
    }

    #[tokio::test]
    async fn discovery_lists_descriptors() {
        let server = ToolServer::new(Echo);
        let response = server
            .handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await
            .unwrap();
        let list: ListToolsResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(list.tools.len(), 3);
        assert_eq!(list.tools[0].tool_name, "echo");
        assert_eq!(list.tools[0].argument_schema["required"], json!(["text"]));
    }
}
