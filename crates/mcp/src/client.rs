//! Client side of a tool-server channel (connect, discover, invoke).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{
    InitializeParams, InitializeResult, JsonRpcRequest, JsonRpcResponse, ListResourcesResult,
    ListToolsResult, ReadResourceParams, ReadResourceResult, RequestId, ResourceDescriptor,
    ToolCallRequest, ToolCallResult, ToolDescriptor, methods,
};
use crate::MAX_MESSAGE_SIZE;

/// Default timeout for a single request/response exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Bytes of a response line not yet complete. Kept across exchanges so a
    /// timed-out read does not leave the stream mid-message.
    pending: Vec<u8>,
}

/// A channel to one running tool server.
///
/// The channel does not own the server process: dropping it only closes the
/// socket.
pub struct Channel {
    name: String,
    addr: SocketAddr,
    timeout: Duration,
    connection: Mutex<Connection>,
    next_id: AtomicI64,
    server_info: Mutex<Option<InitializeResult>>,
    tools: Mutex<Vec<ToolDescriptor>>,
}

impl Channel {
    /// Open a TCP connection to a tool server.
    ///
    /// `connect_timeout` bounds only the TCP connect; every later exchange is
    /// bounded by the channel's request timeout.
    pub async fn connect(
        name: impl Into<String>,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|source| Error::Connect { addr, source })?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            name: name.into(),
            addr,
            timeout: DEFAULT_TIMEOUT,
            connection: Mutex::new(Connection {
                reader: BufReader::new(read_half),
                writer: write_half,
                pending: Vec::new(),
            }),
            next_id: AtomicI64::new(1),
            server_info: Mutex::new(None),
            tools: Mutex::new(Vec::new()),
        })
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Registry name of the server on the other end.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Perform the handshake and fetch the tool list.
    pub async fn initialize(&self) -> Result<&Self> {
        let result: InitializeResult = self
            .request(methods::INITIALIZE, Some(InitializeParams::default()))
            .await?;
        self.notify(methods::INITIALIZED).await?;

        debug!(
            channel = %self.name,
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "channel initialized"
        );
        *self.server_info.lock().await = Some(result);

        self.refresh_tools().await?;
        Ok(self)
    }

    pub async fn is_initialized(&self) -> bool {
        self.server_info.lock().await.is_some()
    }

    /// Server info (after initialization).
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.lock().await.clone()
    }

    /// Refresh the list of available tools.
    pub async fn refresh_tools(&self) -> Result<()> {
        let result: ListToolsResult = self.request(methods::TOOLS_LIST, None::<()>).await?;
        *self.tools.lock().await = result.tools;
        Ok(())
    }

    /// Tools discovered at the last refresh.
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.lock().await.clone()
    }

    /// Invoke a tool. Tool-level failures come back inside the result.
    pub async fn call_tool(&self, request: ToolCallRequest) -> Result<ToolCallResult> {
        if !self.is_initialized().await {
            return Err(Error::NotInitialized);
        }
        self.request(methods::TOOLS_CALL, Some(request)).await
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        let result: ListResourcesResult =
            self.request(methods::RESOURCES_LIST, None::<()>).await?;
        Ok(result.resources)
    }

    pub async fn read_resource(&self, uri: impl Into<String>) -> Result<String> {
        let params = ReadResourceParams { uri: uri.into() };
        let result: ReadResourceResult = self.request(methods::RESOURCES_READ, Some(params)).await?;
        Ok(result.text)
    }

    /// Round-trip liveness check.
    pub async fn ping(&self) -> Result<()> {
        let _: serde_json::Value = self.request(methods::PING, None::<()>).await?;
        Ok(())
    }

    // --- Internal methods ---

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request<P, R>(&self, method: &str, params: Option<P>) -> Result<R>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let id = self.next_request_id();
        let mut request = JsonRpcRequest::new(id.clone(), method);
        if let Some(p) = params {
            request = request.with_params(p);
        }
        let request_json = serde_json::to_string(&request)?;

        // One exchange at a time per channel so responses cannot interleave.
        let mut connection = self.connection.lock().await;
        let response = timeout(self.timeout, self.exchange(&mut connection, &id, &request_json))
            .await
            .map_err(|_| Error::Timeout)??;

        let result_value = response.into_result()?;
        let result: R = serde_json::from_value(result_value)?;
        Ok(result)
    }

    /// Send one request and read until its response arrives.
    ///
    /// Responses to earlier requests that timed out are discarded.
    async fn exchange(
        &self,
        connection: &mut Connection,
        id: &RequestId,
        request_json: &str,
    ) -> Result<JsonRpcResponse> {
        write_line(&mut connection.writer, request_json).await?;
        loop {
            let response = read_response(connection).await?;
            match &response.id {
                Some(got) if got == id => return Ok(response),
                Some(got) => {
                    debug!(channel = %self.name, expected = ?id, ?got, "discarding stale response")
                }
                None => {
                    return Err(Error::InvalidResponse(format!(
                        "server rejected request {id:?}: {:?}",
                        response.error
                    )));
                }
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let notification = serde_json::to_string(&JsonRpcRequest::notification(method))?;
        let mut connection = self.connection.lock().await;
        write_line(&mut connection.writer, &notification).await
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn read_response(connection: &mut Connection) -> Result<JsonRpcResponse> {
    loop {
        let limit = (MAX_MESSAGE_SIZE + 1).saturating_sub(connection.pending.len());
        let bytes_read = (&mut connection.reader)
            .take(limit as u64)
            .read_until(b'\n', &mut connection.pending)
            .await?;
        if bytes_read == 0 {
            return Err(Error::ServerClosed);
        }

        let size = connection.pending.len();
        if size > MAX_MESSAGE_SIZE {
            connection.pending.clear();
            return Err(Error::MessageTooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if connection.pending.last() != Some(&b'\n') {
            continue;
        }

        let line = std::mem::take(&mut connection.pending);
        let text = String::from_utf8_lossy(&line);
        if !text.trim().is_empty() {
            return Ok(serde_json::from_str(text.trim())?);
        }
    }
}
