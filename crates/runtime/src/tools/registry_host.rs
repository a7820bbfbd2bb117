//! Tool host backed by the servers listed in the registry.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use mcp::{Channel, ToolCallRequest, ToolCallResult, ToolDescriptor};
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::registry::{Endpoint, Registry};
use crate::tools::{ToolCall, ToolError, ToolHost, ToolSpec};
use crate::{Error, Result};

/// How hard to try when opening channels to registered servers.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Bound for the TCP connect and the handshake of one attempt.
    pub connect_timeout: Duration,
    /// Bound for each tool call.
    pub call_timeout: Duration,
    /// Attempts per server before it is declared unreachable.
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            call_timeout: mcp::DEFAULT_TIMEOUT,
            attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// A registry entry that could not be reached.
#[derive(Debug, Clone)]
pub struct Unreachable {
    pub name: String,
    pub endpoint: Endpoint,
    pub error: String,
}

/// Routes tool calls to the channel of the server that offers the tool.
pub struct RegistryToolHost {
    channels: BTreeMap<String, Channel>,
    routes: HashMap<String, String>,
    specs: Vec<ToolSpec>,
    call_timeout: Duration,
}

impl RegistryToolHost {
    /// Read the registry and connect to every entry in it.
    ///
    /// Fails only if the registry is missing or unreadable; dead entries
    /// are returned as [`Unreachable`].
    pub async fn from_registry(
        registry: &Registry,
        options: &ConnectOptions,
    ) -> Result<(Self, Vec<Unreachable>)> {
        let entries = registry.read()?;
        Ok(Self::connect(&entries, options).await)
    }

    /// Connect to each endpoint, skipping the ones that do not answer.
    pub async fn connect(
        entries: &BTreeMap<String, Endpoint>,
        options: &ConnectOptions,
    ) -> (Self, Vec<Unreachable>) {
        let mut host = Self {
            channels: BTreeMap::new(),
            routes: HashMap::new(),
            specs: Vec::new(),
            call_timeout: options.call_timeout,
        };
        let mut unreachable = Vec::new();

        for (name, endpoint) in entries {
            match open_channel(name, endpoint, options).await {
                Ok(channel) => host.add(channel).await,
                Err(e) => {
                    warn!(server = %name, %endpoint, error = %e, "skipping unreachable server");
                    unreachable.push(Unreachable {
                        name: name.clone(),
                        endpoint: endpoint.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            servers = host.channels.len(),
            tools = host.specs.len(),
            skipped = unreachable.len(),
            "tool host ready"
        );
        (host, unreachable)
    }

    async fn add(&mut self, channel: Channel) {
        let server = channel.name().to_string();
        for tool in channel.tools().await {
            if let Some(owner) = self.routes.get(&tool.tool_name) {
                warn!(tool = %tool.tool_name, %owner, ignored = %server, "duplicate tool name");
                continue;
            }
            self.routes.insert(tool.tool_name.clone(), server.clone());
            self.specs.push(ToolSpec {
                name: tool.tool_name,
                description: tool.description,
                schema: tool.argument_schema,
                server: server.clone(),
            });
        }
        self.channels.insert(server, channel);
    }

    /// Names of the connected servers.
    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn channel(&self, server: &str) -> Option<&Channel> {
        self.channels.get(server)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl ToolHost for RegistryToolHost {
    fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    async fn execute(&self, call: &ToolCall) -> std::result::Result<ToolCallResult, ToolError> {
        let channel = self
            .routes
            .get(&call.name)
            .and_then(|server| self.channels.get(server))
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;

        let arguments = match &call.input {
            Value::Object(map) => map.clone(),
            Value::Null => Default::default(),
            other => {
                return Err(ToolError::InvalidInput(format!(
                    "arguments must be a JSON object, got {other}"
                )));
            }
        };

        debug!(call = %call.id, tool = %call.name, server = %channel.name(), "calling tool");
        let request = ToolCallRequest::new(call.name.clone(), arguments);
        match timeout(self.call_timeout, channel.call_tool(request)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(mcp::Error::Timeout)) | Err(_) => {
                Err(ToolError::Timeout(self.call_timeout.as_millis() as u64))
            }
            Ok(Err(e)) => Err(ToolError::Transport(e.to_string())),
        }
    }
}

/// Connect to one endpoint and return the tools it offers.
pub async fn probe(
    name: &str,
    endpoint: &Endpoint,
    connect_timeout: Duration,
) -> Result<Vec<ToolDescriptor>> {
    let options = ConnectOptions {
        connect_timeout,
        attempts: 1,
        ..ConnectOptions::default()
    };
    let channel = open_channel(name, endpoint, &options).await?;
    Ok(channel.tools().await)
}

async fn open_channel(name: &str, endpoint: &Endpoint, options: &ConnectOptions) -> Result<Channel> {
    let addr = endpoint.socket_addr()?;
    let attempts = options.attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = async {
            let channel = Channel::connect(name, addr, options.connect_timeout)
                .await?
                .with_timeout(options.call_timeout);
            timeout(options.connect_timeout, channel.initialize())
                .await
                .map_err(|_| mcp::Error::Timeout)??;
            Ok::<_, mcp::Error>(channel)
        }
        .await;

        match result {
            Ok(channel) => return Ok(channel),
            Err(e) if attempt < attempts => {
                debug!(server = %name, attempt, error = %e, "connect failed, retrying");
                attempt += 1;
                sleep(options.retry_delay).await;
            }
            Err(e) => return Err(Error::Mcp(e)),
        }
    }
}
