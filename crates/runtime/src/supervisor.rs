//! Tool-server process supervisor.
//!
//! A [`Supervisor`] owns every process it launches for one session. It
//! allocates ports, spawns servers, waits for each to answer the protocol
//! handshake as the expected capability, writes the registry once all
//! launches resolved, and terminates them on request. Crashed servers are not restarted; liveness is only checked at
//! startup and when [`Supervisor::refresh_status`] is called.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use mcp::Channel;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::ports::{DEFAULT_SCAN_LIMIT, PortAllocator};
use crate::registry::Registry;
use crate::shutdown::{Termination, terminate};
use crate::spec::ToolServerSpec;
use crate::{Error, Result};

/// Upper bound for the readiness poll backoff.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle state of a launched server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one launched server. The process handle itself never leaves
/// the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningServerRecord {
    pub name: String,
    pub host: String,
    pub assigned_port: Option<u16>,
    pub pid: Option<u32>,
    pub status: ServerStatus,
    /// Why the server failed, if it did.
    pub error: Option<String>,
}

impl RunningServerRecord {
    fn new(name: &str, host: IpAddr) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            assigned_port: None,
            pid: None,
            status: ServerStatus::Starting,
            error: None,
        }
    }

    fn fail(&mut self, error: &Error) {
        self.status = ServerStatus::Failed;
        self.error = Some(error.to_string());
    }
}

/// Timing and addressing knobs.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub host: IpAddr,
    /// How long a server gets to answer the handshake.
    pub ready_timeout: Duration,
    /// First readiness poll delay; doubles up to one second.
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    pub port_scan_limit: u16,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ready_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            grace_period: Duration::from_secs(5),
            port_scan_limit: DEFAULT_SCAN_LIMIT,
        }
    }
}

struct ManagedServer {
    record: RunningServerRecord,
    child: Option<Child>,
}

/// Owns the tool-server processes of one launch session.
pub struct Supervisor {
    options: SupervisorOptions,
    allocator: PortAllocator,
    registry: Registry,
    servers: Vec<ManagedServer>,
    claimed: BTreeSet<u16>,
}

impl Supervisor {
    pub fn new(registry: Registry, options: SupervisorOptions) -> Self {
        let allocator = PortAllocator::new(options.host).with_scan_limit(options.port_scan_limit);
        Self {
            options,
            allocator,
            registry,
            servers: Vec::new(),
            claimed: BTreeSet::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current records, in launch order.
    pub fn records(&self) -> Vec<RunningServerRecord> {
        self.servers.iter().map(|s| s.record.clone()).collect()
    }

    pub fn record(&self, name: &str) -> Option<&RunningServerRecord> {
        self.servers
            .iter()
            .find(|s| s.record.name == name)
            .map(|s| &s.record)
    }

    /// Launch every spec, then write the registry.
    ///
    /// A server that fails to start is reported as `failed` and does not
    /// affect the others. Only a registry write failure is an error.
    ///
    /// Dropping the future mid-launch kills the server being started; the
    /// ones launched before it stay in the table for [`Supervisor::stop_all`].
    pub async fn start_all(&mut self, specs: &[ToolServerSpec]) -> Result<Vec<RunningServerRecord>> {
        let mut launched = Vec::with_capacity(specs.len());
        for spec in specs {
            if self.stop(&spec.name).await.is_some() {
                debug!(server = %spec.name, "replaced previously launched server");
            }
            launched.push(self.launch(spec).await);
        }

        let written = self.registry.write(&self.records())?;
        let failed = launched
            .iter()
            .filter(|r| r.status == ServerStatus::Failed)
            .count();
        info!(
            registry = %self.registry.path().display(),
            running = written,
            failed,
            "launch complete"
        );

        Ok(launched)
    }

    async fn launch(&mut self, spec: &ToolServerSpec) -> RunningServerRecord {
        let mut record = RunningServerRecord::new(&spec.name, self.options.host);

        let port = match self.allocator.allocate(spec.default_port, &mut self.claimed) {
            Ok(port) => port,
            Err(e) => {
                warn!(server = %spec.name, error = %e, "no port for server");
                record.fail(&e);
                return self.track(record, None);
            }
        };
        record.assigned_port = Some(port);

        let child = match self.spawn(spec, port) {
            Ok(child) => child,
            Err(e) => {
                warn!(server = %spec.name, error = %e, "spawn failed");
                record.fail(&e);
                self.claimed.remove(&port);
                return self.track(record, None);
            }
        };
        record.pid = child.id();
        info!(server = %spec.name, port, pid = record.pid.unwrap_or_default(), "server spawned");

        // Tracked before waiting, so a cancelled launch still leaves the
        // child where stop_all can reap it.
        let slot = self.servers.len();
        self.track(record, Some(child));
        let options = &self.options;
        let server = &mut self.servers[slot];

        let ready = match server.child.as_mut() {
            Some(child) => wait_ready(options, spec, port, child).await,
            None => Err(Error::ServerExited {
                name: spec.name.clone(),
                status: "not running".to_string(),
            }),
        };
        match ready {
            Ok(()) => {
                server.record.status = ServerStatus::Running;
                info!(server = %spec.name, port, "server ready");
            }
            Err(e) => {
                warn!(server = %spec.name, port, error = %e, "server failed to start");
                server.record.fail(&e);
                if let Some(mut child) = server.child.take() {
                    if let Err(kill_err) = terminate(&mut child, options.grace_period).await {
                        warn!(server = %spec.name, error = %kill_err, "failed to reap server");
                    }
                }
                self.claimed.remove(&port);
            }
        }
        server.record.clone()
    }

    fn track(&mut self, record: RunningServerRecord, child: Option<Child>) -> RunningServerRecord {
        self.servers.push(ManagedServer {
            record: record.clone(),
            child,
        });
        record
    }

    fn spawn(&self, spec: &ToolServerSpec, port: u16) -> Result<Child> {
        let mut command = Command::new(&spec.entry.program);
        command
            .args(&spec.entry.args)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // Own process group: an operator Ctrl-C reaches only the supervisor,
        // which then stops the servers itself.
        #[cfg(unix)]
        command.process_group(0);

        command.spawn().map_err(|source| Error::Spawn {
            name: spec.name.clone(),
            source,
        })
    }

    /// Stop one server. Unknown or already stopped names are a no-op and
    /// return `None`; otherwise the final `stopped` record is returned and
    /// the server leaves the table.
    pub async fn stop(&mut self, name: &str) -> Option<RunningServerRecord> {
        let index = self.servers.iter().position(|s| s.record.name == name)?;
        let ManagedServer { mut record, child } = self.servers.remove(index);

        if let Some(mut child) = child {
            match terminate(&mut child, self.options.grace_period).await {
                Ok((Termination::Forced, status)) => {
                    warn!(server = %name, %status, "server killed after grace period")
                }
                Ok((how, status)) => debug!(server = %name, ?how, %status, "server exited"),
                Err(e) => warn!(server = %name, error = %e, "error while stopping server"),
            }
        }

        if let Some(port) = record.assigned_port {
            self.claimed.remove(&port);
        }
        record.status = ServerStatus::Stopped;
        info!(server = %name, "server stopped");
        Some(record)
    }

    /// Stop every server, most recently launched first.
    pub async fn stop_all(&mut self) -> Vec<RunningServerRecord> {
        let names: Vec<String> = self
            .servers
            .iter()
            .rev()
            .map(|s| s.record.name.clone())
            .collect();

        let mut stopped = Vec::with_capacity(names.len());
        for name in names {
            if let Some(record) = self.stop(&name).await {
                stopped.push(record);
            }
        }
        stopped
    }

    /// Mark running servers whose process has exited as failed.
    pub fn refresh_status(&mut self) -> Vec<RunningServerRecord> {
        for server in &mut self.servers {
            let Some(child) = server.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    warn!(server = %server.record.name, %status, "server exited");
                    server.record.status = ServerStatus::Failed;
                    server.record.error = Some(format!("exited: {status}"));
                    server.child = None;
                }
                Err(e) => debug!(server = %server.record.name, error = %e, "status check failed"),
            }
        }
        self.records()
    }
}

/// Poll until the server completes the handshake, exits, or times out.
///
/// A bare TCP connect is not enough: another process may have bound the
/// port between allocation and spawn, in which case our child is still
/// alive but the listener belongs to someone else.
async fn wait_ready(
    options: &SupervisorOptions,
    spec: &ToolServerSpec,
    port: u16,
    child: &mut Child,
) -> Result<()> {
    let name = spec.name.as_str();
    let addr = SocketAddr::new(options.host, port);
    let deadline = Instant::now() + options.ready_timeout;
    let mut delay = options.poll_interval;

    loop {
        if let Some(status) = child.try_wait()? {
            return Err(Error::ServerExited {
                name: name.to_string(),
                status: status.to_string(),
            });
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match handshake(name, addr, remaining.max(delay)).await {
            Ok(found) if found == spec.capability.as_str() => {
                if let Some(status) = child.try_wait()? {
                    return Err(Error::ServerExited {
                        name: name.to_string(),
                        status: status.to_string(),
                    });
                }
                return Ok(());
            }
            Ok(found) => {
                return Err(Error::ServerMismatch {
                    name: name.to_string(),
                    port,
                    expected: spec.capability.to_string(),
                    found,
                });
            }
            Err(e) => debug!(server = %name, port, error = %e, "not ready yet"),
        }

        if Instant::now() >= deadline {
            return Err(Error::ServerStartTimeout {
                name: name.to_string(),
                timeout: options.ready_timeout,
            });
        }

        sleep(delay).await;
        delay = (delay * 2).min(MAX_POLL_INTERVAL);
    }
}

/// Connect, initialize, and return the name the server reports.
async fn handshake(name: &str, addr: SocketAddr, wait: Duration) -> Result<String> {
    let channel = Channel::connect(name, addr, wait).await?.with_timeout(wait);
    channel.initialize().await?;
    let info = channel
        .server_info()
        .await
        .ok_or(mcp::Error::NotInitialized)?;
    Ok(info.server_info.name)
}
