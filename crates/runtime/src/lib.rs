//! Toolhub runtime: tool-server process management and client-side tool access.
//!
//! # Overview
//!
//! - **PortAllocator**: finds a free TCP port near a preferred one.
//! - **Supervisor**: launches tool servers, waits until they accept
//!   connections, records them in the registry, and stops them.
//! - **Registry**: the plain-text file that tells clients where servers are.
//! - **RegistryToolHost**: connects to every registered server and routes
//!   tool calls by tool name.
//!
//! # Example
//!
//! ```no_run
//! use runtime::{Registry, Supervisor, SupervisorOptions, ToolServerSpec};
//!
//! # async fn example() -> runtime::Result<()> {
//! let registry = Registry::new("server_config.txt");
//! let mut supervisor = Supervisor::new(registry, SupervisorOptions::default());
//!
//! let specs = ToolServerSpec::builtin("toolhub", &[]);
//! for record in supervisor.start_all(&specs).await? {
//!     println!("{} {} {:?}", record.name, record.status, record.assigned_port);
//! }
//!
//! supervisor.stop_all().await;
//! # Ok(())
//! # }
//! ```

mod error;
pub mod ports;
pub mod registry;
mod shutdown;
pub mod spec;
mod supervisor;
pub mod tools;

pub use error::{Error, Result};
pub use ports::PortAllocator;
pub use registry::{DEFAULT_REGISTRY_FILE, Endpoint, Registry, Transport};
pub use shutdown::{Termination, terminate};
pub use spec::{Capability, EntryPoint, ToolServerSpec};
pub use supervisor::{RunningServerRecord, ServerStatus, Supervisor, SupervisorOptions};
pub use tools::{ConnectOptions, RegistryToolHost, ToolCall, ToolError, ToolHost, ToolSpec, Unreachable};
