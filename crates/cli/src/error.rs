//! CLI error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

/// CLI errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Every launch failed; nothing to keep running.
    #[error("no tool server started")]
    NoServersStarted,

    /// The registry exists but none of its entries answered.
    #[error("no tool server listed in {path} is reachable. Start the servers first")]
    NoReachableServers { path: PathBuf },

    /// The client child process ended abnormally.
    #[error("client exited with {status}")]
    ClientFailed { status: String },

    #[error(transparent)]
    Runtime(#[from] runtime::Error),

    #[error(transparent)]
    Mcp(#[from] mcp::Error),

    #[error(transparent)]
    Capability(#[from] capabilities::CapabilityError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
