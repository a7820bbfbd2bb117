use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("no available port in {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("failed to spawn server {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    #[error("server {name} not ready after {timeout:?}")]
    ServerStartTimeout { name: String, timeout: Duration },

    #[error("server {name} exited during startup: {status}")]
    ServerExited { name: String, status: String },

    #[error("server {name}: port {port} answered as {found}, expected {expected}")]
    ServerMismatch {
        name: String,
        port: u16,
        expected: String,
        found: String,
    },

    #[error("registry not found at {path}. Start the servers first")]
    RegistryMissing { path: PathBuf },

    #[error("failed to write registry {path}: {source}")]
    RegistryWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Mcp(#[from] mcp::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
