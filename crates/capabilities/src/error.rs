use mcp::ToolFailure;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CapabilityError {
    /// The caller sent something the capability cannot work with.
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("HTTP error: {status}")]
    HttpStatus { status: u16 },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid presentation: {0}")]
    Presentation(String),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("translation failed: {0}")]
    Translation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<CapabilityError> for ToolFailure {
    fn from(error: CapabilityError) -> Self {
        match error {
            CapabilityError::InvalidInput(message) => ToolFailure::invalid_arguments(message),
            other => ToolFailure::capability(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CapabilityError>;
