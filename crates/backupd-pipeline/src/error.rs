use thiserror::Error;

/// Errors from matching, archiving and shipping one backup run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid glob pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Invalid archive name: {0}")]
    InvalidName(String),

    #[error("Invalid sink configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token request failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("Upload failed ({status}): {message}")]
    Upload { status: u16, message: String },

    /// The invocation's scope was revoked at a checkpoint.
    #[error("Backup cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
