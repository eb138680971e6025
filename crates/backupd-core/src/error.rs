use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupdError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BackupdError {
    /// Short, stable error code for log fields and CLI exit messages.
    pub fn code(&self) -> &'static str {
        match self {
            BackupdError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupdError>;
