use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Message descriptor already registered: {0}")]
    DuplicateDescriptor(String),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Invalid identifier '{identifier}': {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    #[error("Path escapes data directory: {0}")]
    PathEscapes(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<toml::de::Error> for SyncError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}
