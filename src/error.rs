//! Error types for Deckhand

use thiserror::Error;

/// Result type for Deckhand operations
pub type Result<T> = std::result::Result<T, DeckhandError>;

/// Deckhand error types
#[derive(Error, Debug)]
pub enum DeckhandError {
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerExists(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Compose file parse error: {0}")]
    ComposeParse(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<reqwest::Error> for DeckhandError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            DeckhandError::RuntimeUnavailable(err.to_string())
        } else {
            DeckhandError::Runtime(err.to_string())
        }
    }
}
