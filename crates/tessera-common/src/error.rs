//! Error types for Tessera

use thiserror::Error;

/// Tessera error type
///
/// Only stack assembly and configuration loading produce these at the API
/// surface. The packet path counts and drops instead of returning errors.
#[derive(Error, Debug)]
pub enum DpiError {
    /// Missing or inconsistent wiring detected while assembling a stack
    #[error("stack assembly error: {0}")]
    Assembly(String),

    /// The flow cache has no free record for a new connection
    #[error("flow cache exhausted")]
    FlowCacheExhausted,

    /// Invalid configuration value
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for Tessera
pub type DpiResult<T> = Result<T, DpiError>;
