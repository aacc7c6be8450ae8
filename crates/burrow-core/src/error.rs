//! Error types for `Burrow` core library.

use thiserror::Error;

/// Result type alias using `Burrow` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Burrow` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file does not exist
    #[error(
        "config file not found at {path}\n\nPlease create a burrow.toml file with your machine definitions."
    )]
    ConfigNotFound { path: String },

    /// TOML deserialization error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
