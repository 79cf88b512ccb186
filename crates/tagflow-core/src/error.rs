//! Error types shared across the pipeline.

use thiserror::Error;

/// Errors produced by the core crate.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required configuration value is missing.
    #[error("missing required configuration: {0}")]
    MissingRequired(&'static str),

    /// A broker payload could not be parsed.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A tag inventory message carried no tag id.
    #[error("tag inventory without tid")]
    MissingTid,

    /// The host-group mapping file could not be read.
    #[error("group file error: {0}")]
    GroupFile(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
