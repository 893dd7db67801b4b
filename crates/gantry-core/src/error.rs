//! Error types for Gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("Invalid pipeline configuration: {0}")]
    Config(String),

    // Runtime connectivity
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    // Image errors
    #[error("Image pull failed for '{reference}': {message}")]
    ImagePull { reference: String, message: String },

    #[error("Image build failed: {0}")]
    ImageBuild(String),

    // Container errors
    #[error("Container operation failed: {0}")]
    Container(String),

    // Script errors
    #[error("Command execution failed with exit code {exit_code}")]
    Script { exit_code: i64, output: String },

    // Shutdown
    #[error("Execution cancelled by shutdown")]
    Cancelled,

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}
