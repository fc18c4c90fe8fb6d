//! Error types for the registry.

use crate::limit::AggregateError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Port {0} is already in use")]
    PortInUse(u16),

    #[error("Failed to read archive {}: {source}", .path.display())]
    ArchiveRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid package manifest in {}: {reason}", .path.display())]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("`{program}` exited with {}", exit_status(.code))]
    ProcessExit { program: String, code: Option<i32> },

    #[error("Failed to launch `{program}`: {source}")]
    ProcessLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Uplink request failed: {0}")]
    Uplink(#[from] reqwest::Error),

    #[error("Registry rejected publish of {package}: {status}")]
    PublishRejected { package: String, status: u16 },

    #[error("Publishing failed: {0}")]
    Publish(AggregateError<RegistryError>),
}

fn exit_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

impl RegistryError {
    /// The exit code the front-end should mirror for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RegistryError::ProcessExit {
                code: Some(code), ..
            } if *code != 0 => *code,
            _ => 1,
        }
    }
}
