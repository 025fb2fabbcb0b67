//! Error taxonomy shared by the agent components

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Startup configuration errors, always fatal
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read configuration from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Command gateway errors, one per request
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command '{command}' is not allowed")]
    NotAllowed {
        command: String,
        allowed: Vec<&'static str>,
    },

    #[error("argument '{argument}' is not permitted for '{command}'")]
    ArgumentNotAllowed { command: String, argument: String },

    #[error("command '{0}' not found on system")]
    NotFound(String),

    #[error("command '{command}' timed out after {}s", timeout.as_secs_f64())]
    TimedOut { command: String, timeout: Duration },

    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Update cycle errors
///
/// Check, download and verify failures happen before any file is touched.
/// A write failure means a rollback ran.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("an update is already in progress")]
    InProgress,

    #[error("version check failed: {0}")]
    CheckFailed(String),

    #[error("download of version {version} failed: {message}")]
    DownloadFailed { version: String, message: String },

    #[error("verification of version {version} failed: {message}")]
    VerifyFailed { version: String, message: String },

    #[error("installing version {version} failed and was rolled back: {message}")]
    WriteFailed { version: String, message: String },
}
