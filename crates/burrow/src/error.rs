use std::io;
use std::path::PathBuf;

use burrow_sandbox::SandboxError;
use thiserror::Error;

use crate::server::Shutdown;

/// Process exit codes. Stable for scripting and monitoring.
pub const EXIT_OK: u8 = 0;
pub const EXIT_CONFIG: u8 = 1;
pub const EXIT_SANDBOX: u8 = 2;
pub const EXIT_SERVER: u8 = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    ParseFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid duration {value:?}: {source}")]
    Timeout {
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("failed to resolve directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("server failed: {0}")]
    Serve(#[source] io::Error),
}

impl ServerError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ServerError::Config(_) => EXIT_CONFIG,
            ServerError::Sandbox(_) => EXIT_SANDBOX,
            ServerError::Bind { .. } | ServerError::Serve(_) => EXIT_SERVER,
        }
    }

    /// Short description used as the log message of the fatal line.
    pub fn summary(&self) -> &'static str {
        match self {
            ServerError::Config(ConfigError::Directory { .. } | ConfigError::NotADirectory(_)) => {
                "invalid directory"
            }
            ServerError::Config(_) => "invalid configuration",
            ServerError::Sandbox(_) => "failed to setup security restrictions",
            ServerError::Bind { .. } | ServerError::Serve(_) => "server failed",
        }
    }
}

/// Exit code for the outcome of [`crate::Server::run`].
///
/// A stop after a termination signal is a success whether or not every
/// connection drained in time.
pub fn exit_code(result: &Result<Shutdown, ServerError>) -> u8 {
    match result {
        Ok(_) => EXIT_OK,
        Err(err) => err.exit_code(),
    }
}
