use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::logging::LogSettings;

pub const DEFAULT_ADDRESS: &str = ":8080";
pub const DEFAULT_DIRECTORY: &str = ".";
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser, Debug, Default)]
#[command(name = "burrow")]
#[command(about = "Serve a directory over HTTP inside a sandbox")]
#[command(version)]
pub struct Cli {
    /// Listen address (`:8080` listens on all interfaces)
    #[arg(short, long, env = "BURROW_ADDRESS")]
    pub address: Option<String>,

    /// Directory to serve files from
    #[arg(short, long, env = "BURROW_DIRECTORY")]
    pub directory: Option<PathBuf>,

    /// Graceful shutdown timeout, e.g. `5s` or `250ms`
    #[arg(short, long, env = "BURROW_TIMEOUT", value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Time a client gets to send its request headers
    #[arg(long, env = "BURROW_HEADER_TIMEOUT", value_parser = humantime::parse_duration)]
    pub header_timeout: Option<Duration>,

    /// Enable debug logging
    #[arg(short, long, env = "BURROW_VERBOSE")]
    pub verbose: bool,

    /// Emit JSON log lines
    #[arg(long, env = "BURROW_JSON")]
    pub json: bool,

    /// Config file path (optional)
    #[arg(short, long, env = "BURROW_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Logging settings derived from flags alone, for reporting errors that
    /// happen before the config file is loaded.
    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            verbose: self.verbose,
            json: self.json,
            ..LogSettings::default()
        }
    }
}

/// Optional TOML config file. Every key is optional; flags win.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub address: Option<String>,
    pub directory: Option<PathBuf>,
    /// Humantime duration string, e.g. `"10s"`
    pub timeout: Option<String>,
    pub header_timeout: Option<String>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub json: bool,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })
    }

    fn timeout(&self) -> Result<Option<Duration>, ConfigError> {
        parse_duration(self.timeout.as_deref())
    }

    fn header_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        parse_duration(self.header_timeout.as_deref())
    }
}

fn parse_duration(value: Option<&str>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|value| {
            humantime::parse_duration(value).map_err(|source| ConfigError::Timeout {
                value: value.to_string(),
                source,
            })
        })
        .transpose()
}

/// Validated server configuration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address as given by the user
    pub address: String,
    /// Absolute path of the served directory
    pub directory: PathBuf,
    pub shutdown_timeout: Duration,
    /// Deadline for reading a request's headers
    pub header_timeout: Duration,
    pub verbose: bool,
    pub json: bool,
}

impl ServerConfig {
    pub fn new(
        address: impl Into<String>,
        directory: &Path,
        shutdown_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            address: address.into(),
            directory: check_directory(directory)?,
            shutdown_timeout,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            verbose: false,
            json: false,
        })
    }

    /// Merge flags, the optional config file and defaults, then validate the
    /// served directory.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };

        let address = cli
            .address
            .clone()
            .or_else(|| file.address.clone())
            .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
        let directory = cli
            .directory
            .clone()
            .or_else(|| file.directory.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DIRECTORY));
        let shutdown_timeout = match cli.timeout {
            Some(timeout) => timeout,
            None => file.timeout()?.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
        };

        let header_timeout = match cli.header_timeout {
            Some(timeout) => timeout,
            None => file.header_timeout()?.unwrap_or(DEFAULT_HEADER_TIMEOUT),
        };

        let mut config = Self::new(address, &directory, shutdown_timeout)?;
        config.header_timeout = header_timeout;
        config.verbose = cli.verbose || file.verbose;
        config.json = cli.json || file.json;
        Ok(config)
    }

    /// Address in a form `TcpListener::bind` accepts. `:port` binds every
    /// IPv4 interface.
    pub fn listen_address(&self) -> String {
        match self.address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.address.clone(),
        }
    }

    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            verbose: self.verbose,
            json: self.json,
            ..LogSettings::default()
        }
    }
}

/// Resolve `dir` to an absolute path and make sure it is a directory.
pub fn check_directory(dir: &Path) -> Result<PathBuf, ConfigError> {
    let abs_dir = dir.canonicalize().map_err(|source| ConfigError::Directory {
        path: dir.to_path_buf(),
        source,
    })?;

    if !abs_dir.is_dir() {
        return Err(ConfigError::NotADirectory(abs_dir));
    }

    Ok(abs_dir)
}
