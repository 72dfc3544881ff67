//! Sandboxed static file server.
//!
//! This crate provides the server lifecycle, request instrumentation and
//! configuration for the `burrow` binary. File serving itself is delegated to
//! `tower_http::services::ServeDir`; sandboxing lives in `burrow-sandbox`.

pub mod capture;
pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod request_id;
pub mod routes;
pub mod server;

pub use config::{Cli, ServerConfig};
pub use error::{ConfigError, ServerError, exit_code};
pub use logging::{LogSettings, Logging};
pub use server::{Listener, Phase, Server, Shutdown, shutdown_signal};
