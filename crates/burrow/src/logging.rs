//! Logging context.
//!
//! A [`Logging`] value owns the `tracing` dispatcher the server writes to. It is
//! built once in `main`, installed as the process-wide default with
//! [`Logging::install_global`], and handed explicitly to the server and the
//! request middleware, which emit through it rather than through whatever
//! dispatcher happens to be ambient. Contexts that are never installed (tests)
//! release their sink when the last clone is dropped.

use std::fmt;

use chrono::{Local, SecondsFormat};
use thiserror::Error;
use tracing::Dispatch;
use tracing::dispatcher::SetGlobalDefaultError;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("global logger already installed: {0}")]
    AlreadyInstalled(#[from] SetGlobalDefaultError),
}

/// Output options. Verbosity changes level and time precision only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogSettings {
    pub verbose: bool,
    pub json: bool,
    pub ansi: bool,
}

impl LogSettings {
    pub fn default_directives(&self) -> String {
        let level = if self.verbose { "debug" } else { "info" };
        format!("burrow={level},burrow_sandbox={level},tower_http={level}")
    }
}

/// RFC 3339 timestamps; nanosecond precision when verbose.
#[derive(Debug, Clone, Copy)]
struct Rfc3339 {
    precise: bool,
}

impl FormatTime for Rfc3339 {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let format = if self.precise {
            SecondsFormat::Nanos
        } else {
            SecondsFormat::Secs
        };
        write!(w, "{}", Local::now().to_rfc3339_opts(format, true))
    }
}

#[derive(Clone)]
pub struct Logging {
    dispatch: Dispatch,
}

impl fmt::Debug for Logging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logging").finish_non_exhaustive()
    }
}

impl Logging {
    /// Build a context writing to `writer`. `RUST_LOG` overrides the default
    /// filter.
    pub fn new<W>(settings: &LogSettings, writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(settings.default_directives()));
        Self::with_filter(settings, filter, writer)
    }

    pub fn with_filter<W>(settings: &LogSettings, filter: EnvFilter, writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let verbose = settings.verbose;
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_timer(Rfc3339 { precise: verbose })
            .with_ansi(settings.ansi)
            .with_target(verbose)
            .with_file(verbose)
            .with_line_number(verbose);

        let dispatch = if settings.json {
            Dispatch::new(Registry::default().with(filter).with(layer.json()))
        } else {
            Dispatch::new(Registry::default().with(filter).with(layer))
        };

        Self { dispatch }
    }

    /// Make this context the process-wide default. May succeed once per
    /// process.
    pub fn install_global(&self) -> Result<(), LoggingError> {
        tracing::dispatcher::set_global_default(self.dispatch.clone())?;
        Ok(())
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Run `f` with this context as the current dispatcher.
    pub fn emit<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}
