use std::io::{self, IsTerminal};
use std::process::ExitCode;

use burrow::error::{EXIT_CONFIG, EXIT_OK};
use burrow::{Cli, LogSettings, Logging, Server, ServerConfig, ServerError, exit_code};
use burrow_sandbox::PlatformSandbox;
use clap::Parser;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(if err.use_stderr() { EXIT_CONFIG } else { EXIT_OK });
        }
    };

    let config = ServerConfig::from_cli(&cli);
    let settings = LogSettings {
        ansi: color_enabled(),
        ..match &config {
            Ok(config) => config.log_settings(),
            Err(_) => cli.log_settings(),
        }
    };

    let logging = Logging::new(&settings, io::stdout);
    if let Err(err) = logging.install_global() {
        eprintln!("{err}");
    }

    let config = match config {
        Ok(config) => config,
        Err(err) => {
            let err = ServerError::from(err);
            logging.emit(|| error!(error = %err, "{}", err.summary()));
            return ExitCode::from(err.exit_code());
        }
    };

    let server = Server::new(config, logging.clone());
    let result = server
        .run(PlatformSandbox::default(), burrow::shutdown_signal())
        .await;

    if let Err(err) = &result {
        logging.emit(|| error!(error = %err, "{}", err.summary()));
    }
    ExitCode::from(exit_code(&result))
}

fn color_enabled() -> bool {
    std::env::var_os("NO_COLOR").is_none() && io::stdout().is_terminal()
}
