pub mod app;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod errors;
pub mod migrate;
pub mod models;
pub mod redaction;
pub mod templates;
pub mod version;

use crate::bootstrap::Bootstrap;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::migrate::TerminalChannel;
use crate::templates::context::SafeContext;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version)]
#[command(about = "Bootstraps a themed site: connects, migrates, and wires the template sandbox")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap the application and report readiness (default)
    Boot,

    /// Bootstrap, then render a template with an empty context to stdout
    Render {
        /// Template reference, e.g. `index.html` or `admin/users/list`
        reference: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "startup failed");
            eprintln!("{}", error);
            ExitCode::from(error.exit_code())
        }
    }
}

fn execute(cli: Cli) -> AppResult<()> {
    let config = AppConfig::from_env()?;
    init_tracing(config.log_dir.as_deref())?;

    let mut channel = TerminalChannel;
    let app = Bootstrap::new(config).run(&mut channel)?;

    match cli.command.unwrap_or(Commands::Boot) {
        Commands::Boot => {
            println!(
                "stagehand {} ready (theme: {})",
                app.version(),
                app.active_theme()?
            );
        }
        Commands::Render { reference } => {
            println!("{}", app.render(&reference, SafeContext::new())?);
        }
    }
    Ok(())
}

/// JSON to a daily rolling file when `log_dir` is set, human-readable stderr
/// otherwise. Only the first call installs a subscriber.
pub fn init_tracing(log_dir: Option<&Path>) -> AppResult<()> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    let installed = match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "stagehand.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);

            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .json()
                .with_writer(non_blocking)
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .try_init(),
    };
    installed.map_err(|error| AppError::Internal(format!("tracing init failed: {}", error)))
}
