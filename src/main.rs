use clap::{Parser, Subcommand};
use deploy_agent::config::LogFormat;
use deploy_agent::{check_health, controller_from_config, AgentConfig, AgentError};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "deploy-agent",
    version,
    about = "Reconcile managed hosts against their inventory by running playbooks"
)]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Reconcile on the configured interval until stopped (default)
    Run,
    /// Run a single reconciliation cycle and exit
    Once,
    /// Exit 0 if the last successful cycle is recent enough, 1 otherwise
    Healthcheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    if command == Command::Healthcheck {
        return healthcheck(&cli.config);
    }

    let config = match AgentConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("deploy-agent: {e}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("deploy-agent: {e}");
        return ExitCode::from(2);
    }

    match run(&config, command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "agent error");
            ExitCode::from(2)
        }
    }
}

fn healthcheck(config_path: &Path) -> ExitCode {
    let Ok(config) = AgentConfig::load(config_path) else {
        return ExitCode::from(1);
    };
    let status = check_health(&config.healthcheck_stat_file, config.healthcheck_threshold());
    ExitCode::from(status.exit_code())
}

fn init_logging(config: &AgentConfig) -> Result<(), AgentError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| AgentError::Other(format!("invalid log_level: {e}")))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

async fn run(config: &AgentConfig, command: Command) -> Result<ExitCode, AgentError> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        output_directory = %config.output_directory.display(),
        simulate = config.simulate,
        "deploy-agent starting"
    );
    let controller = controller_from_config(config)?;
    let cancel = CancellationToken::new();
    tokio::spawn(stop_on_signal(shutdown_signal(), cancel.clone()));

    if command == Command::Once {
        let outcome = controller.run_cycle(&cancel).await?;
        return Ok(if outcome.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        });
    }

    controller.run(config.collect_interval(), cancel).await;
    info!(version = env!("CARGO_PKG_VERSION"), "deploy-agent stopped");
    Ok(ExitCode::SUCCESS)
}

/// Cancel `cancel` once `signal` fires. If the signal cannot be listened
/// for, the agent keeps running and the error is logged.
async fn stop_on_signal<F>(signal: F, cancel: CancellationToken)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("shutdown requested, killing running playbooks and stopping");
            cancel.cancel();
        }
        Err(e) => warn!(error = %e, "cannot listen for shutdown signals"),
    }
}

/// Resolves on SIGINT or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => result,
                _ = term.recv() => Ok(()),
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler, listening for ctrl-c only");
            tokio::signal::ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
