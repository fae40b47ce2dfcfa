//! cmuxd
//!
//! Headless terminal-session daemon.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use cmuxd::config::Config;
use cmuxd::orchestrator::{DaemonOrchestrator, Transports};
use tracing_subscriber::EnvFilter;

/// cmuxd - host terminal sessions and share them over stdio, a Unix socket,
/// or WebSocket.
#[derive(Parser, Debug)]
#[command(name = "cmuxd")]
#[command(version, about, long_about = None)]
#[command(group(
    ArgGroup::new("transport")
        .required(true)
        .multiple(true)
        .args(["stdio", "ws", "unix"])
))]
pub struct Cli {
    /// Serve a single client on standard input/output
    #[arg(long, conflicts_with_all = ["ws", "unix"])]
    pub stdio: bool,

    /// Listen for WebSocket clients on HOST:PORT
    #[arg(long, value_name = "HOST:PORT", value_parser = parse_socket_addr)]
    pub ws: Option<SocketAddr>,

    /// Listen on a Unix domain socket at PATH
    #[arg(long, value_name = "PATH")]
    pub unix: Option<PathBuf>,

    /// Columns for new sessions
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub cols: Option<u16>,

    /// Rows for new sessions
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub rows: Option<u16>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    fn transports(&self) -> Transports {
        Transports {
            stdio: self.stdio,
            ws: self.ws,
            unix: self.unix.clone(),
        }
    }
}

/// Resolves `HOST:PORT`, taking the first address the resolver returns.
fn parse_socket_addr(value: &str) -> Result<SocketAddr, String> {
    value
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {:?}: {}", value, e))?
        .next()
        .ok_or_else(|| format!("{:?} did not resolve to any address", value))
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    if let Some(cols) = cli.cols {
        config.session.cols = cols;
    }
    if let Some(rows) = cli.rows {
        config.session.rows = rows;
    }

    config.validate()?;
    Ok(config)
}

/// Logs go to stderr; stdout carries the protocol in `--stdio` mode.
fn init_tracing(verbose: bool, config_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { config_level };
        EnvFilter::new(level)
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal(
    mut sigterm: tokio::signal::unix::Signal,
    mut sigint: tokio::signal::unix::Signal,
) {
    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let config = load_config(&cli)?;
    init_tracing(cli.verbose, &config.daemon.log_level);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "cmuxd starting");
    if let Some(path) = &cli.config {
        tracing::info!("Using config file: {:?}", path);
    }

    let sigterm = signal(SignalKind::terminate())?;
    let sigint = signal(SignalKind::interrupt())?;

    let orchestrator = DaemonOrchestrator::new(config)?;
    orchestrator
        .run(cli.transports(), wait_for_shutdown_signal(sigterm, sigint))
        .await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("cmuxd: {:#}", e);
            1
        }
    };

    // The blocking stdin reader cannot be cancelled, so leave without
    // waiting for the runtime to drain it.
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_cli_verify() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_requires_a_transport() {
        let err = Cli::try_parse_from(["cmuxd"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_stdio_conflicts_with_listeners() {
        let err = Cli::try_parse_from(["cmuxd", "--stdio", "--unix", "/tmp/x.sock"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);

        let err = Cli::try_parse_from(["cmuxd", "--stdio", "--ws", "127.0.0.1:0"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_ws_and_unix_together() {
        let cli = Cli::try_parse_from([
            "cmuxd",
            "--ws",
            "127.0.0.1:7777",
            "--unix",
            "/tmp/cmuxd.sock",
            "--cols",
            "120",
            "--rows",
            "40",
        ])
        .unwrap();

        let transports = cli.transports();
        assert!(!transports.stdio);
        assert_eq!(transports.ws, Some("127.0.0.1:7777".parse().unwrap()));
        assert_eq!(transports.unix, Some(PathBuf::from("/tmp/cmuxd.sock")));
        assert_eq!(cli.cols, Some(120));
        assert_eq!(cli.rows, Some(40));
    }

    #[test]
    fn test_invalid_ws_address_is_usage_error() {
        let err = Cli::try_parse_from(["cmuxd", "--ws", "not an address"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn test_zero_geometry_rejected() {
        let err = Cli::try_parse_from(["cmuxd", "--stdio", "--cols", "0"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }
}
