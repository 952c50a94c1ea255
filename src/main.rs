//! figma-relay-mcp: MCP server that drives the Figma plugin over a WebSocket
//!
//! `serve` reclaims both ports, starts the peer listener and the MCP
//! front-end, and runs until interrupted. `kill-all` terminates whatever
//! holds either port and exits.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use figma_relay_mcp::config::{self, Config};
use figma_relay_mcp::ServerLifecycleManager;

/// MCP server that relays tool calls to the Figma plugin.
///
/// The Figma plugin connects to the peer WebSocket port; MCP clients connect
/// to `http://<host>:<mcp port>/sse`.
#[derive(Parser, Debug)]
#[command(name = "figma-relay-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "CONFIG_FILE", global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Start both servers and run until interrupted (default)
    Serve {
        /// Override the peer WebSocket port
        #[arg(long)]
        peer_port: Option<u16>,

        /// Override the MCP port
        #[arg(long)]
        mcp_port: Option<u16>,
    },
    /// Terminate every process holding the peer or MCP port
    KillAll,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN, // Default to warn for unknown levels
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Waits for SIGINT or SIGTERM.
#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
    }
    Ok(())
}

/// Waits for Ctrl+C.
#[cfg(windows)]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, initiating graceful shutdown");
    Ok(())
}

async fn serve(manager: &ServerLifecycleManager) -> ExitCode {
    if let Err(e) = manager.start_all().await {
        error!(error = %e, "Failed to start servers");
        return ExitCode::FAILURE;
    }

    let cfg = manager.config();
    info!(
        peer = %format!("ws://{}:{}", cfg.peer.host, cfg.peer.port),
        mcp = %format!("http://{}:{}/sse", cfg.mcp.host, cfg.mcp.port),
        "Ready, waiting for the Figma plugin and MCP clients"
    );

    let result = wait_for_signal().await;
    manager.stop_all().await;

    match result {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Failed to install signal handlers");
            ExitCode::FAILURE
        }
    }
}

fn apply_overrides(cfg: &mut Config, command: Command) {
    if let Command::Serve {
        peer_port,
        mcp_port,
    } = command
    {
        if let Some(port) = peer_port {
            cfg.peer.port = port;
        }
        if let Some(port) = mcp_port {
            cfg.mcp.port = port;
        }
    }
}

/// Entry point for the figma-relay-mcp server.
fn main() -> ExitCode {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Serve {
        peer_port: None,
        mcp_port: None,
    });

    // Load configuration
    let config_path = args.config.as_deref();
    let mut cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    apply_overrides(&mut cfg, command);
    if let Err(e) = cfg.validate() {
        eprintln!("Configuration error: {e}");
        return ExitCode::FAILURE;
    }

    // Initialise logging
    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting figma-relay-mcp"
    );

    let manager = match ServerLifecycleManager::from_config(cfg) {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "Failed to build tool catalogue");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        match command {
            Command::Serve { .. } => serve(&manager).await,
            Command::KillAll => {
                manager.kill_all().await;
                ExitCode::SUCCESS
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn log_level_from_flags() {
        assert_eq!(get_log_level(0, true, "trace"), Level::ERROR);
        assert_eq!(get_log_level(0, false, "debug"), Level::DEBUG);
        assert_eq!(get_log_level(0, false, "loud"), Level::WARN);
        assert_eq!(get_log_level(2, false, "error"), Level::DEBUG);
    }

    #[test]
    fn serve_overrides_ports() {
        let args = Args::try_parse_from(["figma-relay-mcp", "serve", "--peer-port", "4055"]).unwrap();
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, args.command.unwrap());
        assert_eq!(cfg.peer.port, 4055);
        assert_eq!(cfg.mcp.port, 3056);
    }

    #[test]
    fn kill_all_parses() {
        let args = Args::try_parse_from(["figma-relay-mcp", "-v", "kill-all"]).unwrap();
        assert_eq!(args.command, Some(Command::KillAll));
        assert_eq!(args.verbose, 1);
    }
}
