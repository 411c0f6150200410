//! waypointd: CLI entry point. Subcommands mirror the daemon lifecycle
//! (§4.10) — `start` runs the dispatcher/maintenance/API trio in the
//! foreground or as a background daemon; `stop`/`status` talk to a running
//! instance over the IPC socket.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::Notify;
use waypoint::api::ApiState;
use waypoint::config::Config;
use waypoint::conversation::ConversationTracker;
use waypoint::daemon::{DaemonPaths, IpcCommand, IpcResponse};
use waypoint::dispatcher::Dispatcher;
use waypoint::events::EventBus;
use waypoint::hooks::HookPipeline;
use waypoint::queue::QueueStore;

#[derive(Parser)]
#[command(name = "waypoint", version)]
#[command(about = "Durable message queue and routing daemon for AI coding-assistant subprocesses")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the TOML config file (defaults to the instance directory).
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand is given).
    Start {
        /// Run in the foreground instead of daemonizing.
        #[arg(short, long)]
        foreground: bool,
    },
    /// Stop the running daemon.
    Stop,
    /// Restart the daemon (stop + start).
    Restart {
        #[arg(short, long)]
        foreground: bool,
    },
    /// Show status of the running daemon.
    Status,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Start { foreground: false });

    match command {
        Command::Start { foreground } => cmd_start(cli.config, cli.debug, foreground),
        Command::Stop => cmd_stop(),
        Command::Restart { foreground } => {
            cmd_stop_if_running();
            cmd_start(cli.config, cli.debug, foreground)
        }
        Command::Status => cmd_status(),
    }
}

fn load_config(path: &Option<std::path::PathBuf>) -> anyhow::Result<Config> {
    let path = path
        .clone()
        .unwrap_or_else(|| Config::default_instance_dir().join("config.toml"));
    Config::load_from_path(&path).with_context(|| format!("failed to load config from {}", path.display()))
}

fn cmd_start(config_path: Option<std::path::PathBuf>, debug: bool, foreground: bool) -> anyhow::Result<()> {
    let paths = DaemonPaths::from_default();

    if let Some(pid) = waypoint::daemon::is_running(&paths) {
        eprintln!("waypoint is already running (pid {pid})");
        std::process::exit(1);
    }

    let config = load_config(&config_path)?;

    if !foreground {
        let paths = DaemonPaths::new(&config.data_dir);
        waypoint::daemon::daemonize(&paths)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build Tokio runtime")?;

    runtime.block_on(async {
        let _otel_provider = if foreground {
            waypoint::daemon::init_foreground_tracing(debug, &config.telemetry)
        } else {
            let paths = DaemonPaths::new(&config.data_dir);
            waypoint::daemon::init_background_tracing(&paths, debug, &config.telemetry)
        };

        run(config, foreground).await
    })
}

#[tokio::main]
async fn cmd_stop() -> anyhow::Result<()> {
    let paths = DaemonPaths::from_default();

    let Some(pid) = waypoint::daemon::is_running(&paths) else {
        eprintln!("waypoint is not running");
        std::process::exit(1);
    };

    match waypoint::daemon::send_command(&paths, IpcCommand::Shutdown).await {
        Ok(IpcResponse::Ok) => eprintln!("stopping waypoint (pid {pid})..."),
        Ok(IpcResponse::Error { message }) => {
            eprintln!("shutdown failed: {message}");
            std::process::exit(1);
        }
        Ok(_) => {
            eprintln!("unexpected response from daemon");
            std::process::exit(1);
        }
        Err(error) => {
            eprintln!("failed to send shutdown command: {error}");
            std::process::exit(1);
        }
    }

    if waypoint::daemon::wait_for_exit(pid) {
        eprintln!("waypoint stopped");
    } else {
        eprintln!("waypoint did not stop within 10 seconds (pid {pid})");
        std::process::exit(1);
    }

    Ok(())
}

/// Stop if running, don't error if not — used by `restart`.
fn cmd_stop_if_running() {
    let paths = DaemonPaths::from_default();

    let Some(pid) = waypoint::daemon::is_running(&paths) else {
        return;
    };

    let Ok(runtime) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
        return;
    };

    runtime.block_on(async {
        if let Ok(IpcResponse::Ok) = waypoint::daemon::send_command(&paths, IpcCommand::Shutdown).await {
            eprintln!("stopping waypoint (pid {pid})...");
            waypoint::daemon::wait_for_exit(pid);
        }
    });
}

fn cmd_status() -> anyhow::Result<()> {
    let paths = DaemonPaths::from_default();

    let Some(_pid) = waypoint::daemon::is_running(&paths) else {
        eprintln!("waypoint is not running");
        std::process::exit(1);
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        match waypoint::daemon::send_command(&paths, IpcCommand::Status).await {
            Ok(IpcResponse::Status { pid, uptime_seconds }) => {
                let hours = uptime_seconds / 3600;
                let minutes = (uptime_seconds % 3600) / 60;
                let seconds = uptime_seconds % 60;
                eprintln!("waypoint is running");
                eprintln!("  pid:    {pid}");
                eprintln!("  uptime: {hours}h {minutes}m {seconds}s");
            }
            Ok(IpcResponse::Error { message }) => {
                eprintln!("status query failed: {message}");
                std::process::exit(1);
            }
            Ok(_) => {
                eprintln!("unexpected response from daemon");
                std::process::exit(1);
            }
            Err(error) => {
                eprintln!("failed to query daemon status: {error}");
                std::process::exit(1);
            }
        }
    });

    Ok(())
}

/// Wire up the core subsystems (§2 initialization order: queue store, stale
/// recovery, event bus, hooks, dispatcher, maintenance loop) and run until
/// shutdown is requested over the IPC socket.
async fn run(config: Config, foreground: bool) -> anyhow::Result<()> {
    let paths = DaemonPaths::new(&config.data_dir);

    tracing::info!("starting waypoint");
    tracing::info!(
        workspace = %config.workspace_path.display(),
        agents = config.registry.agents.len(),
        teams = config.registry.teams.len(),
        "configuration loaded"
    );

    let (mut shutdown_rx, _ipc_handle) = waypoint::daemon::start_ipc_server(&paths)
        .await
        .context("failed to start IPC server")?;

    let events = EventBus::new();

    let store = Arc::new(
        QueueStore::open(&config.sqlite_path(), events.clone())
            .await
            .context("failed to open queue store")?,
    );

    let recovered = store
        .recover_stale(config.retry.stale_claim_threshold_secs)
        .await
        .context("failed to recover stale claims at startup")?;
    if recovered > 0 {
        tracing::info!(recovered, "recovered stale claims from a previous run");
    }

    let registry = Arc::new(config.registry.clone());
    let conversations = ConversationTracker::new(
        config.retry.conversation_max_messages,
        config.retry.conversation_ttl_secs,
    );

    // No hooks are configured from the TOML surface yet (§4.6 transforms are
    // supplied by the embedding application); both pipelines start empty.
    let incoming_hooks = HookPipeline::empty();
    let outgoing_hooks = HookPipeline::empty();

    let wake = Arc::new(Notify::new());

    let dispatcher = Dispatcher::new(
        store.clone(),
        registry,
        conversations.clone(),
        incoming_hooks,
        outgoing_hooks,
        events,
        config.retry,
        wake.clone(),
    );

    let dispatcher_handle = tokio::spawn(dispatcher.run());
    let maintenance_handle = tokio::spawn(waypoint::maintenance::run(
        store.clone(),
        conversations.clone(),
        config.retry,
        wake,
    ));

    let http_handle = if config.api.enabled {
        let api_state = Arc::new(ApiState {
            store: store.clone(),
            conversations: conversations.clone(),
        });
        Some(
            waypoint::api::serve(config.api.bind, api_state, shutdown_rx.clone())
                .await
                .context("failed to start HTTP API")?,
        )
    } else {
        None
    };

    #[cfg(feature = "metrics")]
    let metrics_handle = if config.metrics.enabled {
        Some(
            waypoint::telemetry::start_metrics_server(config.metrics.bind, shutdown_rx.clone())
                .await
                .context("failed to start metrics server")?,
        )
    } else {
        None
    };

    if foreground {
        eprintln!("waypoint running in foreground (pid {})", std::process::id());
    } else {
        tracing::info!(pid = std::process::id(), "waypoint daemon started");
    }

    let _ = shutdown_rx.wait_for(|shutdown| *shutdown).await;
    tracing::info!("shutdown requested, stopping");

    dispatcher_handle.abort();
    maintenance_handle.abort();
    if let Some(handle) = http_handle {
        let _ = handle.await;
    }
    #[cfg(feature = "metrics")]
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    waypoint::daemon::cleanup(&paths);

    Ok(())
}
