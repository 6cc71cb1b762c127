//! stationlink CLI - local IPC backbone between a station process and its
//! device-facing subprocesses.
//!
//! This is the main binary entry point. See the `stationlink` library for
//! the core functionality.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use stationlink::bridge::BridgeConnector;
use stationlink::config::Config;
use stationlink::socket::addr::SocketAddress;
use stationlink::socket::endpoint::IpcEndpoint;
use stationlink::socket::inbound::handler_fn;
use stationlink::socket::registry::EndpointRegistry;
use stationlink::supervisor::command_forwarder::CommandForwarder;
use stationlink::supervisor::device::{JsonCommandCompiler, JsonStateExtractor};
use stationlink::supervisor::state_forwarder::StateForwarder;
use stationlink::supervisor::{ExitStatus, Subprocess, Supervisor};
use stationlink::ws::WsConnector;

/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "stationlink")]
#[command(version)]
#[command(about = "Local IPC backbone for station subprocesses")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Own one socket per stream and log what the subprocesses send
    Serve {
        /// Stream names to bind
        #[arg(long = "stream", required = true)]
        streams: Vec<String>,
        /// Send close-request to every subprocess before exiting
        #[arg(long)]
        close_on_exit: bool,
    },
    /// Forward device state to the owning process
    State {
        /// Device state WebSocket URL
        #[arg(long)]
        ws_url: String,
        /// Stream name to connect to
        #[arg(long, default_value = "state")]
        stream: String,
        /// Owning process id (defaults to STATIONLINK_PARENT_PID, then the parent)
        #[arg(long)]
        owner_pid: Option<u32>,
    },
    /// Forward commands from the owning process to the device
    Command {
        /// Device command WebSocket URL
        #[arg(long)]
        ws_url: String,
        /// Stream name to connect to
        #[arg(long, default_value = "command")]
        stream: String,
        /// Owning process id (defaults to STATIONLINK_PARENT_PID, then the parent)
        #[arg(long)]
        owner_pid: Option<u32>,
    },
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Ok(path) = std::env::var("STATIONLINK_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    let config = Config::load()?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    let status = runtime.block_on(async {
        match cli.command {
            Commands::Serve {
                streams,
                close_on_exit,
            } => serve(&config, &streams, close_on_exit).await,
            Commands::State {
                ws_url,
                stream,
                owner_pid,
            } => {
                let connector: Arc<dyn BridgeConnector> =
                    Arc::new(WsConnector::new(&ws_url).with_device_origin());
                let forwarder = StateForwarder::new(
                    connector,
                    Arc::new(JsonStateExtractor),
                    config.bridge_settings(),
                    config.state_rate_hz,
                );
                supervise(&config, &stream, owner_pid, forwarder).await
            }
            Commands::Command {
                ws_url,
                stream,
                owner_pid,
            } => {
                let connector: Arc<dyn BridgeConnector> =
                    Arc::new(WsConnector::new(&ws_url).with_device_origin());
                let forwarder = CommandForwarder::new(
                    connector,
                    Arc::new(JsonCommandCompiler),
                    config.bridge_settings(),
                );
                supervise(&config, &stream, owner_pid, forwarder).await
            }
        }
    });

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            log::error!("{e:#}");
            ExitStatus::Error
        }
    };
    drop(runtime);
    std::process::exit(status.code());
}

fn socket_path(config: &Config, address: &SocketAddress) -> PathBuf {
    address.path_in(&config.socket_dir)
}

/// Main-process side: bind every stream and log traffic until Ctrl-C.
async fn serve(config: &Config, streams: &[String], close_on_exit: bool) -> Result<ExitStatus> {
    std::fs::create_dir_all(&config.socket_dir)
        .with_context(|| format!("Failed to create {}", config.socket_dir.display()))?;
    let settings = config.ipc_settings();
    let registry = EndpointRegistry::new();

    for stream in streams {
        let address = SocketAddress::own(stream)?;
        let path = socket_path(config, &address);
        let endpoint = IpcEndpoint::bind(stream, path.clone(), &settings)
            .await
            .with_context(|| format!("Failed to bind stream {stream}"))?;
        let name = stream.clone();
        endpoint.register_handler(handler_fn(move |envelope| {
            log::info!(
                "[Serve] {name} <- {} {}",
                envelope.msg_type,
                serde_json::Value::Object(envelope.payload.clone())
            );
            Ok(())
        }));
        endpoint.start_dispatch();
        registry.insert(endpoint)?;
        println!("{stream}\t{}", path.display());
    }
    log::info!(
        "[Serve] pid {} serving {}",
        std::process::id(),
        registry.streams().join(", ")
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("[Serve] Shutting down");

    if close_on_exit {
        for stream in registry.streams() {
            if let Some(endpoint) = registry.get(&stream) {
                if let Err(e) = endpoint.send_close_request().await {
                    log::warn!("[Serve] close-request to {stream} failed: {e}");
                }
            }
        }
    }
    registry.stop_all();
    Ok(ExitStatus::Clean)
}

/// Subprocess side: connect to the owner and run `subprocess` under a
/// supervisor.
async fn supervise<S: Subprocess>(
    config: &Config,
    stream: &str,
    owner_pid: Option<u32>,
    subprocess: S,
) -> Result<ExitStatus> {
    let address = match owner_pid {
        Some(pid) => SocketAddress::new(pid, stream)?,
        None => SocketAddress::parent(stream)?,
    };
    let path = socket_path(config, &address);
    let endpoint = match IpcEndpoint::connect(stream, path, &config.ipc_settings()).await {
        Ok(endpoint) => Arc::new(endpoint),
        Err(e) => {
            log::error!("[Supervisor] {stream}: {e}");
            return Ok(ExitStatus::Error);
        }
    };

    let supervisor = Supervisor::new(Arc::new(subprocess), endpoint);
    let control = supervisor.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("[Supervisor] Interrupted");
            control.begin_stop();
        }
    });

    Ok(supervisor.run().await)
}
