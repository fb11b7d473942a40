use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cam_relay::config::ConfigStore;
use cam_relay::discovery::TcpProbe;
use cam_relay::janitor::{self, JanitorSettings};
use cam_relay::rtsp::RetinaDialer;
use cam_relay::state::AppState;
use cam_relay::utils::{bind_tcp_listener, outbound_ipv4};
use cam_relay::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// cam-relay command line arguments
#[derive(Parser, Debug)]
#[command(name = "cam-relay")]
#[command(version, about = "IP camera discovery and RTSP to WebRTC relay", long_about = None)]
struct CliArgs {
    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Configuration file
    #[arg(short = 'c', long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting cam-relay v{}", env!("CARGO_PKG_VERSION"));

    let config_store = Arc::new(ConfigStore::new(&args.config).await?);
    tracing::info!("Configuration: {}", config_store.path().display());
    let config = config_store.get();

    let bind_address = args
        .address
        .clone()
        .unwrap_or_else(|| config.server.bind_address.clone());
    let bind_ip: IpAddr = bind_address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", bind_address))?;
    let bind_port = args.port.unwrap_or(config.server.port);

    match outbound_ipv4() {
        Ok(ip) => tracing::info!("Local address: {}", ip),
        Err(e) => tracing::warn!("Could not determine local address: {}", e),
    }

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        config_store.clone(),
        Arc::new(TcpProbe),
        Arc::new(RetinaDialer::default()),
        shutdown.clone(),
    )?;

    // Background work
    let mut tasks = Vec::new();
    if let Some(handle) = state.discovery.start_background(shutdown.clone()) {
        tasks.push(handle);
    } else {
        tracing::info!("Auto discovery disabled");
    }
    tasks.extend(janitor::spawn(
        state.pool.clone(),
        state.sessions.clone(),
        JanitorSettings::from(&config.relay),
        shutdown.clone(),
    ));
    tasks.push(spawn_config_watcher(&config_store, shutdown.clone()));

    let app = web::create_router(state.clone());

    // Bind failure is fatal
    let listener = bind_tcp_listener(SocketAddr::new(bind_ip, bind_port))?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let server_shutdown = shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => tracing::info!("Shutdown signal received"),
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await;
    if let Err(e) = &result {
        tracing::error!("HTTP server error: {}", e);
    }

    cleanup(&state, tasks).await;
    tracing::info!("Server shutdown complete");
    result.map_err(Into::into)
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "cam_relay=error,tower_http=error,webrtc=error,retina=error",
        LogLevel::Warn => "cam_relay=warn,tower_http=warn,webrtc=warn,retina=warn",
        LogLevel::Info => "cam_relay=info,tower_http=info,webrtc=warn,retina=warn",
        LogLevel::Verbose => "cam_relay=debug,tower_http=info,webrtc=warn,retina=info",
        LogLevel::Debug => "cam_relay=debug,tower_http=debug,webrtc=info,retina=debug",
        LogLevel::Trace => "cam_relay=trace,tower_http=debug,webrtc=debug,retina=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Log configuration writes made through the API
fn spawn_config_watcher(
    store: &ConfigStore,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut changes = store.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(change) => tracing::info!("Configuration updated ({})", change.key),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Stop background loops, then close sessions before their sources
async fn cleanup(state: &Arc<AppState>, tasks: Vec<tokio::task::JoinHandle<()>>) {
    state.shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }
    state.shutdown_relay().await;
}
