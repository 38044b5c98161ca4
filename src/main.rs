use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use gstreamer as gst;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use multicam::capture::CameraPipeline;
use multicam::config::AppConfig;
use multicam::signaling::SignalingServer;
use multicam::supervisor;
use multicam::webrtc::PeerManager;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// multicam command line arguments
#[derive(Parser, Debug)]
#[command(name = "multicam")]
#[command(version, about = "Multi-camera WebRTC streaming server", long_about = None)]
struct CliArgs {
    /// Config file path
    #[arg(short = 'c', long, value_name = "FILE", default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting multicam v{}", env!("CARGO_PKG_VERSION"));

    // The media framework is initialized once, before any capture starts.
    gst::init().map_err(|e| anyhow::anyhow!("GStreamer init failed: {e}"))?;
    tracing::info!("GStreamer initialized: {}", gst::version_string());

    let config = AppConfig::load(&args.config)?;
    tracing::info!(
        cameras = config.cameras.len(),
        port = config.server.port,
        max_clients = config.webrtc.max_clients,
        "configuration loaded"
    );
    for cam in &config.cameras {
        tracing::info!(
            camera = %cam.id,
            name = %cam.name,
            kind = ?cam.kind,
            uri = %cam.uri,
            "  {}x{}@{}fps",
            cam.width,
            cam.height,
            cam.fps
        );
    }

    let cameras: Vec<Arc<CameraPipeline>> = config
        .cameras
        .iter()
        .map(|cam| Arc::new(CameraPipeline::new(cam.clone())))
        .collect();

    let peer_manager = Arc::new(PeerManager::new(config.webrtc.clone(), cameras.clone()));
    let signaling = Arc::new(SignalingServer::new(&config));

    // Signaling drives the peer lifecycle.
    {
        let peers = peer_manager.clone();
        signaling.on_client_connect(Arc::new(move |client_id, ws| {
            let peers = peers.clone();
            Box::pin(async move {
                if let Err(e) = peers.create_peer(&client_id, ws).await {
                    tracing::error!(client = %client_id, error = %e, "failed to create peer");
                }
            })
        }));
    }
    {
        let peers = peer_manager.clone();
        signaling.on_client_disconnect(Arc::new(move |client_id| {
            let peers = peers.clone();
            Box::pin(async move {
                peers.remove_peer(&client_id).await;
            })
        }));
    }
    {
        let peers = peer_manager.clone();
        signaling.on_client_message(Arc::new(move |client_id, msg| {
            let peers = peers.clone();
            Box::pin(async move {
                peers.handle_message(&client_id, msg).await;
            })
        }));
    }

    signaling.start().await?;

    let mut started = 0usize;
    for camera in &cameras {
        match camera.start() {
            Ok(()) => started += 1,
            Err(e) => {
                tracing::error!(camera = %camera.id(), error = %e, "failed to start camera")
            }
        }
    }
    if started == 0 {
        signaling.stop().await;
        anyhow::bail!("no cameras started successfully");
    }

    tracing::info!("------------------------------------------");
    tracing::info!(
        "  Signaling:   ws://{}:{}",
        config.server.bind_address,
        config.server.port
    );
    tracing::info!("  Cameras:     {}/{} active", started, cameras.len());
    tracing::info!("  Max clients: {}", config.webrtc.max_clients);
    tracing::info!("------------------------------------------");

    // Supervisor loop: periodic health report until the first signal.
    let mut report = tokio::time::interval(supervisor::REPORT_INTERVAL);
    report.tick().await; // consume the immediate first tick
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = report.tick() => {
                let health = supervisor::snapshot(&cameras);
                supervisor::log_report(&health, peer_manager.peer_count().await);
            }
            _ = &mut shutdown => break,
        }
    }

    tracing::info!("shutdown signal received");

    // A second signal forces immediate exit.
    tokio::spawn(async {
        shutdown_signal().await;
        tracing::warn!("second signal received, forcing exit");
        std::process::exit(1);
    });

    supervisor::graceful_shutdown(&cameras, &peer_manager, &signaling).await;

    tracing::info!("server stopped cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "multicam=error",
        LogLevel::Warn => "multicam=warn",
        LogLevel::Info => "multicam=info",
        LogLevel::Debug => "multicam=debug",
        LogLevel::Trace => "multicam=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}
