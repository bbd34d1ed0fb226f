use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use h264_relay::fanout::Fanout;
use h264_relay::settings::Settings;
use h264_relay::state::AppState;
use h264_relay::supervisor::{EncoderProcess, DEFAULT_SHUTDOWN_GRACE};
use h264_relay::web;
use h264_relay::webrtc::{Hub, WebRtcConfig};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

#[derive(Parser, Debug)]
#[command(name = "h264-relay")]
#[command(version, about = "Relays an H.264 encoder's output to browsers over WebRTC", long_about = None)]
struct CliArgs {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long, value_name = "FILE")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("starting h264-relay v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load(&args.config)?;
    let listen_address = settings.listen_address.clone();
    let listen_port = settings.listen_port;

    let webrtc_config = WebRtcConfig::from(&settings);
    let (hub, hub_handle) = Hub::new(webrtc_config);
    tokio::spawn(hub.run());

    let shutdown = CancellationToken::new();
    let state = AppState::new(settings.clone(), hub_handle.clone(), shutdown.clone());

    let (encoder, reader) = EncoderProcess::spawn(&settings).await?;

    let fanout = Fanout::new(
        hub_handle.clone(),
        settings.queue_capacity,
        settings.frame_period_ms,
        settings.from_file,
    );
    let fanout_shutdown = shutdown.clone();
    let fanout_task = tokio::spawn(async move {
        tokio::select! {
            result = fanout.run(reader) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "fan-out terminated with an error");
                }
            }
            _ = fanout_shutdown.cancelled() => {
                tracing::info!("fan-out stopping on shutdown signal");
            }
        }
    });

    let addr: SocketAddr = format!("{listen_address}:{listen_port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening for viewers");

    let router = web::create_router(state);
    let http_shutdown = shutdown.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        http_shutdown.cancelled().await;
    });
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");
    shutdown.cancel();

    for peer in hub_handle.peers().await {
        if let Err(e) = peer.close().await {
            tracing::warn!(client_id = %peer.client_id, error = %e, "error closing peer on shutdown");
        }
    }

    let _ = server_task.await;
    let _ = fanout_task.await;

    encoder.shutdown(DEFAULT_SHUTDOWN_GRACE).await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate.recv() => {}
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "h264_relay=error,tower_http=error",
        LogLevel::Warn => "h264_relay=warn,tower_http=warn",
        LogLevel::Info => "h264_relay=info,tower_http=info",
        LogLevel::Debug => "h264_relay=debug,tower_http=debug",
        LogLevel::Trace => "h264_relay=trace,tower_http=debug",
    };

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
