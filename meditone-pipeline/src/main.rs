//! meditone-pipeline - personalized meditation generation service
//!
//! Accepts intake forms over HTTP and drives each request through script,
//! voice, music and mix stages on a durable task queue.

use anyhow::{Context, Result};
use clap::Parser;
use meditone_common::config::{self as bootstrap, RootLayout, TomlConfig};
use meditone_common::events::EventBus;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meditone_pipeline::audio::{AudioMixer, FfmpegToolkit, VoiceFormat};
use meditone_pipeline::config::{PipelineConfig, DEFAULT_PORT, DEFAULT_WORKERS};
use meditone_pipeline::queue::WorkerPool;
use meditone_pipeline::services::{
    ElevenLabsClient, GoogleDriveClient, HttpFetcher, OpenAiClient, SunoClient,
};
use meditone_pipeline::{AppState, Collaborators, PipelineContext, PipelineSettings};

const DEFAULT_LOG_FILTER: &str = "meditone_pipeline=info,meditone_common=info,tower_http=info";
const EVENT_BUS_CAPACITY: usize = 256;
const FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(version, about = "Personalized meditation generation pipeline")]
struct Args {
    /// Port to listen on (default 5740)
    #[arg(short, long, env = "MEDITONE_PORT")]
    port: Option<u16>,

    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root folder holding the database and scratch files
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Number of queue workers
    #[arg(short, long, env = "MEDITONE_WORKERS")]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let toml_config = bootstrap::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;

    init_tracing(&toml_config);

    info!("Starting meditone-pipeline");
    info!(
        "Version: {} ({} {}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_PROFILE"),
        env!("BUILD_TIMESTAMP")
    );

    // Step 1: Resolve root folder and create it with its scratch directory
    let root = bootstrap::resolve_root_folder(args.root_folder.as_deref(), &toml_config);
    let layout = RootLayout::new(root);
    layout
        .ensure_directories()
        .context("Failed to initialize root folder")?;
    info!("Root folder: {}", layout.root.display());

    // Step 2: Open or create the database
    let pool = meditone_common::db::init_database(&layout.database_path)
        .await
        .context("Failed to open database")?;
    info!("Database: {}", layout.database_path.display());

    // Step 3: Resolve collaborator settings and build the clients
    let config = PipelineConfig::resolve(&toml_config);
    let collaborators = Collaborators {
        script_writer: Arc::new(OpenAiClient::new(config.openai.clone())?),
        voice: Arc::new(ElevenLabsClient::new(config.elevenlabs.clone())?),
        music: Arc::new(SunoClient::new(config.suno.clone())?),
        storage: Arc::new(GoogleDriveClient::new(config.google_drive.clone())?),
        fetcher: Arc::new(HttpFetcher::new(FETCH_TIMEOUT)?),
    };

    let toolkit = Arc::new(FfmpegToolkit::new(
        config.audio.ffmpeg_bin.clone(),
        config.audio.ffprobe_bin.clone(),
        config.audio.mix_timeout,
    ));
    let mixer = AudioMixer::new(
        toolkit,
        layout.temp_dir.clone(),
        config.audio.duration_fallback_secs,
    );

    let mut settings = PipelineSettings::new(layout.temp_dir.clone());
    settings.mix = config.mix.clone();
    settings.voice_format = VoiceFormat {
        sample_rate: config.elevenlabs.sample_rate,
        ..VoiceFormat::default()
    };
    settings.conversion = config.audio.conversion.clone();
    settings.webhook_token = config.suno.webhook_token.clone();
    if settings.webhook_token.is_none() {
        info!("No webhook token configured; music callbacks are accepted unauthenticated");
    }

    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
    let ctx = Arc::new(PipelineContext::new(
        pool,
        collaborators,
        mixer,
        settings,
        event_bus,
    ));

    // Step 4: Start the queue workers
    let workers = args
        .workers
        .or(toml_config.workers)
        .unwrap_or(DEFAULT_WORKERS);
    let cancel = CancellationToken::new();
    let handles = WorkerPool::new(ctx.clone(), workers).spawn(cancel.clone());
    info!("{} queue workers started", handles.len());

    // Step 5: Serve HTTP until a shutdown signal arrives
    let app = meditone_pipeline::build_router(AppState::new(ctx));
    let port = args.port.or(toml_config.port).unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("Server error")?;

    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    info!("Shutdown complete");
    Ok(())
}

/// `RUST_LOG` wins; otherwise the TOML level applies to the service crates
fn init_tracing(config: &TomlConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config.logging.level.trim();
        if level.is_empty() || level.eq_ignore_ascii_case("info") {
            DEFAULT_LOG_FILTER.into()
        } else if level.contains('=') {
            level.into()
        } else {
            format!(
                "meditone_pipeline={0},meditone_common={0},tower_http={0}",
                level
            )
            .into()
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }

    cancel.cancel();
}
