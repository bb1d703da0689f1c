//! camwatch – live MJPEG view of an RTSP camera plus continuous segmented
//! recording to disk.
//!
//! This binary:
//! 1. Reads configuration from `camwatch.conf` (and the environment)
//! 2. Starts the ffmpeg recorder and the watchdog that keeps it alive
//! 3. Runs an axum HTTP server with the live view, recording controls and
//!    segment downloads

mod encoder;
mod ffmpeg;
mod recorder;
mod server;
mod source;
mod stream;
mod watchdog;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use camwatch_common::config;

use crate::encoder::JpegFrameEncoder;
use crate::recorder::RecordingProcessManager;
use crate::source::FfmpegSource;
use crate::watchdog::RecordingWatchdog;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config = match std::env::args().nth(1) {
        Some(path) => config::load(&PathBuf::from(path)),
        None => config::load_default(),
    }
    .context("Config load failed")?;

    info!(
        "camwatch starting (source={}, listen={})",
        config.source_url, config.listen_addr
    );

    std::fs::create_dir_all(&config.recordings_dir)
        .context("Cannot create recordings directory")?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        signal.cancel();
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── start recording + watchdog ───────────────────────────────────
    let recorder = Arc::new(RecordingProcessManager::from_config(&config));
    recorder.start().await;

    let watchdog = RecordingWatchdog::new(
        config.recordings_dir.clone(),
        config.watchdog_interval(),
        recorder.clone(),
    );
    let watchdog_handle = tokio::spawn(watchdog.run(shutdown.clone()));

    // ── start HTTP server ────────────────────────────────────────────
    let state = server::AppState::new(
        &config,
        Arc::new(FfmpegSource::from_config(&config)),
        Arc::new(JpegFrameEncoder::new(config.jpeg_quality)),
        recorder.clone(),
        shutdown.clone(),
    );
    let result = server::run(state, &config.listen_addr).await;
    if let Err(e) = &result {
        tracing::error!("HTTP server error: {e:#}");
    }

    // Clean up the recorder so the open segment is finalized
    shutdown.cancel();
    let _ = watchdog_handle.await;
    recorder.stop().await;
    info!("camwatch stopped");

    result
}
