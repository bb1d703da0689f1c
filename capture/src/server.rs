//! HTTP server – live view, recording controls and recording downloads.
//!
//! Routes:
//!   GET  /                    → index page with the live view
//!   GET  /video               → multipart MJPEG stream (one supervisor per viewer)
//!   GET  /recordings          → HTML list of recorded segments
//!   GET  /download/{name}     → download a segment as an attachment
//!   GET  /start_recording     → (re)start recording
//!   GET  /stop_recording      → stop recording
//!   GET  /api/health          → health check
//!   GET  /api/recordings      → JSON list of recorded segments

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use camwatch_common::config::Config;
use camwatch_common::multipart;
use camwatch_common::protocol::{HealthResponse, RecordingInfo};
use camwatch_common::recordings;

use crate::encoder::FrameEncoder;
use crate::recorder::RecordingProcessManager;
use crate::source::SourceConnector;
use crate::stream::{RetryPolicy, StreamState, StreamSupervisor};

const INDEX_HTML: &str = include_str!("../templates/index.html");

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    recordings_dir: PathBuf,
    connector: Arc<dyn SourceConnector>,
    encoder: Arc<dyn FrameEncoder>,
    policy: RetryPolicy,
    recorder: Arc<RecordingProcessManager>,
    /// `None` when viewers are unlimited.
    viewer_slots: Option<Arc<Semaphore>>,
    /// Live state of each connected viewer's supervisor.
    viewers: Arc<Mutex<HashMap<u64, watch::Receiver<StreamState>>>>,
    next_viewer: Arc<AtomicU64>,
    start_time: Instant,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: &Config,
        connector: Arc<dyn SourceConnector>,
        encoder: Arc<dyn FrameEncoder>,
        recorder: Arc<RecordingProcessManager>,
        shutdown: CancellationToken,
    ) -> Self {
        AppState {
            recordings_dir: config.recordings_dir.clone(),
            connector,
            encoder,
            policy: RetryPolicy::from_config(config),
            recorder,
            viewer_slots: (config.max_viewers > 0)
                .then(|| Arc::new(Semaphore::new(config.max_viewers))),
            viewers: Arc::new(Mutex::new(HashMap::new())),
            next_viewer: Arc::new(AtomicU64::new(1)),
            start_time: Instant::now(),
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video", get(video))
        .route("/recordings", get(recordings_page))
        .route("/download/{name}", get(download))
        .route("/start_recording", get(start_recording))
        .route("/stop_recording", get(stop_recording))
        .route("/api/health", get(health))
        .route("/api/recordings", get(list_recordings))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.  Blocks until `state.shutdown` is cancelled.
pub async fn run(state: AppState, listen_addr: &str) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("HTTP server listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

// ── live view ────────────────────────────────────────────────────────────

type ViewerMap = Arc<Mutex<HashMap<u64, watch::Receiver<StreamState>>>>;

/// Holds a viewer's admission slot and its entry in the viewer map.
struct ViewerGuard {
    _permit: Option<OwnedSemaphorePermit>,
    id: u64,
    viewers: ViewerMap,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        if let Ok(mut viewers) = self.viewers.lock() {
            viewers.remove(&self.id);
        }
    }
}

impl AppState {
    fn viewer_count(&self) -> usize {
        self.viewers.lock().map(|v| v.len()).unwrap_or(0)
    }

    fn streaming_count(&self) -> usize {
        self.viewers
            .lock()
            .map(|v| {
                v.values()
                    .filter(|s| *s.borrow() == StreamState::Streaming)
                    .count()
            })
            .unwrap_or(0)
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn video(State(state): State<AppState>) -> Response {
    let permit = match &state.viewer_slots {
        Some(slots) => match slots.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!("Rejecting viewer: limit reached");
                return (StatusCode::SERVICE_UNAVAILABLE, "Too many viewers\n").into_response();
            }
        },
        None => None,
    };
    let viewer = state.next_viewer.fetch_add(1, Ordering::Relaxed);
    let supervisor = StreamSupervisor::new(
        state.connector.clone(),
        state.encoder.clone(),
        state.policy.clone(),
    )
    .with_shutdown(state.shutdown.child_token())
    .with_viewer_id(viewer);

    if let Ok(mut viewers) = state.viewers.lock() {
        viewers.insert(viewer, supervisor.subscribe());
    }
    let guard = ViewerGuard {
        _permit: permit,
        id: viewer,
        viewers: state.viewers.clone(),
    };

    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        info!(viewer, "Viewer connected");
        supervisor.run(tx).await;
        drop(guard);
        info!(viewer, "Viewer disconnected");
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    (
        [
            (
                header::CONTENT_TYPE,
                multipart::stream_content_type(multipart::BOUNDARY),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response()
}

// ── recordings ───────────────────────────────────────────────────────────

async fn recordings_page(State(state): State<AppState>) -> Result<Html<String>, StatusCode> {
    let listed = recordings::list(&state.recordings_dir)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut html = String::from("<!doctype html>\n<title>Recordings</title>\n<h1>Recordings</h1>\n<ul>\n");
    for rec in &listed {
        let href = escape_html(&urlencoding::encode(&rec.filename));
        let name = escape_html(&rec.filename);
        let _ = writeln!(
            html,
            "<li><a href=\"/download/{href}\">{name}</a> ({} bytes)</li>",
            rec.size
        );
    }
    html.push_str("</ul>\n");
    Ok(Html(html))
}

async fn list_recordings(
    State(state): State<AppState>,
) -> Result<Json<Vec<RecordingInfo>>, StatusCode> {
    recordings::list(&state.recordings_dir)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn download(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    // Sanitise: prevent directory traversal
    if !recordings::is_safe_name(&name) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let file_path = state.recordings_dir.join(&name);
    if !file_path.is_file() {
        return Err(StatusCode::NOT_FOUND);
    }

    let file = tokio::fs::File::open(&file_path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;

    let content_type = if name.ends_with(".mp4") {
        "video/mp4"
    } else {
        "application/octet-stream"
    };

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    ))
}

// ── recording control ────────────────────────────────────────────────────

// Both acknowledge at once; the recorder applies requests in arrival order.

async fn start_recording(State(state): State<AppState>) -> &'static str {
    state.recorder.spawn_restart();
    "Recording started\n"
}

async fn stop_recording(State(state): State<AppState>) -> &'static str {
    state.recorder.spawn_stop();
    "Recording stopped\n"
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        recording: state.recorder.is_running().await,
        recording_enabled: state.recorder.is_enabled().await,
        viewers: state.viewer_count(),
        streaming_viewers: state.streaming_count(),
    })
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
