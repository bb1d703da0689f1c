//! Per-viewer live stream supervision.
//!
//! A [`StreamSupervisor`] keeps one multipart JPEG stream alive for one
//! viewer.  It loops connect → read/encode/send → reconnect forever, and
//! only stops when the viewer goes away or the process shuts down.
//!
//! ```text
//!  Disconnected ──open──▶ Connecting ──ok──▶ Streaming
//!       ▲                  │  ▲                 │
//!       │                  └──┘ fail, sleep 1s  │
//!       └────────── read failed, sleep 0.2s ────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use camwatch_common::config::Config;
use camwatch_common::multipart;

use crate::encoder::FrameEncoder;
use crate::source::{SourceConnection, SourceConnector, SourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Streaming,
    /// Viewer gone or shutdown requested.  Terminal.
    Closed,
}

/// Delays used between connection attempts.  There is no cap on attempts
/// and no growth: the camera is expected to come back eventually.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Pause after a failed `open`.
    pub open_retry_delay: Duration,
    /// Pause after a connection breaks mid-stream.
    pub reconnect_delay: Duration,
    /// Upper bound of random extra delay added to both.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        RetryPolicy {
            open_retry_delay: config.open_retry_delay(),
            reconnect_delay: config.reconnect_delay(),
            jitter: config.retry_jitter(),
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter.is_zero() {
            return base;
        }
        let max = self.jitter.as_millis() as u64;
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            open_retry_delay: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(200),
            jitter: Duration::ZERO,
        }
    }
}

/// Why the inner read loop returned.
enum PumpExit {
    SourceLost(SourceError),
    ViewerGone,
}

pub struct StreamSupervisor {
    connector: Arc<dyn SourceConnector>,
    encoder: Arc<dyn FrameEncoder>,
    policy: RetryPolicy,
    boundary: &'static str,
    state: watch::Sender<StreamState>,
    shutdown: CancellationToken,
    viewer: u64,
}

impl StreamSupervisor {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        encoder: Arc<dyn FrameEncoder>,
        policy: RetryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Disconnected);
        StreamSupervisor {
            connector,
            encoder,
            policy,
            boundary: multipart::BOUNDARY,
            state,
            shutdown: CancellationToken::new(),
            viewer: 0,
        }
    }

    /// Stop when `token` is cancelled, in addition to viewer disconnect.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Tag log lines with a viewer id.
    pub fn with_viewer_id(mut self, viewer: u64) -> Self {
        self.viewer = viewer;
        self
    }

    /// Observe the supervisor's connection state.
    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    /// Feed multipart parts into `tx` until its receiver is dropped.
    ///
    /// The channel should hold a single part so a slow viewer applies
    /// back-pressure instead of queueing stale frames.
    pub async fn run(self, tx: mpsc::Sender<Bytes>) {
        let viewer = self.viewer;
        let mut failed_opens: u64 = 0;

        loop {
            self.state.send_replace(StreamState::Connecting);
            let opened = tokio::select! {
                biased;
                _ = tx.closed() => break,
                _ = self.shutdown.cancelled() => break,
                r = self.connector.open() => r,
            };

            let mut conn = match opened {
                Ok(conn) => conn,
                Err(e) => {
                    failed_opens += 1;
                    warn!(viewer, attempt = failed_opens, "Cannot open source ({e}) – retrying");
                    if !self.pause(&tx, self.policy.open_retry_delay).await {
                        break;
                    }
                    continue;
                }
            };

            info!(viewer, "Stream: connected after {failed_opens} failed attempt(s)");
            failed_opens = 0;
            self.state.send_replace(StreamState::Streaming);

            let exit = self.pump(conn.as_mut(), &tx).await;
            conn.close().await;

            match exit {
                PumpExit::ViewerGone => break,
                PumpExit::SourceLost(e) => {
                    warn!(viewer, "Stream: frame read failed ({e}) – reconnecting");
                    self.state.send_replace(StreamState::Disconnected);
                    if !self.pause(&tx, self.policy.reconnect_delay).await {
                        break;
                    }
                }
            }
        }

        self.state.send_replace(StreamState::Closed);
        debug!(viewer, "Stream supervisor stopped");
    }

    async fn pump(&self, conn: &mut dyn SourceConnection, tx: &mpsc::Sender<Bytes>) -> PumpExit {
        loop {
            if !conn.is_open() {
                return PumpExit::SourceLost(SourceError::EndOfStream("connection closed".into()));
            }

            let read = tokio::select! {
                biased;
                _ = tx.closed() => return PumpExit::ViewerGone,
                _ = self.shutdown.cancelled() => return PumpExit::ViewerGone,
                r = conn.read_frame() => r,
            };
            let frame = match read {
                Ok(frame) => frame,
                Err(e) => return PumpExit::SourceLost(e),
            };

            let chunk = match self.encoder.encode(&frame) {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(viewer = self.viewer, "Dropping frame: {e}");
                    continue;
                }
            };
            let part = multipart::frame_part(self.boundary, chunk.content_type, &chunk.bytes);

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return PumpExit::ViewerGone,
                sent = tx.send(part) => {
                    if sent.is_err() {
                        return PumpExit::ViewerGone;
                    }
                }
            }
        }
    }

    /// Sleep for `base` (plus jitter).  Returns `false` if the viewer left
    /// or shutdown was requested in the meantime.
    async fn pause(&self, tx: &mpsc::Sender<Bytes>, base: Duration) -> bool {
        tokio::select! {
            biased;
            _ = tx.closed() => false,
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.policy.jittered(base)) => true,
        }
    }
}
