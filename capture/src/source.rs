//! Upstream camera connection.
//!
//! A [`SourceConnector`] opens connections; each [`SourceConnection`] yields
//! decoded frames until it breaks.  Neither retries: reconnect policy lives
//! in [`crate::stream`].

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

use camwatch_common::config::Config;

use crate::ffmpeg;

/// One decoded RGB8 image.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Packed `width * height * 3` bytes, row-major.
    pub data: Bytes,
}

impl Frame {
    pub fn rgb8(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Frame {
            width,
            height,
            data: data.into(),
        }
    }

    /// Byte length of an RGB8 frame of the given size.
    pub fn rgb8_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The transport could not be established.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// A read failed mid-stream; the connection must be discarded.
    #[error("end of stream: {0}")]
    EndOfStream(String),
}

#[async_trait]
pub trait SourceConnector: Send + Sync + 'static {
    /// Try once to connect.  Never retries internally.
    async fn open(&self) -> Result<Box<dyn SourceConnection>, SourceError>;
}

#[async_trait]
pub trait SourceConnection: Send {
    fn is_open(&self) -> bool;

    /// Block until the next frame.  Any error means the connection is dead.
    async fn read_frame(&mut self) -> Result<Frame, SourceError>;

    /// Release the transport.  Safe to call more than once.
    async fn close(&mut self);
}

// ── ffmpeg-backed source ─────────────────────────────────────────────────

/// Connects to the camera by running ffmpeg and reading raw RGB frames
/// from its stdout.
#[derive(Debug, Clone)]
pub struct FfmpegSource {
    ffmpeg_bin: String,
    url: String,
    transport: String,
    width: u32,
    height: u32,
    open_timeout: Duration,
}

impl FfmpegSource {
    pub fn from_config(config: &Config) -> Self {
        FfmpegSource {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            url: config.source_url.clone(),
            transport: config.rtsp_transport.clone(),
            width: config.frame_width,
            height: config.frame_height,
            open_timeout: config.open_timeout(),
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(ffmpeg::input_args(&self.url, &self.transport));
        args.push("-i".to_string());
        args.push(self.url.clone());
        args.push("-an".to_string());
        args.push("-vf".to_string());
        args.push(format!("scale={}:{}", self.width, self.height));
        args.extend(
            ["-pix_fmt", "rgb24", "-f", "rawvideo", "pipe:1"]
                .iter()
                .map(|s| s.to_string()),
        );
        args
    }
}

#[async_trait]
impl SourceConnector for FfmpegSource {
    async fn open(&self) -> Result<Box<dyn SourceConnection>, SourceError> {
        if Frame::rgb8_len(self.width, self.height) == 0 {
            return Err(SourceError::Unavailable(format!(
                "invalid frame size {}x{}",
                self.width, self.height
            )));
        }

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::Unavailable(format!("cannot spawn {}: {e}", self.ffmpeg_bin)))?;

        if let Some(stderr) = child.stderr.take() {
            ffmpeg::drain_stderr("ffmpeg", stderr);
        }
        let stdout = child.stdout.take();

        let mut conn = FfmpegConnection {
            child: Some(child),
            stdout,
            width: self.width,
            height: self.height,
            pending: None,
        };

        // ffmpeg starts even when the camera is unreachable, so the
        // connection only counts as open once a first frame arrives.
        match tokio::time::timeout(self.open_timeout, conn.read_raw()).await {
            Ok(Ok(frame)) => {
                conn.pending = Some(frame);
                Ok(Box::new(conn))
            }
            Ok(Err(e)) => {
                conn.close().await;
                Err(SourceError::Unavailable(e.to_string()))
            }
            Err(_) => {
                conn.close().await;
                Err(SourceError::Unavailable(format!(
                    "no frame within {}s",
                    self.open_timeout.as_secs()
                )))
            }
        }
    }
}

struct FfmpegConnection {
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    width: u32,
    height: u32,
    /// First frame, read during `open`.
    pending: Option<Frame>,
}

impl FfmpegConnection {
    async fn read_raw(&mut self) -> Result<Frame, SourceError> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| SourceError::EndOfStream("connection closed".into()))?;

        let mut buf = vec![0u8; Frame::rgb8_len(self.width, self.height)];
        stdout
            .read_exact(&mut buf)
            .await
            .map_err(|e| SourceError::EndOfStream(e.to_string()))?;
        Ok(Frame::rgb8(self.width, self.height, buf))
    }
}

#[async_trait]
impl SourceConnection for FfmpegConnection {
    fn is_open(&self) -> bool {
        self.stdout.is_some()
    }

    async fn read_frame(&mut self) -> Result<Frame, SourceError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        self.read_raw().await
    }

    async fn close(&mut self) {
        self.stdout = None;
        self.pending = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("ffmpeg source already gone: {e}");
            }
        }
    }
}
