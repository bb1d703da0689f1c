//! Recording to disk – owns the single ffmpeg child that writes rotating
//! segments into the recording directory.
//!
//! The child lives in a mutex-guarded slot, so "at most one recorder" holds
//! without scanning the process table: `start` stops whatever the slot holds
//! before spawning, and every call is serialized by the lock.  `restart`
//! holds the lock across stop, pause and start.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use camwatch_common::config::Config;

use crate::ffmpeg;

/// Program and arguments for the recording child.
#[derive(Debug, Clone)]
pub struct RecorderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RecorderCommand {
    /// ffmpeg segment muxer: stream copy into `segment_secs` long MP4 files
    /// named by capture time, each with timestamps reset to zero.
    pub fn ffmpeg_segments(config: &Config) -> Self {
        let output_pattern = config
            .recordings_dir
            .join(format!("{}_%Y-%m-%d_%H-%M-%S.mp4", config.recording_prefix));

        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(ffmpeg::input_args(&config.source_url, &config.rtsp_transport));
        args.push("-i".to_string());
        args.push(config.source_url.clone());
        args.extend(
            [
                "-map",
                "0",
                "-c",
                "copy",
                "-f",
                "segment",
                "-segment_format",
                "mp4",
                "-segment_time",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(config.segment_secs.to_string());
        args.extend(
            ["-reset_timestamps", "1", "-strftime", "1"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(output_pattern.to_string_lossy().to_string());

        RecorderCommand {
            program: config.ffmpeg_bin.clone(),
            args,
        }
    }
}

/// What the watchdog needs from a recorder.
#[async_trait]
pub trait RecordingControl: Send + Sync + 'static {
    /// Stop, pause, start, but only if recording is enabled.  The check and
    /// the restart are one step, so an explicit stop is never undone.
    /// Returns whether a restart happened.
    async fn restart_if_enabled(&self) -> bool;

    /// `Some(reason)` if recording is enabled but its process is gone.
    async fn check_alive(&self) -> Option<String>;
}

#[derive(Default)]
struct Slot {
    child: Option<Child>,
    enabled: bool,
    /// Ticket of the last start/stop/restart applied.
    applied: u64,
}

pub struct RecordingProcessManager {
    command: RecorderCommand,
    restart_pause: Duration,
    /// How long ffmpeg gets to finalize the open segment after `q`.
    stop_grace: Duration,
    slot: Mutex<Slot>,
    /// Tickets are issued when a command is requested.  A command whose
    /// ticket is older than the applied one is skipped, so the last
    /// request wins even when the tasks carrying them race for the lock.
    issued: AtomicU64,
}

impl RecordingProcessManager {
    pub fn new(command: RecorderCommand, restart_pause: Duration) -> Self {
        RecordingProcessManager {
            command,
            restart_pause,
            stop_grace: Duration::from_secs(5),
            slot: Mutex::new(Slot::default()),
            issued: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(RecorderCommand::ffmpeg_segments(config), config.restart_pause())
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Launch the recorder.  Returns without waiting on the child.  Any
    /// previous child is stopped first; spawn failures are logged only.
    pub async fn start(&self) {
        let ticket = self.ticket();
        let mut slot = self.slot.lock().await;
        if Self::superseded(&mut slot, ticket) {
            return;
        }
        self.stop_locked(&mut slot).await;
        self.spawn_locked(&mut slot);
    }

    /// Stop the recorder if one is running.  Calling it again is a no-op.
    pub async fn stop(&self) {
        let ticket = self.ticket();
        self.stop_ticket(ticket).await;
    }

    /// `stop`, a short pause for the old child to release its files, then
    /// `start`.  The slot stays locked throughout, so a `stop` issued
    /// meanwhile runs after the new child is up and wins.
    #[cfg(test)]
    pub async fn restart(&self) {
        let ticket = self.ticket();
        self.restart_ticket(ticket).await;
    }

    /// Queue a restart and return at once.  Ordering against other
    /// requests is fixed here, not when the task runs.
    pub fn spawn_restart(self: &Arc<Self>) -> JoinHandle<()> {
        let ticket = self.ticket();
        let manager = self.clone();
        tokio::spawn(async move { manager.restart_ticket(ticket).await })
    }

    /// Queue a stop and return at once.
    pub fn spawn_stop(self: &Arc<Self>) -> JoinHandle<()> {
        let ticket = self.ticket();
        let manager = self.clone();
        tokio::spawn(async move { manager.stop_ticket(ticket).await })
    }

    pub async fn is_running(&self) -> bool {
        let mut slot = self.slot.lock().await;
        match slot.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Whether recording is supposed to be running (started and not
    /// stopped since).
    pub async fn is_enabled(&self) -> bool {
        self.slot.lock().await.enabled
    }

    #[cfg(test)]
    pub async fn current_pid(&self) -> Option<u32> {
        self.slot.lock().await.child.as_ref().and_then(|c| c.id())
    }

    fn ticket(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn superseded(slot: &mut Slot, ticket: u64) -> bool {
        if slot.applied > ticket {
            debug!("Skipping recording command #{ticket}, #{} already applied", slot.applied);
            return true;
        }
        slot.applied = ticket;
        false
    }

    async fn stop_ticket(&self, ticket: u64) {
        let mut slot = self.slot.lock().await;
        if Self::superseded(&mut slot, ticket) {
            return;
        }
        slot.enabled = false;
        self.stop_locked(&mut slot).await;
    }

    async fn restart_ticket(&self, ticket: u64) {
        let mut slot = self.slot.lock().await;
        if Self::superseded(&mut slot, ticket) {
            return;
        }
        self.restart_locked(&mut slot).await;
    }

    async fn restart_locked(&self, slot: &mut Slot) {
        info!("Restarting recording");
        self.stop_locked(slot).await;
        tokio::time::sleep(self.restart_pause).await;
        self.spawn_locked(slot);
    }

    fn spawn_locked(&self, slot: &mut Slot) {
        slot.enabled = true;

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match cmd.spawn() {
            Ok(mut child) => {
                if let Some(stderr) = child.stderr.take() {
                    ffmpeg::drain_stderr("recorder", stderr);
                }
                info!(
                    "Recording started (pid={:?}): {} {}",
                    child.id(),
                    self.command.program,
                    self.command.args.join(" ")
                );
                slot.child = Some(child);
            }
            Err(e) => error!("Failed to spawn recorder {}: {e}", self.command.program),
        }
    }

    async fn stop_locked(&self, slot: &mut Slot) {
        let Some(mut child) = slot.child.take() else {
            return;
        };
        let pid = child.id();

        // `q` makes ffmpeg finish the open segment so it stays playable.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(b"q").await {
                debug!("Cannot send 'q' to recorder: {e}");
            }
        }

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => info!("Recording stopped (pid={pid:?}, {status})"),
            Ok(Err(e)) => warn!("Cannot wait for recorder (pid={pid:?}): {e}"),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Cannot kill recorder (pid={pid:?}): {e}");
                } else {
                    info!("Recording killed (pid={pid:?})");
                }
            }
        }
    }
}

#[async_trait]
impl RecordingControl for RecordingProcessManager {
    async fn restart_if_enabled(&self) -> bool {
        let mut slot = self.slot.lock().await;
        if !slot.enabled {
            return false;
        }
        self.restart_locked(&mut slot).await;
        true
    }

    async fn check_alive(&self) -> Option<String> {
        let mut slot = self.slot.lock().await;
        if !slot.enabled {
            return None;
        }
        match slot.child.as_mut() {
            None => Some("recorder is not running".to_string()),
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(format!("recorder exited with {status}")),
                Ok(None) => None,
                Err(e) => Some(format!("cannot check recorder: {e}")),
            },
        }
    }
}
