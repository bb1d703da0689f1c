//! Recording watchdog – polls the recording directory and restarts the
//! recorder when the newest segment disappears or the recorder dies.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use camwatch_common::recordings;

use crate::recorder::RecordingControl;

/// What the watchdog remembers between polls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogState {
    /// Newest segment seen on the previous poll.
    pub last_newest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    SegmentDeleted(String),
    ProcessExited(String),
}

pub struct RecordingWatchdog {
    dir: PathBuf,
    interval: Duration,
    control: Arc<dyn RecordingControl>,
    state: WatchdogState,
}

impl RecordingWatchdog {
    pub fn new(dir: PathBuf, interval: Duration, control: Arc<dyn RecordingControl>) -> Self {
        RecordingWatchdog {
            dir,
            interval,
            control,
            state: WatchdogState::default(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &WatchdogState {
        &self.state
    }

    /// Poll every `interval` until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Watching {} every {}s",
            self.dir.display(),
            self.interval.as_secs()
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.poll_once().await;
        }
        info!("Watchdog stopped");
    }

    /// One health check.  Restarts the recorder at most once and returns
    /// the anomaly that caused it.
    pub async fn poll_once(&mut self) -> Option<Anomaly> {
        let mut anomaly = None;

        if let Some(prev) = &self.state.last_newest {
            if !self.dir.join(prev).exists() {
                anomaly = Some(Anomaly::SegmentDeleted(prev.clone()));
            }
        }

        let newest = match recordings::newest(&self.dir) {
            Ok(newest) => newest,
            Err(e) => {
                warn!("Cannot list {}: {e}", self.dir.display());
                return None;
            }
        };

        // Listing and the existence check are not atomic; a file removed in
        // between counts as deleted.
        if anomaly.is_none() {
            if let Some(name) = &newest {
                if !self.dir.join(name).exists() {
                    anomaly = Some(Anomaly::SegmentDeleted(name.clone()));
                }
            }
        }

        if anomaly.is_none() {
            if let Some(reason) = self.control.check_alive().await {
                anomaly = Some(Anomaly::ProcessExited(reason));
            }
        }

        if let Some(a) = anomaly.take() {
            if self.control.restart_if_enabled().await {
                match &a {
                    Anomaly::SegmentDeleted(name) => {
                        warn!("Active recording {name} disappeared – recorder restarted")
                    }
                    Anomaly::ProcessExited(reason) => warn!("{reason} – recorder restarted"),
                }
                anomaly = Some(a);
            } else {
                debug!("{a:?} while recording is stopped – ignoring");
            }
        }

        if newest.is_none() {
            debug!("Recording directory empty");
        }
        self.state.last_newest = newest;
        anomaly
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::recorder::{RecorderCommand, RecordingProcessManager};

    #[derive(Default)]
    struct FakeControl {
        restarts: AtomicUsize,
        disabled: AtomicBool,
        dead: AtomicBool,
    }

    #[async_trait]
    impl RecordingControl for FakeControl {
        async fn restart_if_enabled(&self) -> bool {
            if self.disabled.load(Ordering::SeqCst) {
                return false;
            }
            self.restarts.fetch_add(1, Ordering::SeqCst);
            self.dead.store(false, Ordering::SeqCst);
            true
        }

        async fn check_alive(&self) -> Option<String> {
            if self.disabled.load(Ordering::SeqCst) {
                return None;
            }
            self.dead
                .load(Ordering::SeqCst)
                .then(|| "recorder exited with exit status: 1".to_string())
        }
    }

    const A: &str = "a_2024-01-01_00-00-00.mp4";
    const B: &str = "b_2024-01-01_01-00-00.mp4";

    fn setup() -> (tempfile::TempDir, Arc<FakeControl>, RecordingWatchdog) {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(FakeControl::default());
        let watchdog =
            RecordingWatchdog::new(dir.path().to_path_buf(), Duration::from_secs(5), control.clone());
        (dir, control, watchdog)
    }

    #[tokio::test]
    async fn test_empty_dir_never_restarts() {
        let (_dir, control, mut watchdog) = setup();
        for _ in 0..3 {
            assert_eq!(watchdog.poll_once().await, None);
        }
        assert_eq!(control.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(watchdog.state().last_newest, None);
    }

    #[tokio::test]
    async fn test_deleting_newest_restarts_once() {
        let (dir, control, mut watchdog) = setup();
        std::fs::write(dir.path().join(A), b"a").unwrap();
        std::fs::write(dir.path().join(B), b"b").unwrap();

        assert_eq!(watchdog.poll_once().await, None);
        assert_eq!(watchdog.state().last_newest.as_deref(), Some(B));

        std::fs::remove_file(dir.path().join(B)).unwrap();
        assert_eq!(
            watchdog.poll_once().await,
            Some(Anomaly::SegmentDeleted(B.to_string()))
        );
        assert_eq!(watchdog.state().last_newest.as_deref(), Some(A));

        assert_eq!(watchdog.poll_once().await, None);
        assert_eq!(watchdog.poll_once().await, None);
        assert_eq!(control.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deleting_older_segment_is_ignored() {
        let (dir, control, mut watchdog) = setup();
        std::fs::write(dir.path().join(A), b"a").unwrap();
        std::fs::write(dir.path().join(B), b"b").unwrap();
        watchdog.poll_once().await;

        std::fs::remove_file(dir.path().join(A)).unwrap();
        assert_eq!(watchdog.poll_once().await, None);
        assert_eq!(control.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deleting_everything_restarts_once() {
        let (dir, control, mut watchdog) = setup();
        std::fs::write(dir.path().join(A), b"a").unwrap();
        watchdog.poll_once().await;

        std::fs::remove_file(dir.path().join(A)).unwrap();
        assert!(watchdog.poll_once().await.is_some());
        assert_eq!(watchdog.poll_once().await, None);
        assert_eq!(control.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deletion_ignored_when_recording_stopped() {
        let (dir, control, mut watchdog) = setup();
        std::fs::write(dir.path().join(B), b"b").unwrap();
        watchdog.poll_once().await;

        control.disabled.store(true, Ordering::SeqCst);
        std::fs::remove_file(dir.path().join(B)).unwrap();
        assert_eq!(watchdog.poll_once().await, None);
        assert_eq!(control.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_process_exit_restarts() {
        let (_dir, control, mut watchdog) = setup();
        control.dead.store(true, Ordering::SeqCst);
        assert!(matches!(
            watchdog.poll_once().await,
            Some(Anomaly::ProcessExited(_))
        ));
        assert_eq!(watchdog.poll_once().await, None);
        assert_eq!(control.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_detects_deletion_within_one_interval() {
        let (dir, control, watchdog) = setup();
        std::fs::write(dir.path().join(A), b"a").unwrap();
        std::fs::write(dir.path().join(B), b"b").unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(watchdog.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        std::fs::remove_file(dir.path().join(B)).unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(control.restarts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(control.restarts.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deletion_after_stop_keeps_recorder_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(
            RecordingProcessManager::new(
                RecorderCommand {
                    program: "sleep".to_string(),
                    args: vec!["30".to_string()],
                },
                Duration::from_millis(10),
            )
            .with_stop_grace(Duration::from_millis(200)),
        );
        manager.start().await;

        std::fs::write(dir.path().join(B), b"b").unwrap();
        let mut watchdog =
            RecordingWatchdog::new(dir.path().to_path_buf(), Duration::from_secs(5), manager.clone());
        assert_eq!(watchdog.poll_once().await, None);

        manager.stop().await;
        std::fs::remove_file(dir.path().join(B)).unwrap();
        assert_eq!(watchdog.poll_once().await, None);
        assert!(!manager.is_running().await);
        assert!(!manager.is_enabled().await);
    }
}
