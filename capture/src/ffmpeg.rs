//! Small helpers shared by every ffmpeg child we spawn.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tracing::{debug, warn};

/// Input options for `url`: lower transport and a socket timeout for RTSP,
/// a read/write timeout for other network protocols.
pub fn input_args(url: &str, transport: &str) -> Vec<String> {
    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        vec![
            "-rtsp_transport".to_string(),
            transport.to_string(),
            "-timeout".to_string(),
            "10000000".to_string(),
        ]
    } else if url.contains("://") {
        vec!["-rw_timeout".to_string(), "10000000".to_string()]
    } else {
        vec![]
    }
}

/// Re-log a child's stderr so ffmpeg errors end up in our log and the pipe
/// never fills up.
pub fn drain_stderr(label: &'static str, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(l)) if l.trim().is_empty() => {}
                Ok(Some(l)) => warn!("[{label}] {l}"),
                Ok(None) | Err(_) => break,
            }
        }
        debug!("{label} stderr stream ended");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_args() {
        assert_eq!(
            input_args("rtsp://cam/stream1", "tcp"),
            ["-rtsp_transport", "tcp", "-timeout", "10000000"]
        );
        assert_eq!(
            input_args("http://cam/mjpeg", "tcp"),
            ["-rw_timeout", "10000000"]
        );
        assert!(input_args("/dev/video0", "tcp").is_empty());
    }
}
