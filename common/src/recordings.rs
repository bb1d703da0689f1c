//! Read-only view of the recording directory.
//!
//! Segment names carry a capture timestamp (`cam_2024-01-01_00-00-00.mp4`),
//! so lexicographic order is chronological order.

use std::io;
use std::path::Path;
use std::time::SystemTime;

use crate::protocol::RecordingInfo;

/// List regular files in `dir`, sorted by filename.
///
/// A missing directory lists as empty.
pub fn list(dir: &Path) -> io::Result<Vec<RecordingInfo>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut recordings = Vec::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| {
                chrono::DateTime::from_timestamp(d.as_secs() as i64, 0)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        recordings.push(RecordingInfo {
            filename: entry.file_name().to_string_lossy().to_string(),
            size: meta.len(),
            modified,
        });
    }

    recordings.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(recordings)
}

/// Lexicographically last filename in `dir`, i.e. the most recent segment.
pub fn newest(dir: &Path) -> io::Result<Option<String>> {
    Ok(list(dir)?.pop().map(|r| r.filename))
}

/// A name is safe to join onto the recording directory when it cannot
/// escape it.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}
