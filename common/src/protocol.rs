//! Shared HTTP protocol types for the JSON side of the camwatch server.

use serde::{Deserialize, Serialize};

/// Information about a single recording segment on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub filename: String,
    pub size: u64,
    /// ISO-8601 modification timestamp.
    pub modified: String,
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    /// Recorder process is alive.
    pub recording: bool,
    /// Recording was started and not stopped since.
    pub recording_enabled: bool,
    pub viewers: usize,
    /// Viewers whose supervisor currently has a live source connection.
    pub streaming_viewers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_json_shape() {
        let health = HealthResponse {
            status: "ok".to_string(),
            uptime_secs: 12,
            recording: true,
            recording_enabled: true,
            viewers: 2,
            streaming_viewers: 1,
        };
        let value = serde_json::to_value(&health).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["recording"], true);
        assert_eq!(value["viewers"], 2);
        assert_eq!(value["streaming_viewers"], 1);
    }
}
