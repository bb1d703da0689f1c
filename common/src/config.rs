//! Configuration parsing – reads a KEY=VALUE file (`camwatch.conf`) and
//! lets environment variables with the same keys override it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Keys recognised in the config file and the environment.
const KEYS: &[&str] = &[
    "SOURCE_URL",
    "RTSP_TRANSPORT",
    "RECORDINGS_DIR",
    "RECORDING_PREFIX",
    "SEGMENT_SECS",
    "WATCHDOG_INTERVAL_SECS",
    "JPEG_QUALITY",
    "LISTEN_ADDR",
    "FRAME_WIDTH",
    "FRAME_HEIGHT",
    "OPEN_TIMEOUT_SECS",
    "OPEN_RETRY_MS",
    "RECONNECT_DELAY_MS",
    "RETRY_JITTER_MS",
    "RESTART_PAUSE_MS",
    "MAX_VIEWERS",
    "FFMPEG_BIN",
];

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── source ───────────────────────────────────────────────────────
    /// Camera URL with any `?tcp` / `?udp` transport hint stripped.
    pub source_url: String,
    /// RTSP lower transport handed to ffmpeg (`tcp` or `udp`).
    pub rtsp_transport: String,
    pub ffmpeg_bin: String,

    // ── live view ────────────────────────────────────────────────────
    pub frame_width: u32,
    pub frame_height: u32,
    pub jpeg_quality: u8,
    pub open_timeout_secs: u64,
    pub open_retry_ms: u64,
    pub reconnect_delay_ms: u64,
    pub retry_jitter_ms: u64,
    /// Concurrent `/video` viewers allowed; 0 means unlimited.
    pub max_viewers: usize,

    // ── recording ────────────────────────────────────────────────────
    pub recordings_dir: PathBuf,
    pub recording_prefix: String,
    pub segment_secs: u32,
    pub watchdog_interval_secs: u64,
    pub restart_pause_ms: u64,

    // ── network ──────────────────────────────────────────────────────
    pub listen_addr: String,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/camwatch/camwatch.conf"
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn open_retry_delay(&self) -> Duration {
        Duration::from_millis(self.open_retry_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// Parse a `KEY=VALUE` configuration file, then apply environment
/// overrides.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let mut map = parse_conf(&text);
    info!("Loaded config from {}", path.display());

    apply_env(&mut map, std::env::vars());
    Ok(from_map(&map))
}

/// Load the default config file if it exists, otherwise start from
/// built-in defaults.  Environment overrides apply either way.
pub fn load_default() -> Result<Config> {
    let path = Path::new(Config::default_path());
    if path.exists() {
        return load(path);
    }

    info!("No config at {}, using defaults", path.display());
    let mut map = HashMap::new();
    apply_env(&mut map, std::env::vars());
    Ok(from_map(&map))
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|s| !s.is_empty()) };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    // Zero is not a usable value for these; fall back to the default.
    let get_nonzero_u32 = |key: &str, default: u32| -> u32 {
        get(key)
            .and_then(|v| v.parse().ok())
            .filter(|&v| v > 0)
            .unwrap_or(default)
    };

    let raw_url =
        get("SOURCE_URL").unwrap_or_else(|| "rtsp://192.168.2.224:554/stream1?tcp".into());
    let (source_url, hinted_transport) = split_transport_hint(&raw_url);
    let rtsp_transport = get("RTSP_TRANSPORT")
        .or(hinted_transport)
        .unwrap_or_else(|| "tcp".into());

    Config {
        source_url,
        rtsp_transport,
        ffmpeg_bin: get("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".into()),

        frame_width: get_nonzero_u32("FRAME_WIDTH", 1280),
        frame_height: get_nonzero_u32("FRAME_HEIGHT", 720),
        jpeg_quality: get("JPEG_QUALITY")
            .and_then(|v| v.parse::<u8>().ok())
            .map(|q| q.clamp(1, 100))
            .unwrap_or(70),
        open_timeout_secs: get_u64("OPEN_TIMEOUT_SECS", 10),
        open_retry_ms: get_u64("OPEN_RETRY_MS", 1000),
        reconnect_delay_ms: get_u64("RECONNECT_DELAY_MS", 200),
        retry_jitter_ms: get_u64("RETRY_JITTER_MS", 0),
        max_viewers: get("MAX_VIEWERS").and_then(|v| v.parse().ok()).unwrap_or(0),

        recordings_dir: PathBuf::from(
            get("RECORDINGS_DIR").unwrap_or_else(|| "/data/recordings".into()),
        ),
        recording_prefix: get("RECORDING_PREFIX").unwrap_or_else(|| "cam".into()),
        segment_secs: get_nonzero_u32("SEGMENT_SECS", 1800),
        watchdog_interval_secs: get_u64("WATCHDOG_INTERVAL_SECS", 5).max(1),
        restart_pause_ms: get_u64("RESTART_PAUSE_MS", 1000),

        listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:5051".into()),
    }
}

/// Overlay recognised keys from `vars` onto `map`.
fn apply_env(map: &mut HashMap<String, String>, vars: impl Iterator<Item = (String, String)>) {
    for (key, val) in vars {
        if KEYS.contains(&key.as_str()) {
            map.insert(key, val);
        }
    }
}

/// Split an OpenCV-style transport hint (`rtsp://host/path?tcp`) off a URL.
///
/// Only a bare `tcp` / `udp` query is treated as a hint; real query strings
/// are left untouched.
pub fn split_transport_hint(url: &str) -> (String, Option<String>) {
    if let Some((base, query)) = url.rsplit_once('?') {
        if query.eq_ignore_ascii_case("tcp") || query.eq_ignore_ascii_case("udp") {
            return (base.to_string(), Some(query.to_ascii_lowercase()));
        }
    }
    (url.to_string(), None)
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conf() {
        let text = r#"
# comment
SOURCE_URL="rtsp://cam1:554/live"
SEGMENT_SECS=600
LISTEN_ADDR=0.0.0.0:9090
"#;
        let map = parse_conf(text);
        assert_eq!(map["SOURCE_URL"], "rtsp://cam1:554/live");
        assert_eq!(map["SEGMENT_SECS"], "600");
        assert_eq!(map["LISTEN_ADDR"], "0.0.0.0:9090");
        assert!(!map.contains_key("# comment"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.source_url, "rtsp://192.168.2.224:554/stream1");
        assert_eq!(config.rtsp_transport, "tcp");
        assert_eq!(config.segment_secs, 1800);
        assert_eq!(config.jpeg_quality, 70);
        assert_eq!(config.listen_addr, "0.0.0.0:5051");
        assert_eq!(config.watchdog_interval(), Duration::from_secs(5));
        assert_eq!(config.open_retry_delay(), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay(), Duration::from_millis(200));
        assert_eq!(config.max_viewers, 0);
    }

    #[test]
    fn test_transport_hint() {
        assert_eq!(
            split_transport_hint("rtsp://h/s?udp"),
            ("rtsp://h/s".to_string(), Some("udp".to_string()))
        );
        assert_eq!(
            split_transport_hint("rtsp://h/s?channel=1"),
            ("rtsp://h/s?channel=1".to_string(), None)
        );
    }

    #[test]
    fn test_explicit_transport_wins_over_hint() {
        let mut map = HashMap::new();
        map.insert("SOURCE_URL".to_string(), "rtsp://h/s?udp".to_string());
        map.insert("RTSP_TRANSPORT".to_string(), "tcp".to_string());
        let config = from_map(&map);
        assert_eq!(config.source_url, "rtsp://h/s");
        assert_eq!(config.rtsp_transport, "tcp");
    }

    #[test]
    fn test_env_overrides_file() {
        let mut map = parse_conf("JPEG_QUALITY=90\nRECORDINGS_DIR=/srv/rec\n");
        let vars = vec![
            ("JPEG_QUALITY".to_string(), "250".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        apply_env(&mut map, vars.into_iter());
        let config = from_map(&map);
        assert_eq!(config.jpeg_quality, 100);
        assert_eq!(config.recordings_dir, PathBuf::from("/srv/rec"));
        assert!(!map.contains_key("HOME"));
    }

    #[test]
    fn test_zero_values_fall_back() {
        let mut map = HashMap::new();
        for key in ["FRAME_WIDTH", "FRAME_HEIGHT", "SEGMENT_SECS", "WATCHDOG_INTERVAL_SECS"] {
            map.insert(key.to_string(), "0".to_string());
        }
        let config = from_map(&map);
        assert_eq!(config.frame_width, 1280);
        assert_eq!(config.frame_height, 720);
        assert_eq!(config.segment_secs, 1800);
        assert_eq!(config.watchdog_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camwatch.conf");
        std::fs::write(&path, "RECORDINGS_DIR=/tmp/test\nMAX_VIEWERS=4\n").unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.max_viewers, 4);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nope.conf")).is_err());
    }
}
