use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    #[serde(rename = "hls")]
    Hls,
    #[serde(rename = "fmp4")]
    FragmentedMp4,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Hls
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Hls => write!(f, "hls"),
            OutputFormat::FragmentedMp4 => write!(f, "fmp4"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    pub cors_allow_origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    /// Candidate ffmpeg locations probed in order; first existing wins,
    /// otherwise "ffmpeg" is resolved via PATH.
    #[serde(default)]
    pub ffmpeg_candidates: Vec<String>,

    #[serde(default)]
    pub output_format: OutputFormat,

    /// Root directory for per-stream output artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// RTSP transport passed to ffmpeg (-rtsp_transport).
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Input connection timeout in microseconds (-timeout).
    #[serde(default = "default_connect_timeout_us")]
    pub connect_timeout_us: u64,

    /// HLS segment duration in seconds (-hls_time).
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,

    /// Number of segments retained in the playlist (-hls_list_size).
    #[serde(default = "default_playlist_size")]
    pub playlist_size: u32,

    /// Video bitrate ceiling, ffmpeg syntax (e.g. "400k").
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate: String,

    /// Emit a Progress event at most once per this many frames.
    #[serde(default = "default_progress_frames")]
    pub progress_frames: u64,

    /// How long to watch a freshly spawned process before declaring the
    /// launch confirmed. An exit inside this window is a launch failure.
    #[serde(default = "default_spawn_probe_ms")]
    pub spawn_probe_ms: u64,

    /// Bounded wait for kill() before reporting KillTimeout.
    #[serde(default = "default_kill_timeout_secs")]
    pub kill_timeout_secs: u64,
}

fn default_output_dir() -> String {
    "hls".to_string()
}
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_connect_timeout_us() -> u64 {
    5_000_000
}
fn default_segment_seconds() -> u32 {
    6
}
fn default_playlist_size() -> u32 {
    10
}
fn default_max_bitrate() -> String {
    "400k".to_string()
}
fn default_progress_frames() -> u64 {
    100
}
fn default_spawn_probe_ms() -> u64 {
    500
}
fn default_kill_timeout_secs() -> u64 {
    3
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_candidates: Vec::new(),
            output_format: OutputFormat::default(),
            output_dir: default_output_dir(),
            transport: default_transport(),
            connect_timeout_us: default_connect_timeout_us(),
            segment_seconds: default_segment_seconds(),
            playlist_size: default_playlist_size(),
            max_bitrate: default_max_bitrate(),
            progress_frames: default_progress_frames(),
            spawn_probe_ms: default_spawn_probe_ms(),
            kill_timeout_secs: default_kill_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3002,
                tls: Some(TlsConfig {
                    enabled: false,
                    cert_path: "certs/server.crt".to_string(),
                    key_path: "certs/server.key".to_string(),
                }),
                cors_allow_origin: Some("*".to_string()),
            },
            transcoder: TranscoderConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)
                .map_err(|e| crate::errors::RelayError::config(e.to_string()))?
        };
        Ok(config)
    }
}

impl TranscoderConfig {
    /// Resolve the ffmpeg binary: first existing candidate, else "ffmpeg"
    /// and let PATH lookup decide at spawn time.
    pub fn resolve_ffmpeg_path(&self) -> String {
        for candidate in &self.ffmpeg_candidates {
            if Path::new(candidate).exists() {
                info!("Found ffmpeg at: {}", candidate);
                return candidate.clone();
            }
        }
        "ffmpeg".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 3002);
        assert_eq!(config.transcoder.output_format, OutputFormat::Hls);
        assert_eq!(config.transcoder.segment_seconds, 6);
        assert_eq!(config.transcoder.playlist_size, 10);
    }

    #[test]
    fn test_parse_toml_config() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000

            [transcoder]
            output_format = "fmp4"
            max_bitrate = "1000k"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.transcoder.output_format, OutputFormat::FragmentedMp4);
        assert_eq!(config.transcoder.max_bitrate, "1000k");
        // Unspecified fields fall back to defaults
        assert_eq!(config.transcoder.transport, "tcp");
    }

    #[test]
    fn test_resolve_ffmpeg_falls_back_to_path() {
        let transcoder = TranscoderConfig {
            ffmpeg_candidates: vec!["/definitely/not/here/ffmpeg".to_string()],
            ..Default::default()
        };
        assert_eq!(transcoder.resolve_ffmpeg_path(), "ffmpeg");
    }
}
