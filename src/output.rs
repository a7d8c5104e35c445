use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::OutputFormat;
use crate::errors::{RelayError, Result};

pub const STATIC_PREFIX: &str = "/hls";

/// Validate a caller-supplied stream id before it becomes a path component.
/// Only `[A-Za-z0-9_-]` is accepted, which also rules out separators,
/// `..` traversal and NUL bytes.
pub fn sanitize_stream_id(id: &str) -> Result<&str> {
    if id.is_empty() {
        return Err(RelayError::invalid_stream_id("empty stream id"));
    }
    if id.len() > 128 {
        return Err(RelayError::invalid_stream_id("stream id too long"));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(RelayError::invalid_stream_id(format!(
            "stream id '{}' contains characters outside [A-Za-z0-9_-]",
            id.escape_default()
        )));
    }
    Ok(id)
}

/// Where one stream's output lives on disk and how clients reach it.
#[derive(Debug, Clone)]
pub struct OutputArtifact {
    pub stream_id: String,
    pub dir: PathBuf,
    pub manifest: PathBuf,
    pub public_path: String,
}

/// Manages the on-disk output namespace, partitioned by sanitized stream
/// id. Independent of process state: a stream can be running with no
/// playable output yet.
#[derive(Debug, Clone)]
pub struct OutputManager {
    root: PathBuf,
    format: OutputFormat,
}

impl OutputManager {
    pub fn new(root: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self { root: root.into(), format }
    }

    fn manifest_name(&self) -> &'static str {
        match self.format {
            OutputFormat::Hls => "index.m3u8",
            OutputFormat::FragmentedMp4 => "stream.mp4",
        }
    }

    /// Create the isolated per-stream output directory. The location is
    /// derived deterministically from the sanitized id, so no two streams
    /// can share it.
    pub fn prepare(&self, stream_id: &str) -> Result<OutputArtifact> {
        let id = sanitize_stream_id(stream_id)?;
        let dir = self.root.join(id);
        fs::create_dir_all(&dir)?;
        let manifest = dir.join(self.manifest_name());
        let public_path = format!("{}/{}/{}", STATIC_PREFIX, id, self.manifest_name());
        info!("Prepared output directory for stream '{}': {}", id, dir.display());
        Ok(OutputArtifact {
            stream_id: id.to_string(),
            dir,
            manifest,
            public_path,
        })
    }

    /// Non-blocking readiness probe: the manifest exists and is non-empty.
    /// The transcoder writes the playlist only after the first segment, so
    /// this lags process start by a data-dependent amount.
    pub fn is_ready(&self, artifact: &OutputArtifact) -> bool {
        match fs::metadata(&artifact.manifest) {
            Ok(meta) => meta.is_file() && meta.len() > 0,
            Err(_) => false,
        }
    }

    /// Delete everything under the artifact directory. Best-effort: a stop
    /// request must never hang on a file that cannot be removed.
    pub fn cleanup(&self, artifact: &OutputArtifact) {
        if !artifact.dir.exists() {
            return;
        }
        match fs::remove_dir_all(&artifact.dir) {
            Ok(()) => info!("Removed output directory for stream '{}'", artifact.stream_id),
            Err(e) => warn!(
                "Failed to remove output directory {} for stream '{}': {}",
                artifact.dir.display(),
                artifact.stream_id,
                e
            ),
        }
    }
}
