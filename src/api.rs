use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::errors::{RelayError, Result};
use crate::output::{sanitize_stream_id, OutputManager};
use crate::registry::{Progress, StreamHandle, StreamRegistry, StreamState};
use crate::transcoder::{FfmpegProcess, TranscodeEvent, TranscodeJob};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<StreamRegistry>,
    pub output: Arc<OutputManager>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let output = OutputManager::new(
            config.transcoder.output_dir.clone(),
            config.transcoder.output_format,
        );
        Self {
            config: Arc::new(config),
            registry: Arc::new(StreamRegistry::new()),
            output: Arc::new(output),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub enum StartOutcome {
    Started {
        output_location: String,
        /// Subscribed before the subprocess spawn, so a push channel that
        /// initiated this start observes every lifecycle event.
        events: tokio::sync::broadcast::Receiver<TranscodeEvent>,
    },
    AlreadyActive {
        output_location: String,
    },
}

/// Idempotent start: the registry's atomic check-then-insert decides the
/// single creation winner; the losing callers get the existing handle's
/// output location. On launch failure the partial artifact and the
/// registry entry are both rolled back.
pub async fn start_stream(state: &AppState, stream_id: &str, source: &str) -> Result<StartOutcome> {
    let id = sanitize_stream_id(stream_id)?;

    let artifact = state.output.prepare(id)?;
    let source_owned = source.to_string();
    let (handle, created) = state
        .registry
        .get_or_create(id, || {
            StreamHandle::new(id.to_string(), source_owned, artifact)
        })
        .await;

    if !created {
        return Ok(StartOutcome::AlreadyActive {
            output_location: handle.output.public_path.clone(),
        });
    }

    let job = TranscodeJob::for_stream(&state.config.transcoder, source, &handle.output);
    // Subscribe before the spawn so no event can slip past the recorder
    // or the initiating push channel
    let recorder_events = handle.subscribe();
    let client_events = handle.subscribe();
    match FfmpegProcess::spawn(job, id, handle.event_sender()).await {
        Ok(process) => {
            handle.attach_process(process).await;
            handle.set_state(StreamState::Running);
            spawn_event_recorder(state.clone(), handle.clone(), recorder_events);
            info!("Stream '{}' started from source '{}'", id, handle.source);
            Ok(StartOutcome::Started {
                output_location: handle.output.public_path.clone(),
                events: client_events,
            })
        }
        Err(e) => {
            error!("Failed to launch transcoder for stream '{}': {}", id, e);
            state.registry.remove(id).await;
            state.output.cleanup(&handle.output);
            Err(e)
        }
    }
}

/// The single teardown path used by the stop endpoint, WebSocket
/// disconnects, natural stream end and process shutdown: remove from the
/// registry, kill the process, then delete the artifact. Kill before
/// delete so a crashed writer cannot recreate files mid-cleanup.
/// Returns false if no such stream was registered.
pub async fn stop_stream(state: &AppState, stream_id: &str) -> bool {
    let Some(handle) = state.registry.remove(stream_id).await else {
        return false;
    };

    handle.set_state(StreamState::Stopped);
    match handle.kill_process().await {
        Ok(()) => {}
        Err(RelayError::KillTimeout { waited_secs }) => {
            // Entry is already removed; the process is treated as abandoned
            warn!(
                "Transcoder for stream '{}' did not terminate within {}s, abandoning",
                stream_id, waited_secs
            );
        }
        Err(e) => {
            warn!("Error killing transcoder for stream '{}': {}", stream_id, e);
        }
    }
    state.output.cleanup(&handle.output);
    info!("Stream '{}' stopped", stream_id);
    true
}

/// Stop every active stream; used by the shutdown signal handler.
pub async fn shutdown_all(state: &AppState) {
    let summaries = state.registry.snapshot_all().await;
    for summary in summaries {
        info!("Shutting down stream '{}'", summary.id);
        stop_stream(state, &summary.id).await;
    }
}

/// Records wrapper events onto the handle so the next status poll sees
/// them. A clean end tears the stream down entirely; an error leaves the
/// handle registered in Erroring until an explicit stop frees the id.
fn spawn_event_recorder(
    state: AppState,
    handle: Arc<StreamHandle>,
    mut events: tokio::sync::broadcast::Receiver<TranscodeEvent>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TranscodeEvent::Started) => handle.set_state(StreamState::Running),
                Ok(TranscodeEvent::Progress {
                    frames,
                    fps,
                    bitrate_kbps,
                }) => {
                    handle.record_progress(Progress {
                        frames,
                        fps,
                        bitrate_kbps,
                    });
                }
                Ok(TranscodeEvent::Errored { message, detail }) => {
                    // Keep the stderr tail attached so stream-status shows
                    // what the transcoder actually printed before dying
                    let message = match detail {
                        Some(detail) => format!("{} ({})", message, detail),
                        None => message,
                    };
                    handle.record_error(message);
                    break;
                }
                Ok(TranscodeEvent::Ended) => {
                    info!("Stream '{}' ended, cleaning up", handle.id);
                    stop_stream(&state, &handle.id).await;
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event recorder for stream '{}' lagged by {}", handle.id, skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

// ---- Response payloads ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub active: bool,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub output_location: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_streams: usize,
    pub uptime_secs: i64,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEntry {
    pub id: String,
    pub state: String,
    pub started_at: String,
    pub frames: u64,
    pub fps: f64,
    pub bitrate_kbps: f64,
}

/// Status computed from registry presence plus the readiness probe.
pub async fn stream_status(state: &AppState, stream_id: &str) -> Result<StatusResponse> {
    let id = sanitize_stream_id(stream_id)?;
    match state.registry.get(id).await {
        Some(handle) => Ok(StatusResponse {
            active: true,
            ready: state.output.is_ready(&handle.output),
            state: Some(handle.state().to_string()),
            error: handle.last_error(),
            output_location: Some(handle.output.public_path.clone()),
        }),
        None => Ok(StatusResponse {
            active: false,
            ready: false,
            state: None,
            error: None,
            output_location: None,
        }),
    }
}

pub async fn health(state: &AppState) -> HealthResponse {
    let now = Utc::now();
    HealthResponse {
        status: "OK",
        active_streams: state.registry.len().await,
        uptime_secs: (now - state.started_at).num_seconds(),
        timestamp: now.to_rfc3339(),
    }
}

pub async fn list_streams(state: &AppState) -> Vec<StreamEntry> {
    state
        .registry
        .snapshot_all()
        .await
        .into_iter()
        .map(|s| StreamEntry {
            id: s.id,
            state: s.state.to_string(),
            started_at: s.started_at.to_rfc3339(),
            frames: s.progress.frames,
            fps: s.progress.fps,
            bitrate_kbps: s.progress.bitrate_kbps,
        })
        .collect()
}

// ---- Axum handlers ----

pub async fn start_stream_handler(
    Path(stream_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let Some(source) = params.get("source").filter(|s| !s.trim().is_empty()) else {
        let body = StartResponse {
            success: false,
            already_active: None,
            output_location: None,
            error: Some("source query parameter is required".to_string()),
        };
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    };

    match start_stream(&state, &stream_id, source).await {
        Ok(StartOutcome::Started {
            output_location, ..
        }) => Json(StartResponse {
            success: true,
            already_active: None,
            output_location: Some(output_location),
            error: None,
        })
        .into_response(),
        Ok(StartOutcome::AlreadyActive { output_location }) => Json(StartResponse {
            success: true,
            already_active: Some(true),
            output_location: Some(output_location),
            error: None,
        })
        .into_response(),
        Err(e) => {
            let status = match e {
                RelayError::InvalidStreamId { .. } => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let body = StartResponse {
                success: false,
                already_active: None,
                output_location: None,
                error: Some(e.to_string()),
            };
            (status, Json(body)).into_response()
        }
    }
}

pub async fn stop_stream_handler(
    Path(stream_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    // Stopping an unknown id is benign; the caller only learns it was
    // already gone.
    if stop_stream(&state, &stream_id).await {
        Json(StopResponse {
            success: true,
            message: None,
        })
        .into_response()
    } else {
        Json(StopResponse {
            success: false,
            message: Some("not found".to_string()),
        })
        .into_response()
    }
}

pub async fn stream_status_handler(
    Path(stream_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match stream_status(&state, &stream_id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(StartResponse {
                success: false,
                already_active: None,
                output_location: None,
                error: Some(e.to_string()),
            }),
        )
            .into_response(),
    }
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health(&state).await)
}

pub async fn list_streams_handler(State(state): State<AppState>) -> Json<Vec<StreamEntry>> {
    Json(list_streams(&state).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TranscoderConfig;
    use std::time::Duration;

    /// Build a state whose "transcoder" is a harmless system binary. The
    /// binary rejects the ffmpeg arguments and exits quickly, which is
    /// enough to exercise the registry and teardown paths without ffmpeg
    /// installed.
    fn test_state(root: &std::path::Path, binary: &str, probe_ms: u64) -> AppState {
        let mut config = Config::default();
        config.transcoder = TranscoderConfig {
            ffmpeg_candidates: vec![binary.to_string()],
            output_dir: root.to_string_lossy().into_owned(),
            spawn_probe_ms: probe_ms,
            kill_timeout_secs: 2,
            ..Default::default()
        };
        AppState::new(config)
    }

    async fn wait_for_state(state: &AppState, id: &str, wanted: StreamState) -> bool {
        for _ in 0..100 {
            if let Some(handle) = state.registry.get(id).await {
                if handle.state() == wanted {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), "/bin/sleep", 0);

        let first = start_stream(&state, "cam1", "rtsp://host/stream")
            .await
            .unwrap();
        let StartOutcome::Started {
            output_location, ..
        } = first
        else {
            panic!("expected fresh start");
        };

        let second = start_stream(&state, "cam1", "rtsp://host/stream")
            .await
            .unwrap();
        let StartOutcome::AlreadyActive {
            output_location: second_location,
        } = second
        else {
            panic!("expected alreadyActive on second start");
        };

        assert_eq!(output_location, second_location);
        assert_eq!(state.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_launch_failure_rolls_back_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        // /bin/false exits inside the probe window, so the launch fails
        let state = test_state(tmp.path(), "/bin/false", 400);

        let err = start_stream(&state, "cam2", "bad://source").await.unwrap_err();
        assert!(matches!(err, RelayError::Launch { .. }));

        assert_eq!(state.registry.len().await, 0);
        assert!(!tmp.path().join("cam2").exists());

        let status = stream_status(&state, "cam2").await.unwrap();
        assert!(!status.active);
        assert!(!status.ready);
    }

    #[tokio::test]
    async fn test_stop_unknown_stream_is_benign() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), "/bin/sleep", 0);
        assert!(!stop_stream(&state, "nope").await);
    }

    #[tokio::test]
    async fn test_stop_removes_entry_and_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), "/bin/sleep", 0);

        start_stream(&state, "cam3", "rtsp://host/stream")
            .await
            .unwrap();
        assert!(tmp.path().join("cam3").is_dir());

        assert!(stop_stream(&state, "cam3").await);

        let status = stream_status(&state, "cam3").await.unwrap();
        assert!(!status.active);
        assert!(!status.ready);
        assert!(!tmp.path().join("cam3").exists());
    }

    #[tokio::test]
    async fn test_status_reports_readiness() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), "/bin/sleep", 0);

        start_stream(&state, "cam4", "rtsp://host/stream")
            .await
            .unwrap();

        let status = stream_status(&state, "cam4").await.unwrap();
        assert!(status.active);
        assert!(!status.ready);

        // Simulate the transcoder writing its first playlist
        std::fs::write(tmp.path().join("cam4").join("index.m3u8"), b"#EXTM3U\n").unwrap();

        let status = stream_status(&state, "cam4").await.unwrap();
        assert!(status.active);
        assert!(status.ready);
        assert_eq!(status.output_location.as_deref(), Some("/hls/cam4/index.m3u8"));
    }

    #[tokio::test]
    async fn test_early_subprocess_error_is_observable() {
        let tmp = tempfile::tempdir().unwrap();
        // Probe disabled: the exit happens after a "successful" start and
        // must surface through status instead
        let state = test_state(tmp.path(), "/bin/false", 0);

        start_stream(&state, "cam5", "rtsp://host/stream")
            .await
            .unwrap();

        assert!(wait_for_state(&state, "cam5", StreamState::Erroring).await);
        let status = stream_status(&state, "cam5").await.unwrap();
        assert!(status.active);
        assert_eq!(status.state.as_deref(), Some("erroring"));
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_recorder_keeps_stderr_tail_with_error() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), "/bin/sleep", 0);

        let artifact = state.output.prepare("cam11").unwrap();
        let handle = Arc::new(StreamHandle::new(
            "cam11".to_string(),
            "rtsp://host/a".to_string(),
            artifact,
        ));
        let events = handle.subscribe();
        spawn_event_recorder(state.clone(), handle.clone(), events);

        handle
            .event_sender()
            .send(TranscodeEvent::Errored {
                message: "transcoder exited with exit status: 1".to_string(),
                detail: Some("Connection refused".to_string()),
            })
            .unwrap();

        for _ in 0..100 {
            if handle.last_error().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let error = handle.last_error().expect("error never recorded");
        assert!(error.contains("exit status"));
        assert!(error.contains("Connection refused"));
        assert_eq!(handle.state(), StreamState::Erroring);
    }

    #[tokio::test]
    async fn test_independent_streams_do_not_interfere() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), "/bin/sleep", 0);

        start_stream(&state, "cam6", "rtsp://host/a").await.unwrap();
        start_stream(&state, "cam7", "rtsp://host/b").await.unwrap();
        assert_eq!(state.registry.len().await, 2);

        assert!(stop_stream(&state, "cam6").await);

        assert!(state.registry.get("cam7").await.is_some());
        assert!(!tmp.path().join("cam6").exists());
        assert!(tmp.path().join("cam7").is_dir());
    }

    #[tokio::test]
    async fn test_invalid_stream_id_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), "/bin/sleep", 0);

        let err = start_stream(&state, "../escape", "rtsp://host/a")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidStreamId { .. }));
    }

    #[tokio::test]
    async fn test_health_counts_active_streams() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), "/bin/sleep", 0);

        let report = health(&state).await;
        assert_eq!(report.status, "OK");
        assert_eq!(report.active_streams, 0);

        start_stream(&state, "cam8", "rtsp://host/a").await.unwrap();
        let report = health(&state).await;
        assert_eq!(report.active_streams, 1);

        let entries = list_streams(&state).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "cam8");
    }

    #[tokio::test]
    async fn test_shutdown_all_clears_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), "/bin/sleep", 0);

        start_stream(&state, "cam9", "rtsp://host/a").await.unwrap();
        start_stream(&state, "cam10", "rtsp://host/b").await.unwrap();

        shutdown_all(&state).await;
        assert_eq!(state.registry.len().await, 0);
        assert!(!tmp.path().join("cam9").exists());
        assert!(!tmp.path().join("cam10").exists());
    }
}
