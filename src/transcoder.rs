use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{OutputFormat, TranscoderConfig};
use crate::errors::{RelayError, Result};
use crate::output::OutputArtifact;

const STDERR_TAIL_LINES: usize = 10;

/// Closed set of lifecycle events emitted by a transcoding subprocess.
#[derive(Debug, Clone)]
pub enum TranscodeEvent {
    Started,
    Progress {
        frames: u64,
        fps: f64,
        bitrate_kbps: f64,
    },
    Errored {
        message: String,
        detail: Option<String>,
    },
    Ended,
}

/// A fully built subprocess invocation, ready to spawn.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub binary: String,
    pub args: Vec<String>,
    pub spawn_probe: Duration,
    pub kill_timeout: Duration,
    pub progress_frames: u64,
}

impl TranscodeJob {
    /// Build the invocation for the configured output format.
    pub fn for_stream(config: &TranscoderConfig, source: &str, artifact: &OutputArtifact) -> Self {
        match config.output_format {
            OutputFormat::Hls => Self::hls(config, source, artifact),
            OutputFormat::FragmentedMp4 => Self::fragmented_mp4(config, source, artifact),
        }
    }

    /// RTSP in, segmented playlist out. Old segments are deleted by ffmpeg
    /// itself (delete_segments), the playlist keeps a bounded window.
    pub fn hls(config: &TranscoderConfig, source: &str, artifact: &OutputArtifact) -> Self {
        let segment_pattern = artifact.dir.join("segment_%03d.ts");
        let args = vec![
            "-hide_banner".to_string(),
            "-rtsp_transport".to_string(),
            config.transport.clone(),
            "-timeout".to_string(),
            config.connect_timeout_us.to_string(),
            "-i".to_string(),
            source.to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-ac".to_string(),
            "1".to_string(),
            "-profile:v".to_string(),
            "baseline".to_string(),
            "-maxrate".to_string(),
            config.max_bitrate.clone(),
            "-bufsize".to_string(),
            "1835k".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-hls_flags".to_string(),
            "delete_segments+append_list".to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            config.segment_seconds.to_string(),
            "-hls_list_size".to_string(),
            config.playlist_size.to_string(),
            "-hls_segment_filename".to_string(),
            segment_pattern.to_string_lossy().into_owned(),
            artifact.manifest.to_string_lossy().into_owned(),
        ];
        Self::from_config(config, args)
    }

    /// RTSP in, progressively written fragmented MP4 out, tuned for low
    /// latency playback over a socket session.
    pub fn fragmented_mp4(
        config: &TranscoderConfig,
        source: &str,
        artifact: &OutputArtifact,
    ) -> Self {
        let args = vec![
            "-hide_banner".to_string(),
            "-rtsp_transport".to_string(),
            config.transport.clone(),
            "-timeout".to_string(),
            config.connect_timeout_us.to_string(),
            "-fflags".to_string(),
            "+genpts+discardcorrupt".to_string(),
            "-avoid_negative_ts".to_string(),
            "make_zero".to_string(),
            "-i".to_string(),
            source.to_string(),
            "-f".to_string(),
            "mp4".to_string(),
            "-movflags".to_string(),
            "frag_keyframe+empty_moov".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "ultrafast".to_string(),
            "-tune".to_string(),
            "zerolatency".to_string(),
            "-profile:v".to_string(),
            "baseline".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-maxrate".to_string(),
            config.max_bitrate.clone(),
            "-bufsize".to_string(),
            "2000k".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            artifact.manifest.to_string_lossy().into_owned(),
        ];
        Self::from_config(config, args)
    }

    fn from_config(config: &TranscoderConfig, args: Vec<String>) -> Self {
        Self {
            binary: config.resolve_ffmpeg_path(),
            args,
            spawn_probe: Duration::from_millis(config.spawn_probe_ms),
            kill_timeout: Duration::from_secs(config.kill_timeout_secs),
            progress_frames: config.progress_frames.max(1),
        }
    }
}

/// Owns one running transcoder subprocess. The stderr reader task parses
/// progress lines and publishes lifecycle events; `kill` is idempotent
/// with a bounded wait.
#[derive(Debug)]
pub struct FfmpegProcess {
    stream_id: String,
    child: Arc<Mutex<Option<Child>>>,
    kill_timeout: Duration,
}

impl FfmpegProcess {
    /// Spawn the job and confirm the launch. The process is watched for
    /// `spawn_probe`; if it exits inside that window the launch failed and
    /// the stderr tail is reported. Does not wait for output readiness.
    pub async fn spawn(
        job: TranscodeJob,
        stream_id: &str,
        events: broadcast::Sender<TranscodeEvent>,
    ) -> Result<Self> {
        debug!(
            "Spawning transcoder for stream '{}': {} {}",
            stream_id,
            job.binary,
            job.args.join(" ")
        );

        let mut child = Command::new(&job.binary)
            .args(&job.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RelayError::launch(format!("failed to spawn '{}': {}", job.binary, e))
            })?;

        let stderr = child.stderr.take().ok_or_else(|| {
            RelayError::launch("failed to capture transcoder stderr".to_string())
        })?;

        let child = Arc::new(Mutex::new(Some(child)));
        let (exit_tx, mut exit_rx) = watch::channel(false);
        let stderr_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        // Sent before the monitor task exists so Started always precedes
        // Progress/Errored/Ended for subscribers attached at spawn time.
        let _ = events.send(TranscodeEvent::Started);

        spawn_monitor_task(
            stream_id.to_string(),
            stderr,
            child.clone(),
            events.clone(),
            exit_tx,
            stderr_tail.clone(),
            job.progress_frames,
        );

        // Launch confirmation: an exit inside the probe window means the
        // transcoder never got going (missing protocol, unreachable source).
        if !job.spawn_probe.is_zero() {
            let probe = tokio::time::timeout(job.spawn_probe, exit_rx.wait_for(|exited| *exited));
            if probe.await.is_ok() {
                let detail = tail_to_string(&stderr_tail);
                return Err(RelayError::launch(format!(
                    "transcoder exited during startup{}",
                    detail.map(|d| format!(": {}", d)).unwrap_or_default()
                )));
            }
        }

        info!("Transcoder process started for stream '{}'", stream_id);

        Ok(Self {
            stream_id: stream_id.to_string(),
            child,
            kill_timeout: job.kill_timeout,
        })
    }

    /// Forcefully terminate the subprocess. Killing an already-dead process
    /// is a no-op. Returns `KillTimeout` if the process is still alive after
    /// the bounded wait; the caller may treat it as abandoned.
    pub async fn kill(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        let Some(mut child) = slot.take() else {
            debug!("kill() on stream '{}': process already gone", self.stream_id);
            return Ok(());
        };

        if let Err(e) = child.start_kill() {
            // Already reaped between take and kill
            debug!("start_kill for stream '{}' returned: {}", self.stream_id, e);
            return Ok(());
        }

        match tokio::time::timeout(self.kill_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(
                    "Transcoder for stream '{}' terminated ({})",
                    self.stream_id, status
                );
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Error reaping transcoder for stream '{}': {}", self.stream_id, e);
                Ok(())
            }
            Err(_) => Err(RelayError::KillTimeout {
                waited_secs: self.kill_timeout.as_secs(),
            }),
        }
    }
}

fn spawn_monitor_task(
    stream_id: String,
    stderr: tokio::process::ChildStderr,
    child: Arc<Mutex<Option<Child>>>,
    events: broadcast::Sender<TranscodeEvent>,
    exit_tx: watch::Sender<bool>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    progress_frames: u64,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut last_emitted_frames = 0u64;

        while let Ok(Some(line)) = lines.next_line().await {
            {
                let mut tail = stderr_tail.lock().unwrap_or_else(|p| p.into_inner());
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.clone());
            }

            if let Some((frames, fps, bitrate_kbps)) = parse_progress(&line) {
                // Rate-limited so a 30fps stream does not flood subscribers
                if frames >= last_emitted_frames + progress_frames {
                    last_emitted_frames = frames;
                    let _ = events.send(TranscodeEvent::Progress {
                        frames,
                        fps,
                        bitrate_kbps,
                    });
                }
            }
        }

        // stderr EOF: the process exited or was killed. If kill() already
        // took the child, the teardown path owns reporting and no event is
        // emitted here.
        let mut slot = child.lock().await;
        if let Some(mut child) = slot.take() {
            match child.wait().await {
                Ok(status) if status.success() => {
                    info!("Transcoder for stream '{}' ended", stream_id);
                    let _ = events.send(TranscodeEvent::Ended);
                }
                Ok(status) => {
                    let detail = tail_to_string(&stderr_tail);
                    error!(
                        "Transcoder for stream '{}' exited with {}: {}",
                        stream_id,
                        status,
                        detail.as_deref().unwrap_or("<no stderr>")
                    );
                    let _ = events.send(TranscodeEvent::Errored {
                        message: format!("transcoder exited with {}", status),
                        detail,
                    });
                }
                Err(e) => {
                    error!("Failed to reap transcoder for stream '{}': {}", stream_id, e);
                    let _ = events.send(TranscodeEvent::Errored {
                        message: format!("failed to reap transcoder: {}", e),
                        detail: None,
                    });
                }
            }
        }
        drop(slot);
        let _ = exit_tx.send(true);
    });
}

fn tail_to_string(tail: &Arc<StdMutex<VecDeque<String>>>) -> Option<String> {
    let tail = tail.lock().unwrap_or_else(|p| p.into_inner());
    if tail.is_empty() {
        None
    } else {
        Some(tail.iter().cloned().collect::<Vec<_>>().join(" | "))
    }
}

/// Parse an ffmpeg stderr status line such as
/// `frame=  123 fps= 25 q=28.0 size=256kB time=00:00:05.00 bitrate= 400.2kbits/s`.
pub fn parse_progress(line: &str) -> Option<(u64, f64, f64)> {
    if !line.contains("frame=") {
        return None;
    }
    // ffmpeg pads values after '=', collapse that so key=value splits cleanly
    let mut normalized = line.to_string();
    while normalized.contains("= ") {
        normalized = normalized.replace("= ", "=");
    }

    let mut frames = None;
    let mut fps = 0.0f64;
    let mut bitrate_kbps = 0.0f64;
    for token in normalized.split_whitespace() {
        if let Some(value) = token.strip_prefix("frame=") {
            frames = value.parse::<u64>().ok();
        } else if let Some(value) = token.strip_prefix("fps=") {
            fps = value.parse::<f64>().unwrap_or(0.0);
        } else if let Some(value) = token.strip_prefix("bitrate=") {
            let digits = value.trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.');
            bitrate_kbps = digits.parse::<f64>().unwrap_or(0.0);
        }
    }
    frames.map(|frames| (frames, fps, bitrate_kbps))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job(binary: &str, args: &[&str], probe_ms: u64) -> TranscodeJob {
        TranscodeJob {
            binary: binary.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            spawn_probe: Duration::from_millis(probe_ms),
            kill_timeout: Duration::from_secs(2),
            progress_frames: 1,
        }
    }

    #[test]
    fn test_parse_progress() {
        let line = "frame=  123 fps= 25 q=28.0 size=     256kB time=00:00:05.00 bitrate= 400.2kbits/s speed=1.01x";
        let (frames, fps, bitrate) = parse_progress(line).unwrap();
        assert_eq!(frames, 123);
        assert_eq!(fps, 25.0);
        assert_eq!(bitrate, 400.2);

        assert!(parse_progress("Input #0, rtsp, from 'rtsp://x'").is_none());
        assert!(parse_progress("").is_none());

        // Unparsable sub-fields degrade to zero rather than dropping the line
        let (frames, fps, bitrate) = parse_progress("frame=7 fps=N/A bitrate=N/A").unwrap();
        assert_eq!(frames, 7);
        assert_eq!(fps, 0.0);
        assert_eq!(bitrate, 0.0);
    }

    #[test]
    fn test_hls_job_args() {
        let tmp = tempfile::tempdir().unwrap();
        let manager =
            crate::output::OutputManager::new(tmp.path(), crate::config::OutputFormat::Hls);
        let artifact = manager.prepare("cam1").unwrap();
        let config = TranscoderConfig::default();
        let job = TranscodeJob::hls(&config, "rtsp://host/stream", &artifact);

        assert!(job.args.iter().any(|a| a == "rtsp://host/stream"));
        assert!(job.args.iter().any(|a| a == "hls"));
        assert!(job.args.iter().any(|a| a == "-hls_time"));
        assert!(job.args.last().unwrap().ends_with("index.m3u8"));
        assert!(job.args.iter().any(|a| a.ends_with("segment_%03d.ts")));
    }

    #[test]
    fn test_fmp4_job_args() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = crate::output::OutputManager::new(
            tmp.path(),
            crate::config::OutputFormat::FragmentedMp4,
        );
        let artifact = manager.prepare("cam1").unwrap();
        let config = TranscoderConfig {
            output_format: crate::config::OutputFormat::FragmentedMp4,
            ..Default::default()
        };
        let job = TranscodeJob::for_stream(&config, "rtsp://host/stream", &artifact);

        assert!(job.args.iter().any(|a| a == "frag_keyframe+empty_moov"));
        assert!(job.args.last().unwrap().ends_with("stream.mp4"));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_launch_error() {
        let (events, _) = broadcast::channel(16);
        let job = test_job("/definitely/not/a/real/binary", &[], 0);
        let err = FfmpegProcess::spawn(job, "t1", events).await.unwrap_err();
        assert!(matches!(err, RelayError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_spawn_early_exit_fails_probe() {
        let (events, _) = broadcast::channel(16);
        let job = test_job("sh", &["-c", "echo boom >&2; exit 1"], 500);
        let err = FfmpegProcess::spawn(job, "t2", events).await.unwrap_err();
        match err {
            RelayError::Launch { message } => assert!(message.contains("boom")),
            other => panic!("expected Launch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (events, _) = broadcast::channel(16);
        let job = test_job("sleep", &["30"], 50);
        let process = FfmpegProcess::spawn(job, "t3", events).await.unwrap();
        process.kill().await.unwrap();
        // Killing an already-dead process is a no-op
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_events_on_clean_exit() {
        let (events, mut rx) = broadcast::channel(16);
        let job = test_job("sh", &["-c", "exit 0"], 0);
        let _process = FfmpegProcess::spawn(job, "t4", events).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, TranscodeEvent::Started));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, TranscodeEvent::Ended));
    }

    #[tokio::test]
    async fn test_events_on_nonzero_exit() {
        let (events, mut rx) = broadcast::channel(16);
        let job = test_job("sh", &["-c", "echo pipeline stalled >&2; exit 3"], 0);
        let _process = FfmpegProcess::spawn(job, "t5", events).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, TranscodeEvent::Started));
        match rx.recv().await.unwrap() {
            TranscodeEvent::Errored { message, detail } => {
                assert!(message.contains("exited"));
                // The stderr tail travels with the event
                assert!(detail.unwrap().contains("pipeline stalled"));
            }
            other => panic!("expected Errored, got {:?}", other),
        }
    }
}
