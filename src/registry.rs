use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

use crate::errors::Result;
use crate::output::OutputArtifact;
use crate::transcoder::{FfmpegProcess, TranscodeEvent};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Starting,
    Running,
    Erroring,
    Stopped,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Starting => write!(f, "starting"),
            StreamState::Running => write!(f, "running"),
            StreamState::Erroring => write!(f, "erroring"),
            StreamState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Best-effort throughput numbers, updated by the event recorder and read
/// by status requests without blocking the writer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    pub frames: u64,
    pub fps: f64,
    pub bitrate_kbps: f64,
}

/// The registry's record of one running stream. Exclusively owns the
/// transcoder process and the output artifact; no other component kills or
/// deletes what it does not own.
pub struct StreamHandle {
    pub id: String,
    pub source: String,
    pub output: OutputArtifact,
    pub started_at: DateTime<Utc>,
    events: broadcast::Sender<TranscodeEvent>,
    state: StdRwLock<StreamState>,
    last_error: StdRwLock<Option<String>>,
    last_progress: StdRwLock<Progress>,
    process: Mutex<Option<FfmpegProcess>>,
}

impl StreamHandle {
    pub fn new(id: String, source: String, output: OutputArtifact) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id,
            source,
            output,
            started_at: Utc::now(),
            events,
            state: StdRwLock::new(StreamState::Starting),
            last_error: StdRwLock::new(None),
            last_progress: StdRwLock::new(Progress::default()),
            process: Mutex::new(None),
        }
    }

    pub fn event_sender(&self) -> broadcast::Sender<TranscodeEvent> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscodeEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> StreamState {
        *self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_state(&self, state: StreamState) {
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn record_error(&self, message: String) {
        self.set_state(StreamState::Erroring);
        *self.last_error.write().unwrap_or_else(|p| p.into_inner()) = Some(message);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn record_progress(&self, progress: Progress) {
        *self.last_progress.write().unwrap_or_else(|p| p.into_inner()) = progress;
    }

    pub fn progress(&self) -> Progress {
        *self.last_progress.read().unwrap_or_else(|p| p.into_inner())
    }

    pub async fn attach_process(&self, process: FfmpegProcess) {
        *self.process.lock().await = Some(process);
    }

    /// Kill the owned transcoder process if one is attached. Idempotent; a
    /// handle whose process already ended has nothing to kill.
    pub async fn kill_process(&self) -> Result<()> {
        let process = self.process.lock().await.take();
        match process {
            Some(process) => process.kill().await,
            None => Ok(()),
        }
    }
}

/// Listing entry produced by `snapshot_all`, shaped for diagnostics and
/// external reaper policies.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub id: String,
    pub state: StreamState,
    pub started_at: DateTime<Utc>,
    pub progress: Progress,
}

/// Authoritative map from stream id to its handle. The write-lock critical
/// sections are purely in-memory; subprocess I/O never happens under the
/// map lock.
#[derive(Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, Arc<StreamHandle>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check-then-insert. Exactly one caller wins the creation race
    /// for a given id; everyone else receives the winner's handle with
    /// `created == false`.
    pub async fn get_or_create(
        &self,
        id: &str,
        factory: impl FnOnce() -> StreamHandle,
    ) -> (Arc<StreamHandle>, bool) {
        let mut streams = self.streams.write().await;
        if let Some(existing) = streams.get(id) {
            debug!("Stream '{}' already registered", id);
            return (existing.clone(), false);
        }
        let handle = Arc::new(factory());
        streams.insert(id.to_string(), handle.clone());
        (handle, true)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<StreamHandle>> {
        self.streams.read().await.get(id).cloned()
    }

    /// Remove and return the handle. The caller takes over ownership of the
    /// process and artifact and is responsible for kill-then-cleanup.
    pub async fn remove(&self, id: &str) -> Option<Arc<StreamHandle>> {
        self.streams.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Ordered snapshot for listing. Handles are cloned out under the read
    /// lock; summaries are built after it is released.
    pub async fn snapshot_all(&self) -> Vec<StreamSummary> {
        let handles: Vec<Arc<StreamHandle>> = {
            let streams = self.streams.read().await;
            streams.values().cloned().collect()
        };
        let mut summaries: Vec<StreamSummary> = handles
            .iter()
            .map(|h| StreamSummary {
                id: h.id.clone(),
                state: h.state(),
                started_at: h.started_at,
                progress: h.progress(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}
