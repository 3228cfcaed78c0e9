//! Progress events, ETA estimation and fan-out to observers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::{Artifact, JobId, JobStatus};

/// Frames considered by the moving-average ETA.
pub const ETA_WINDOW: usize = 32;

/// A per-frame report from a running pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct FrameProgress {
    pub frame_number: u64,
    pub frames_done: u64,
    pub frames_total: Option<u64>,
    pub eta_seconds: Option<f64>,
    /// Text rendering of the frame, for live previews
    pub text: String,
    pub timestamp: f64,
    /// Artifacts persisted for this frame
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressKind {
    Frame(FrameProgress),
    Status { status: JobStatus, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    #[serde(flatten)]
    pub kind: ProgressKind,
}

impl ProgressEvent {
    pub fn frame(job_id: JobId, progress: FrameProgress) -> Self {
        Self {
            job_id,
            kind: ProgressKind::Frame(progress),
        }
    }

    pub fn status(job_id: JobId, status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            job_id,
            kind: ProgressKind::Status {
                status,
                message: message.into(),
            },
        }
    }
}

/// Receiver of progress events. Publishing must not block the pipeline.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Moving-window mean of per-frame durations times the frames remaining.
#[derive(Debug)]
pub struct EtaEstimator {
    window: VecDeque<Duration>,
    last: Instant,
}

impl Default for EtaEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl EtaEstimator {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(ETA_WINDOW),
            last: Instant::now(),
        }
    }

    /// Note that one frame just finished.
    pub fn tick(&mut self) {
        let now = Instant::now();
        self.push(now.duration_since(self.last));
        self.last = now;
    }

    fn push(&mut self, elapsed: Duration) {
        if self.window.len() == ETA_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(elapsed);
    }

    /// Seconds remaining, unknown without a total or any timing sample.
    pub fn estimate(&self, frames_done: u64, frames_total: Option<u64>) -> Option<f64> {
        let total = frames_total?;
        if self.window.is_empty() {
            return None;
        }
        let mean = self.window.iter().map(Duration::as_secs_f64).sum::<f64>() / self.window.len() as f64;
        Some(mean * total.saturating_sub(frames_done) as f64)
    }
}

/// Broadcast hub: every subscriber sees every event published after it subscribed.
/// Slow subscribers lose the oldest events instead of stalling publishers.
#[derive(Debug, Clone)]
pub struct ProgressHub {
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl ProgressSink for ProgressHub {
    fn publish(&self, event: ProgressEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

/// Sink that keeps everything it receives. Handy for tests and embedding.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ProgressSink for RecordingSink {
    fn publish(&self, event: ProgressEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eta_unknown_without_total_or_samples() {
        let mut eta = EtaEstimator::new();
        assert_eq!(eta.estimate(0, Some(10)), None);
        eta.push(Duration::from_millis(100));
        assert_eq!(eta.estimate(1, None), None);
    }

    #[test]
    fn test_eta_uses_window_mean() {
        let mut eta = EtaEstimator::new();
        eta.push(Duration::from_millis(100));
        eta.push(Duration::from_millis(300));
        let secs = eta.estimate(2, Some(12)).unwrap();
        assert!((secs - 2.0).abs() < 1e-9);
        assert_eq!(eta.estimate(12, Some(12)), Some(0.0));
    }

    #[test]
    fn test_eta_window_drops_old_samples() {
        let mut eta = EtaEstimator::new();
        eta.push(Duration::from_secs(100));
        for _ in 0..ETA_WINDOW {
            eta.push(Duration::from_secs(1));
        }
        let secs = eta.estimate(0, Some(1)).unwrap();
        assert!((secs - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_hub_fans_out_to_all_subscribers() {
        let hub = ProgressHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        let id: JobId = "6f2b8f9e-3c1a-4d6b-9a57-0c1f2e3d4b5a".parse().unwrap();
        hub.publish(ProgressEvent::status(id, JobStatus::Processing, "Processing"));
        for rx in [&mut a, &mut b] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.job_id, id);
            assert!(matches!(event.kind, ProgressKind::Status { status: JobStatus::Processing, .. }));
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let hub = ProgressHub::new(1);
        let id: JobId = "6f2b8f9e-3c1a-4d6b-9a57-0c1f2e3d4b5a".parse().unwrap();
        hub.publish(ProgressEvent::status(id, JobStatus::Queued, "Queued"));
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        let id: JobId = "6f2b8f9e-3c1a-4d6b-9a57-0c1f2e3d4b5a".parse().unwrap();
        sink.publish(ProgressEvent::status(id, JobStatus::Queued, "a"));
        sink.publish(ProgressEvent::status(id, JobStatus::Processing, "b"));
        let messages: Vec<String> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e.kind {
                ProgressKind::Status { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(messages, ["a", "b"]);
    }
}
