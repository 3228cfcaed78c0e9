//! Job records, lifecycle state machine and artifacts.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{JobError, JobFailure, JobResult};
use crate::params::JobRequest;

/// Unique job identifier. Only `JobManager::submit` mints new ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states accept no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a produced output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    TextFrame,
    ImageFrame,
    Video,
}

/// One persisted output of a job. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    /// Frame index for frame kinds, `None` for the video
    pub sequence_number: Option<u64>,
    /// Storage handle; a filesystem path for the built-in writer
    pub location: PathBuf,
}

/// Ordered artifacts of a single job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    items: Vec<Artifact>,
}

impl ArtifactSet {
    pub fn push(&mut self, artifact: Artifact) {
        self.items.push(artifact);
    }

    pub fn extend(&mut self, artifacts: impl IntoIterator<Item = Artifact>) {
        self.items.extend(artifacts);
    }

    /// Artifacts of one kind, ordered by sequence number.
    pub fn of_kind(&self, kind: ArtifactKind) -> Vec<Artifact> {
        let mut out: Vec<Artifact> = self.items.iter().filter(|a| a.kind == kind).cloned().collect();
        out.sort_by_key(|a| a.sequence_number);
        out
    }

    pub fn count(&self, kind: ArtifactKind) -> usize {
        self.items.iter().filter(|a| a.kind == kind).count()
    }

    pub fn video(&self) -> Option<&Artifact> {
        self.items.iter().find(|a| a.kind == ArtifactKind::Video)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.items.iter()
    }
}

/// A submitted conversion and its lifecycle state.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub request: JobRequest,
    pub status: JobStatus,
    pub frames_total: Option<u64>,
    pub frames_done: u64,
    pub eta_seconds: Option<f64>,
    pub message: String,
    /// Set once a user cancel reached a running pipeline
    pub cancel_requested: bool,
    pub artifacts: ArtifactSet,
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn new(id: JobId, request: JobRequest) -> Self {
        Self {
            id,
            request,
            status: JobStatus::Queued,
            frames_total: None,
            frames_done: 0,
            eta_seconds: None,
            message: "Queued".to_string(),
            cancel_requested: false,
            artifacts: ArtifactSet::default(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Fraction of frames done, in [0, 1]. Zero until the total is known.
    pub fn progress(&self) -> f64 {
        match self.frames_total {
            Some(total) if total > 0 => (self.frames_done as f64 / total as f64).min(1.0),
            _ if self.status == JobStatus::Completed => 1.0,
            _ => 0.0,
        }
    }

    /// Move to `next`, stamping timestamps. Illegal edges are invariant violations.
    pub(crate) fn transition(&mut self, next: JobStatus) -> JobResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::invariant(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        let now = Utc::now();
        match next {
            JobStatus::Processing => self.started_at = Some(now),
            status if status.is_terminal() => {
                self.completed_at = Some(now);
                self.eta_seconds = None;
            }
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Flag a running job as stopping. The message sticks until the job is terminal.
    pub(crate) fn request_cancel(&mut self) {
        self.cancel_requested = true;
        self.message = "Cancellation requested".to_string();
    }

    /// Record progress for one more frame. Reports for terminal jobs are ignored.
    pub(crate) fn record_frame(&mut self, frames_done: u64, frames_total: Option<u64>, eta_seconds: Option<f64>) {
        if self.status != JobStatus::Processing || frames_done < self.frames_done {
            return;
        }
        self.frames_done = frames_done;
        self.frames_total = frames_total.map(|total| total.max(frames_done));
        self.eta_seconds = eta_seconds;
        if self.cancel_requested {
            return;
        }
        self.message = match self.frames_total {
            Some(total) => format!("Processed {}/{} frames", frames_done, total),
            None => format!("Processed {} frames", frames_done),
        };
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            status: self.status,
            progress: self.progress(),
            frames_done: self.frames_done,
            frames_total: self.frames_total,
            eta_seconds: self.eta_seconds,
            message: self.message.clone(),
            error: self.error.clone(),
            text_frames: self.artifacts.count(ArtifactKind::TextFrame),
            image_frames: self.artifacts.count(ArtifactKind::ImageFrame),
            has_video: self.artifacts.video().is_some(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Read-only view of a job served to status pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: f64,
    pub frames_done: u64,
    pub frames_total: Option<u64>,
    pub eta_seconds: Option<f64>,
    pub message: String,
    pub error: Option<JobFailure>,
    pub text_frames: usize,
    pub image_frames: usize,
    pub has_video: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
