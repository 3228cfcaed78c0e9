//! Job registry, FIFO scheduling under a concurrency ceiling, timeouts and cleanup.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::artifacts::job_dir;
use crate::compose::load_font;
use crate::config::AppConfig;
use crate::error::{JobError, JobFailure, JobResult};
use crate::job::{Artifact, ArtifactKind, Job, JobId, JobSnapshot, JobStatus};
use crate::mux::{FfmpegMuxer, Muxer};
use crate::params::JobRequest;
use crate::pipeline::{CancelReason, CancellationToken, ConversionPipeline, PipelineEnv, PipelineOutcome, PipelineReport};
use crate::progress::{ProgressEvent, ProgressHub, ProgressKind, ProgressSink};
use crate::source::{FfmpegSourceFactory, SourceFactory};

/// Process-wide counters owned by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub active_jobs: usize,
    pub queued_jobs: usize,
    pub submitted_total: u64,
    pub uptime_secs: u64,
}

#[derive(Default)]
struct Scheduler {
    queue: VecDeque<JobId>,
    running: HashMap<JobId, CancellationToken>,
    /// Every registered job in submission order
    submitted: Vec<JobId>,
}

struct Shared {
    config: AppConfig,
    env: Arc<PipelineEnv>,
    runtime: Handle,
    // Lock order: scheduler before jobs.
    scheduler: Mutex<Scheduler>,
    jobs: RwLock<HashMap<JobId, Job>>,
    hub: ProgressHub,
    terminal: Notify,
    submitted_total: AtomicU64,
    started_at: Instant,
}

impl Shared {
    fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn jobs(&self) -> RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn jobs_mut(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

enum RunResult {
    Finished(Result<PipelineReport, JoinError>),
    Abandoned,
}

/// Feeds pipeline progress into the registry, then out to subscribers.
struct RegistrySink {
    job_id: JobId,
    shared: Arc<Shared>,
}

impl ProgressSink for RegistrySink {
    fn publish(&self, event: ProgressEvent) {
        {
            let mut jobs = self.shared.jobs_mut();
            let Some(job) = jobs.get_mut(&self.job_id) else {
                return;
            };
            // Abandoned pipelines keep running for a while; their reports are dropped.
            if job.status != JobStatus::Processing {
                return;
            }
            if let ProgressKind::Frame(frame) = &event.kind {
                job.record_frame(frame.frames_done, frame.frames_total, frame.eta_seconds);
                job.artifacts.extend(frame.artifacts.iter().cloned());
            }
        }
        self.shared.hub.publish(event);
    }
}

/// In-memory orchestrator for conversion jobs. Cheap to clone.
#[derive(Clone)]
pub struct JobManager {
    shared: Arc<Shared>,
}

impl JobManager {
    /// Must be called from within a tokio runtime; pipelines run on its blocking pool.
    pub fn new(config: AppConfig, sources: Arc<dyn SourceFactory>, muxer: Arc<dyn Muxer>) -> JobResult<Self> {
        let runtime =
            Handle::try_current().map_err(|_| JobError::invariant("JobManager must be created inside a tokio runtime"))?;
        let font = match &config.render.font_path {
            Some(path) => Some(Arc::new(load_font(path)?)),
            None => None,
        };
        fs::create_dir_all(&config.results_dir)?;

        let env = Arc::new(PipelineEnv {
            results_dir: config.results_dir.clone(),
            compute_batch: config.compute_batch,
            render: config.render.clone(),
            font,
            sources,
            muxer,
        });
        info!(
            max_concurrent_jobs = config.max_concurrent_jobs,
            job_timeout_secs = config.job_timeout_secs,
            results_dir = %config.results_dir.display(),
            "job manager ready"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                hub: ProgressHub::new(config.event_buffer),
                config,
                env,
                runtime,
                scheduler: Mutex::new(Scheduler::default()),
                jobs: RwLock::new(HashMap::new()),
                terminal: Notify::new(),
                submitted_total: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        })
    }

    /// Manager decoding and encoding through the configured ffmpeg binaries.
    pub fn with_ffmpeg(config: AppConfig) -> JobResult<Self> {
        let sources = Arc::new(FfmpegSourceFactory::new(config.ffmpeg.clone()));
        let muxer = Arc::new(FfmpegMuxer::new(config.ffmpeg.clone()));
        Self::new(config, sources, muxer)
    }

    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    /// Validate and enqueue. Never blocks on pipeline work.
    pub fn submit(&self, request: JobRequest) -> JobResult<JobId> {
        request.params.validate()?;
        let id = JobId::new();
        {
            let mut scheduler = self.shared.scheduler();
            let mut jobs = self.shared.jobs_mut();
            jobs.insert(id, Job::new(id, request));
            scheduler.queue.push_back(id);
            scheduler.submitted.push(id);
            refresh_queue_positions(&scheduler, &mut jobs);
        }
        self.shared.submitted_total.fetch_add(1, Ordering::Relaxed);
        info!(job_id = %id, "job queued");
        self.shared.hub.publish(ProgressEvent::status(id, JobStatus::Queued, "Queued"));
        self.schedule();
        Ok(id)
    }

    pub fn get_status(&self, job_id: JobId) -> JobResult<JobSnapshot> {
        self.shared
            .jobs()
            .get(&job_id)
            .map(Job::snapshot)
            .ok_or(JobError::NotFound(job_id))
    }

    /// Snapshots of every known job, oldest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let scheduler = self.shared.scheduler();
        let jobs = self.shared.jobs();
        scheduler
            .submitted
            .iter()
            .filter_map(|id| jobs.get(id).map(Job::snapshot))
            .collect()
    }

    pub fn artifacts(&self, job_id: JobId, kind: ArtifactKind) -> JobResult<Vec<Artifact>> {
        self.shared
            .jobs()
            .get(&job_id)
            .map(|job| job.artifacts.of_kind(kind))
            .ok_or(JobError::NotFound(job_id))
    }

    /// Queued jobs are cancelled at once. Processing jobs are signalled and stay
    /// `processing` until their pipeline stops at a frame boundary. Terminal jobs are left alone.
    pub fn cancel(&self, job_id: JobId) -> JobResult<JobSnapshot> {
        let (snapshot, event) = {
            let mut scheduler = self.shared.scheduler();
            let mut jobs = self.shared.jobs_mut();
            let job = jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
            let event = match job.status {
                JobStatus::Queued => {
                    scheduler.queue.retain(|id| *id != job_id);
                    job.transition(JobStatus::Cancelled)?;
                    job.message = "Cancelled before start".to_string();
                    info!(job_id = %job_id, "queued job cancelled");
                    Some(ProgressEvent::status(job_id, JobStatus::Cancelled, job.message.clone()))
                }
                JobStatus::Processing => {
                    if let Some(token) = scheduler.running.get(&job_id) {
                        if token.cancel(CancelReason::User) {
                            job.request_cancel();
                            info!(job_id = %job_id, "cancellation requested");
                        }
                    }
                    None
                }
                _ => None,
            };
            let snapshot = job.snapshot();
            refresh_queue_positions(&scheduler, &mut jobs);
            (snapshot, event)
        };
        if let Some(event) = event {
            self.shared.hub.publish(event);
            self.shared.terminal.notify_waiters();
        }
        Ok(snapshot)
    }

    /// Resolve once `job_id` reaches a terminal status.
    pub async fn wait(&self, job_id: JobId) -> JobResult<JobSnapshot> {
        loop {
            let notified = self.shared.terminal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let snapshot = self.get_status(job_id)?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            notified.await;
        }
    }

    /// Every progress event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.hub.subscribe()
    }

    pub fn stats(&self) -> ManagerStats {
        let scheduler = self.shared.scheduler();
        ManagerStats {
            active_jobs: scheduler.running.len(),
            queued_jobs: scheduler.queue.len(),
            submitted_total: self.shared.submitted_total.load(Ordering::Relaxed),
            uptime_secs: self.shared.started_at.elapsed().as_secs(),
        }
    }

    /// Drop terminal jobs that finished at least `older_than` ago, with their artifacts.
    /// Failed jobs go immediately when `keep_failed_jobs` is off. Returns the removed ids.
    pub fn cleanup(&self, older_than: Duration) -> Vec<JobId> {
        let now = Utc::now();
        let keep_failed = self.shared.config.keep_failed_jobs;
        let removed: Vec<JobId> = {
            let mut scheduler = self.shared.scheduler();
            let mut jobs = self.shared.jobs_mut();
            let expired: Vec<JobId> = scheduler
                .submitted
                .iter()
                .filter_map(|id| jobs.get(id))
                .filter(|job| job.status.is_terminal())
                .filter(|job| {
                    let aged = job
                        .completed_at
                        .and_then(|at| now.signed_duration_since(at).to_std().ok())
                        .is_some_and(|age| age >= older_than);
                    aged || (job.status == JobStatus::Failed && !keep_failed)
                })
                .map(|job| job.id)
                .collect();
            for id in &expired {
                jobs.remove(id);
            }
            scheduler.submitted.retain(|id| jobs.contains_key(id));
            expired
        };

        for id in &removed {
            let dir = job_dir(&self.shared.config.results_dir, *id);
            match fs::remove_dir_all(&dir) {
                Ok(()) => debug!(job_id = %id, "job directory removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(job_id = %id, dir = %dir.display(), error = %e, "failed to remove job directory"),
            }
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), "cleaned up expired jobs");
        }
        removed
    }

    /// Run `cleanup(retention)` every `interval` until the manager is dropped.
    pub fn spawn_cleanup_task(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let retention = self.shared.config.retention();
        self.shared.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let manager = JobManager { shared };
                if let Err(e) = tokio::task::spawn_blocking(move || manager.cleanup(retention)).await {
                    error!(error = %e, "cleanup task failed");
                }
            }
        })
    }

    /// Start queued jobs, oldest first, while slots are free.
    fn schedule(&self) {
        let max = self.shared.config.max_concurrent_jobs;
        let mut started = Vec::new();
        {
            let mut scheduler = self.shared.scheduler();
            let mut jobs = self.shared.jobs_mut();
            while scheduler.running.len() < max {
                let Some(id) = scheduler.queue.pop_front() else {
                    break;
                };
                let Some(job) = jobs.get_mut(&id) else {
                    continue;
                };
                if let Err(e) = job.transition(JobStatus::Processing) {
                    error!(job_id = %id, error = %e, "refusing to start job");
                    continue;
                }
                job.message = "Processing".to_string();
                let token = CancellationToken::new();
                scheduler.running.insert(id, token.clone());
                started.push((id, job.request.clone(), token));
            }
            refresh_queue_positions(&scheduler, &mut jobs);
        }

        for (id, request, token) in started {
            info!(job_id = %id, "job started");
            self.shared
                .hub
                .publish(ProgressEvent::status(id, JobStatus::Processing, "Processing"));
            let manager = self.clone();
            self.shared.runtime.spawn(async move {
                let result = manager.run_job(id, request, token).await;
                manager.finish(id, result);
            });
        }
    }

    async fn run_job(&self, id: JobId, request: JobRequest, token: CancellationToken) -> RunResult {
        let pipeline = ConversionPipeline::new(id, request, self.shared.env.clone());
        let sink = RegistrySink {
            job_id: id,
            shared: self.shared.clone(),
        };
        let pipeline_token = token.clone();
        let mut handle = self
            .shared
            .runtime
            .spawn_blocking(move || pipeline.run(&sink, &pipeline_token));

        let timeout = self.shared.config.job_timeout();
        tokio::select! {
            res = &mut handle => RunResult::Finished(res),
            _ = tokio::time::sleep(timeout) => {
                if token.cancel(CancelReason::Timeout) {
                    warn!(job_id = %id, timeout_secs = timeout.as_secs(), "job timed out, cancelling");
                }
                match tokio::time::timeout(self.shared.config.cancel_grace(), &mut handle).await {
                    Ok(res) => RunResult::Finished(res),
                    Err(_) => {
                        // The blocking thread runs on outside the concurrency ceiling until it
                        // next checks the token; its reports are dropped by RegistrySink.
                        error!(job_id = %id, "pipeline ignored cancellation, abandoning it");
                        RunResult::Abandoned
                    }
                }
            }
        }
    }

    /// Record the terminal state, free the slot and start whatever is next.
    fn finish(&self, id: JobId, result: RunResult) {
        let timeout = JobError::Timeout(self.shared.config.job_timeout_secs);
        let (report, verdict) = match result {
            RunResult::Finished(Ok(mut report)) => {
                let verdict = match std::mem::replace(&mut report.outcome, PipelineOutcome::Completed) {
                    PipelineOutcome::Completed => Verdict::Completed,
                    PipelineOutcome::Cancelled(CancelReason::User) => Verdict::Cancelled,
                    PipelineOutcome::Cancelled(CancelReason::Timeout) => Verdict::Failed(timeout),
                    PipelineOutcome::Failed(e) => Verdict::Failed(e),
                };
                (Some(report), verdict)
            }
            RunResult::Finished(Err(e)) => {
                let what = if e.is_panic() { "panicked" } else { "was aborted" };
                (None, Verdict::Failed(JobError::invariant(format!("pipeline {}", what))))
            }
            RunResult::Abandoned => (None, Verdict::Failed(timeout)),
        };

        let event = {
            let mut scheduler = self.shared.scheduler();
            let mut jobs = self.shared.jobs_mut();
            scheduler.running.remove(&id);
            match jobs.get_mut(&id) {
                Some(job) if job.status == JobStatus::Processing => Some(apply_result(job, report, verdict)),
                Some(job) => {
                    warn!(job_id = %id, status = %job.status, "ignoring result for job that is no longer processing");
                    None
                }
                None => None,
            }
        };

        if let Some(event) = event {
            self.shared.hub.publish(event);
        }
        self.shared.terminal.notify_waiters();
        self.schedule();
    }
}

enum Verdict {
    Completed,
    Cancelled,
    Failed(JobError),
}

fn apply_result(job: &mut Job, report: Option<PipelineReport>, verdict: Verdict) -> ProgressEvent {
    if let Some(report) = report {
        job.artifacts = report.artifacts;
        job.frames_done = report.frames_done;
        job.frames_total = report.frames_total.map(|total| total.max(report.frames_done));
    }

    let next = match verdict {
        Verdict::Failed(e) => {
            error!(job_id = %job.id, error = %e, "job failed");
            if let JobError::Mux { stderr: Some(stderr), .. } = &e {
                debug!(job_id = %job.id, stderr = %stderr, "encoder output");
            }
            job.error = Some(JobFailure::from(&e));
            job.message = e.to_string();
            JobStatus::Failed
        }
        Verdict::Cancelled => {
            job.message = format!("Cancelled after {} frames", job.frames_done);
            JobStatus::Cancelled
        }
        Verdict::Completed => {
            job.message = format!("Completed: {} frames", job.frames_done);
            JobStatus::Completed
        }
    };

    if let Err(e) = job.transition(next) {
        error!(job_id = %job.id, error = %e, "invalid terminal transition");
    } else {
        info!(job_id = %job.id, status = %next, frames = job.frames_done, "job finished");
    }
    ProgressEvent::status(job.id, job.status, job.message.clone())
}

fn refresh_queue_positions(scheduler: &Scheduler, jobs: &mut HashMap<JobId, Job>) {
    let waiting = scheduler.queue.len();
    for (position, id) in scheduler.queue.iter().enumerate() {
        if let Some(job) = jobs.get_mut(id) {
            job.message = format!("Queued (position {} of {})", position + 1, waiting);
        }
    }
}
