//! Frame-by-frame conversion of one job: decode, tone, map, compose, persist, mux.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ab_glyph::FontVec;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::artifacts::ArtifactWriter;
use crate::compose::{AsciiFrame, ColorComposer, FramePalette, PaletteSource, RenderedFrame};
use crate::config::RenderConfig;
use crate::error::{JobError, JobResult};
use crate::job::{ArtifactSet, JobId};
use crate::mapper::AsciiMapper;
use crate::mux::Muxer;
use crate::params::JobRequest;
use crate::progress::{EtaEstimator, FrameProgress, ProgressEvent, ProgressSink};
use crate::source::{FrameSource, RawFrame, SourceFactory};
use crate::tone::ToneCorrector;

/// Why a pipeline was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    User,
    Timeout,
}

const NOT_CANCELLED: u8 = 0;
const CANCELLED_BY_USER: u8 = 1;
const CANCELLED_BY_TIMEOUT: u8 = 2;

/// Cooperative cancellation flag shared between the manager and a pipeline.
/// The first reason recorded wins.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<AtomicU8>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the token was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let code = match reason {
            CancelReason::User => CANCELLED_BY_USER,
            CancelReason::Timeout => CANCELLED_BY_TIMEOUT,
        };
        self.state
            .compare_exchange(NOT_CANCELLED, code, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) != NOT_CANCELLED
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match self.state.load(Ordering::Acquire) {
            CANCELLED_BY_USER => Some(CancelReason::User),
            CANCELLED_BY_TIMEOUT => Some(CancelReason::Timeout),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Completed,
    Cancelled(CancelReason),
    Failed(JobError),
}

/// Result of one run. Artifacts written before a failure or cancellation are kept.
#[derive(Debug)]
pub struct PipelineReport {
    pub outcome: PipelineOutcome,
    pub artifacts: ArtifactSet,
    pub frames_done: u64,
    pub frames_total: Option<u64>,
}

/// Collaborators and settings shared by every pipeline of a manager.
pub struct PipelineEnv {
    pub results_dir: PathBuf,
    pub compute_batch: usize,
    pub render: RenderConfig,
    pub font: Option<Arc<FontVec>>,
    pub sources: Arc<dyn SourceFactory>,
    pub muxer: Arc<dyn Muxer>,
}

/// Per-job stages that are pure and may run on several frames at once.
struct FrameStages {
    tone: ToneCorrector,
    mapper: AsciiMapper,
    composer: ColorComposer,
    request: JobRequest,
    with_image: bool,
}

impl FrameStages {
    fn render(&self, raw: RawFrame, palette: FramePalette) -> RenderedFrame {
        let params = &self.request.params;
        let mut image = raw.image;
        self.tone.apply_in_place(&mut image);
        let grid = self.mapper.map(&image, params.width, params.style);
        let frame = AsciiFrame {
            grid,
            palette,
            timestamp: raw.timestamp,
        };
        self.composer.compose(&frame, self.with_image)
    }
}

pub struct ConversionPipeline {
    job_id: JobId,
    request: JobRequest,
    env: Arc<PipelineEnv>,
}

impl ConversionPipeline {
    pub fn new(job_id: JobId, request: JobRequest, env: Arc<PipelineEnv>) -> Self {
        Self { job_id, request, env }
    }

    /// Run to completion, cancellation or failure. Blocking; call from a worker thread.
    pub fn run(&self, sink: &dyn ProgressSink, token: &CancellationToken) -> PipelineReport {
        let span = info_span!("job", job_id = %self.job_id);
        let _guard = span.enter();

        let mut writer = match ArtifactWriter::create(&self.env.results_dir, self.job_id, self.request.params.outputs) {
            Ok(writer) => writer,
            Err(e) => return Self::report(PipelineOutcome::Failed(e), ArtifactSet::default(), 0, None),
        };
        let mut state = RunState::default();
        let outcome = match self.drive(&mut writer, &mut state, sink, token) {
            Ok(outcome) => outcome,
            Err(e) => PipelineOutcome::Failed(e),
        };
        match &outcome {
            PipelineOutcome::Completed => info!(frames = state.frames_done, "conversion completed"),
            PipelineOutcome::Cancelled(reason) => {
                info!(frames = state.frames_done, ?reason, "conversion stopped on cancellation")
            }
            PipelineOutcome::Failed(e) => warn!(frames = state.frames_done, error = %e, "conversion failed"),
        }
        Self::report(outcome, writer.into_artifacts(), state.frames_done, state.frames_total)
    }

    fn report(
        outcome: PipelineOutcome,
        artifacts: ArtifactSet,
        frames_done: u64,
        frames_total: Option<u64>,
    ) -> PipelineReport {
        PipelineReport {
            outcome,
            artifacts,
            frames_done,
            frames_total,
        }
    }

    fn drive(
        &self,
        writer: &mut ArtifactWriter,
        state: &mut RunState,
        sink: &dyn ProgressSink,
        token: &CancellationToken,
    ) -> JobResult<PipelineOutcome> {
        let params = &self.request.params;
        let env = &self.env;

        let mut source = env.sources.open(&self.request.input)?;
        state.frames_total = source.frames_total();
        info!(
            input = %self.request.input.display(),
            frames_total = ?state.frames_total,
            width = params.width,
            style = %params.style,
            "conversion started"
        );

        let stages = FrameStages {
            tone: ToneCorrector::new(params.brightness, params.contrast, params.gamma),
            mapper: AsciiMapper::new(env.render.char_aspect),
            composer: ColorComposer::for_style(params.style, &env.render, env.font.as_deref()),
            request: self.request.clone(),
            with_image: params.outputs.needs_images(),
        };
        let mut palettes = PaletteSource::new(params, &env.render);
        let mut eta = EtaEstimator::new();
        let batch_size = env.compute_batch.max(1);

        loop {
            if let Some(reason) = token.reason() {
                return Ok(PipelineOutcome::Cancelled(reason));
            }

            let batch = read_batch(source.as_mut(), &mut palettes, batch_size, token);
            let rendered: Vec<RenderedFrame> = batch
                .frames
                .into_par_iter()
                .map(|(raw, palette)| stages.render(raw, palette))
                .collect();

            for frame in rendered {
                let frame_number = state.frames_done;
                let written = writer.write_frame(frame_number, &frame)?;
                state.frames_done += 1;
                if let Some(total) = state.frames_total {
                    state.frames_total = Some(total.max(state.frames_done));
                }
                eta.tick();
                let eta_seconds = eta.estimate(state.frames_done, state.frames_total);
                debug!(frame = frame_number, eta_seconds = ?eta_seconds, "frame written");

                sink.publish(ProgressEvent::frame(
                    self.job_id,
                    FrameProgress {
                        frame_number,
                        frames_done: state.frames_done,
                        frames_total: state.frames_total,
                        eta_seconds,
                        text: frame.text,
                        timestamp: frame.timestamp,
                        artifacts: written,
                    },
                ));

                if let Some(reason) = token.reason() {
                    return Ok(PipelineOutcome::Cancelled(reason));
                }
            }

            // Frames decoded before a failure are already written above.
            if let Some(e) = batch.error {
                return Err(e);
            }
            if batch.exhausted {
                break;
            }
        }

        if state.frames_done == 0 {
            return Err(JobError::decode("source yielded no frames"));
        }
        if state.frames_total != Some(state.frames_done) {
            debug!(hinted = ?state.frames_total, actual = state.frames_done, "frame total corrected");
            state.frames_total = Some(state.frames_done);
        }

        if params.outputs.save_mp4 {
            let started = Instant::now();
            let video = writer.finalize_video(env.muxer.as_ref(), params.fps, params.quality)?;
            info!(
                video = %video.location.display(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "video assembled"
            );
        }
        Ok(PipelineOutcome::Completed)
    }
}

#[derive(Debug, Default)]
struct RunState {
    frames_done: u64,
    frames_total: Option<u64>,
}

/// Frames pulled for one compute round.
struct Batch {
    frames: Vec<(RawFrame, FramePalette)>,
    exhausted: bool,
    /// Decode failure that ended the batch early; `frames` still holds what came before it.
    error: Option<JobError>,
}

/// Pull up to `size` frames. Palettes are drawn here, in frame order.
/// Stops early once the token is cancelled.
fn read_batch(
    source: &mut dyn FrameSource,
    palettes: &mut PaletteSource,
    size: usize,
    token: &CancellationToken,
) -> Batch {
    let mut frames = Vec::with_capacity(size);
    while frames.len() < size && !token.is_cancelled() {
        match source.next_frame() {
            Ok(Some(raw)) => frames.push((raw, palettes.next_palette())),
            Ok(None) => {
                return Batch {
                    frames,
                    exhausted: true,
                    error: None,
                }
            }
            Err(e) => {
                return Batch {
                    frames,
                    exhausted: true,
                    error: Some(e),
                }
            }
        }
    }
    Batch {
        frames,
        exhausted: false,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ArtifactKind;
    use crate::mux::{ConcatMuxer, MuxRequest};
    use crate::params::{JobParameters, OutputToggles};
    use crate::progress::{ProgressKind, RecordingSink};
    use crate::source::MemoryFrameSource;
    use std::path::Path;
    use std::sync::Mutex;

    fn frames(n: usize) -> Vec<RawFrame> {
        (0..n)
            .map(|i| {
                let image = image::RgbImage::from_fn(32, 16, |x, _| image::Rgb([(x * 8 + i as u32) as u8; 3]));
                RawFrame::new(image, i as f64 / 30.0)
            })
            .collect()
    }

    fn env(root: &Path, n: usize, hint: Option<u64>, muxer: Arc<dyn Muxer>) -> Arc<PipelineEnv> {
        let sources = move |_: &Path| -> JobResult<Box<dyn FrameSource>> {
            Ok(Box::new(MemoryFrameSource::new(frames(n)).with_total_hint(hint)))
        };
        Arc::new(PipelineEnv {
            results_dir: root.to_path_buf(),
            compute_batch: 3,
            render: RenderConfig {
                cell_width: 4,
                cell_height: 8,
                ..RenderConfig::default()
            },
            font: None,
            sources: Arc::new(sources),
            muxer,
        })
    }

    fn request(outputs: OutputToggles) -> JobRequest {
        JobRequest::new("clip.mp4", JobParameters::default().with_width(16).with_outputs(outputs))
    }

    fn all_outputs() -> OutputToggles {
        OutputToggles {
            save_txt: true,
            save_png: true,
            save_mp4: true,
        }
    }

    fn id() -> JobId {
        "3d0c0c1e-5c7e-4b8a-9d3f-7f1a2b3c4d5e".parse().unwrap()
    }

    /// Records what it was asked to encode.
    #[derive(Default)]
    struct SpyMuxer {
        requests: Mutex<Vec<MuxRequest>>,
    }

    impl Muxer for SpyMuxer {
        fn mux(&self, request: &MuxRequest) -> JobResult<()> {
            self.requests.lock().unwrap().push(request.clone());
            ConcatMuxer.mux(request)
        }
    }

    struct FailingMuxer;

    impl Muxer for FailingMuxer {
        fn mux(&self, _: &MuxRequest) -> JobResult<()> {
            Err(JobError::Mux {
                message: "encoder exploded".to_string(),
                stderr: Some("boom".to_string()),
                exit_code: Some(1),
            })
        }
    }

    fn frame_numbers(sink: &RecordingSink) -> Vec<u64> {
        sink.events()
            .into_iter()
            .filter_map(|e| match e.kind {
                ProgressKind::Frame(f) => Some(f.frame_number),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_token_first_reason_wins() {
        let token = CancellationToken::new();
        assert_eq!(token.reason(), None);
        assert!(token.cancel(CancelReason::Timeout));
        assert!(!token.cancel(CancelReason::User));
        assert!(token.clone().is_cancelled());
        assert_eq!(token.reason(), Some(CancelReason::Timeout));
    }

    #[test]
    fn test_completed_run_writes_ordered_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let spy = Arc::new(SpyMuxer::default());
        let pipeline = ConversionPipeline::new(id(), request(all_outputs()), env(root.path(), 5, Some(5), spy.clone()));
        let sink = RecordingSink::new();
        let report = pipeline.run(&sink, &CancellationToken::new());

        assert!(matches!(report.outcome, PipelineOutcome::Completed));
        assert_eq!(report.frames_done, 5);
        assert_eq!(report.frames_total, Some(5));
        for kind in [ArtifactKind::TextFrame, ArtifactKind::ImageFrame] {
            let seqs: Vec<u64> = report.artifacts.of_kind(kind).iter().filter_map(|a| a.sequence_number).collect();
            assert_eq!(seqs, [0, 1, 2, 3, 4]);
        }
        assert!(report.artifacts.video().is_some());
        assert_eq!(frame_numbers(&sink), [0, 1, 2, 3, 4]);

        let requests = spy.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].fps, 30);
        let images: Vec<PathBuf> = report
            .artifacts
            .of_kind(ArtifactKind::ImageFrame)
            .into_iter()
            .map(|a| a.location)
            .collect();
        assert_eq!(requests[0].frames, images);
    }

    #[test]
    fn test_progress_is_monotonic_and_totals_corrected() {
        let root = tempfile::tempdir().unwrap();
        let outputs = OutputToggles {
            save_txt: true,
            save_png: false,
            save_mp4: false,
        };
        // Container claims 10 frames but only 4 arrive.
        let pipeline = ConversionPipeline::new(id(), request(outputs), env(root.path(), 4, Some(10), Arc::new(ConcatMuxer)));
        let sink = RecordingSink::new();
        let report = pipeline.run(&sink, &CancellationToken::new());
        assert!(matches!(report.outcome, PipelineOutcome::Completed));
        assert_eq!(report.frames_total, Some(4));

        let done: Vec<u64> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e.kind {
                ProgressKind::Frame(f) => {
                    assert!(f.frames_done <= f.frames_total.unwrap());
                    Some(f.frames_done)
                }
                _ => None,
            })
            .collect();
        assert_eq!(done, [1, 2, 3, 4]);
        assert_eq!(report.artifacts.count(ArtifactKind::ImageFrame), 0);
    }

    #[test]
    fn test_more_frames_than_hinted_grows_total() {
        let root = tempfile::tempdir().unwrap();
        let outputs = OutputToggles {
            save_txt: true,
            save_png: false,
            save_mp4: false,
        };
        let pipeline = ConversionPipeline::new(id(), request(outputs), env(root.path(), 6, Some(2), Arc::new(ConcatMuxer)));
        let sink = RecordingSink::new();
        let report = pipeline.run(&sink, &CancellationToken::new());
        assert_eq!(report.frames_total, Some(6));
        for event in sink.events() {
            if let ProgressKind::Frame(f) = event.kind {
                assert!(f.frames_done <= f.frames_total.unwrap());
            }
        }
    }

    /// Cancels the token when it sees a given frame.
    struct CancelAt {
        frame: u64,
        token: CancellationToken,
        inner: RecordingSink,
    }

    impl ProgressSink for CancelAt {
        fn publish(&self, event: ProgressEvent) {
            if let ProgressKind::Frame(f) = &event.kind {
                if f.frame_number == self.frame {
                    self.token.cancel(CancelReason::User);
                }
            }
            self.inner.publish(event);
        }
    }

    #[test]
    fn test_cancel_stops_after_current_frame() {
        let root = tempfile::tempdir().unwrap();
        let spy = Arc::new(SpyMuxer::default());
        let pipeline = ConversionPipeline::new(id(), request(all_outputs()), env(root.path(), 10, Some(10), spy.clone()));
        let token = CancellationToken::new();
        let sink = CancelAt {
            frame: 1,
            token: token.clone(),
            inner: RecordingSink::new(),
        };
        let report = pipeline.run(&sink, &token);

        assert!(matches!(report.outcome, PipelineOutcome::Cancelled(CancelReason::User)));
        assert_eq!(report.frames_done, 2);
        assert_eq!(frame_numbers(&sink.inner), [0, 1]);
        assert_eq!(report.artifacts.count(ArtifactKind::TextFrame), 2);
        assert!(report.artifacts.video().is_none());
        assert!(spy.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_before_start_produces_nothing() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::new(id(), request(all_outputs()), env(root.path(), 3, Some(3), Arc::new(ConcatMuxer)));
        let token = CancellationToken::new();
        token.cancel(CancelReason::Timeout);
        let report = pipeline.run(&RecordingSink::new(), &token);
        assert!(matches!(report.outcome, PipelineOutcome::Cancelled(CancelReason::Timeout)));
        assert!(report.artifacts.is_empty());
    }

    #[test]
    fn test_mux_failure_keeps_frame_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::new(id(), request(all_outputs()), env(root.path(), 3, Some(3), Arc::new(FailingMuxer)));
        let report = pipeline.run(&RecordingSink::new(), &CancellationToken::new());
        match report.outcome {
            PipelineOutcome::Failed(JobError::Mux { stderr, .. }) => assert_eq!(stderr.as_deref(), Some("boom")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(report.artifacts.count(ArtifactKind::ImageFrame), 3);
        assert!(report.artifacts.iter().all(|a| a.location.exists()));
    }

    #[test]
    fn test_empty_source_is_decode_error() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = ConversionPipeline::new(id(), request(all_outputs()), env(root.path(), 0, None, Arc::new(ConcatMuxer)));
        let report = pipeline.run(&RecordingSink::new(), &CancellationToken::new());
        assert!(matches!(report.outcome, PipelineOutcome::Failed(JobError::Decode(_))));
    }

    /// Yields synthetic frames, failing at `fail_at` and cancelling `token` once `cancel_at` is pulled.
    struct ScriptedSource {
        next: u64,
        fail_at: Option<u64>,
        cancel_at: Option<(u64, CancellationToken)>,
        pulled: Arc<Mutex<u64>>,
    }

    impl FrameSource for ScriptedSource {
        fn frames_total(&self) -> Option<u64> {
            Some(10)
        }

        fn next_frame(&mut self) -> JobResult<Option<RawFrame>> {
            if self.fail_at == Some(self.next) {
                return Err(JobError::decode(format!("bad packet at {}", self.next)));
            }
            if self.next == 10 {
                return Ok(None);
            }
            if let Some((at, token)) = &self.cancel_at {
                if *at == self.next {
                    token.cancel(CancelReason::User);
                }
            }
            *self.pulled.lock().unwrap() += 1;
            let frame = frames(1).remove(0);
            self.next += 1;
            Ok(Some(frame))
        }
    }

    fn scripted_env(
        root: &Path,
        fail_at: Option<u64>,
        cancel_at: Option<(u64, CancellationToken)>,
        pulled: Arc<Mutex<u64>>,
    ) -> Arc<PipelineEnv> {
        let mut env = env(root, 0, None, Arc::new(ConcatMuxer));
        let sources = move |_: &Path| -> JobResult<Box<dyn FrameSource>> {
            Ok(Box::new(ScriptedSource {
                next: 0,
                fail_at,
                cancel_at: cancel_at.clone(),
                pulled: pulled.clone(),
            }))
        };
        Arc::get_mut(&mut env).unwrap().sources = Arc::new(sources);
        env
    }

    #[test]
    fn test_decode_failure_mid_batch_keeps_earlier_frames() {
        let root = tempfile::tempdir().unwrap();
        // Batches of three: frame 3 decodes, frame 4 fails inside the second batch.
        let env = scripted_env(root.path(), Some(4), None, Arc::new(Mutex::new(0)));
        let pipeline = ConversionPipeline::new(id(), request(all_outputs()), env);
        let sink = RecordingSink::new();
        let report = pipeline.run(&sink, &CancellationToken::new());

        assert!(matches!(report.outcome, PipelineOutcome::Failed(JobError::Decode(_))));
        assert_eq!(report.frames_done, 4);
        assert_eq!(frame_numbers(&sink), [0, 1, 2, 3]);
        assert_eq!(report.artifacts.count(ArtifactKind::TextFrame), 4);
        assert_eq!(report.artifacts.count(ArtifactKind::ImageFrame), 4);
        assert!(report.artifacts.video().is_none());
    }

    #[test]
    fn test_cancel_stops_decoding_within_batch() {
        let root = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let pulled = Arc::new(Mutex::new(0));
        let env = scripted_env(root.path(), None, Some((0, token.clone())), pulled.clone());
        let pipeline = ConversionPipeline::new(id(), request(all_outputs()), env);
        let report = pipeline.run(&RecordingSink::new(), &token);

        assert!(matches!(report.outcome, PipelineOutcome::Cancelled(CancelReason::User)));
        assert_eq!(*pulled.lock().unwrap(), 1);
        assert_eq!(report.frames_done, 1);
    }

    #[test]
    fn test_open_failure_is_reported_not_raised() {
        let root = tempfile::tempdir().unwrap();
        let mut env = env(root.path(), 1, None, Arc::new(ConcatMuxer));
        let failing = |_: &Path| -> JobResult<Box<dyn FrameSource>> { Err(JobError::decode("unreadable")) };
        Arc::get_mut(&mut env).unwrap().sources = Arc::new(failing);
        let pipeline = ConversionPipeline::new(id(), request(all_outputs()), env);
        let report = pipeline.run(&RecordingSink::new(), &CancellationToken::new());
        assert!(matches!(report.outcome, PipelineOutcome::Failed(JobError::Decode(_))));
    }
}
