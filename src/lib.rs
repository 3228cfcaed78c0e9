//! # asciivid - video to ASCII art job orchestrator
//!
//! `asciivid` converts videos into ASCII art. Every frame is decoded, tone
//! corrected, quantized onto a glyph ramp and rendered as text and/or an
//! image; the images can then be assembled into an H.264 video.
//!
//! Conversions run as jobs owned by a [`JobManager`]:
//!
//! - jobs are queued FIFO and run under a concurrency ceiling
//! - each job reports per-frame progress with an ETA
//! - jobs can be cancelled, and are failed when they exceed their time budget
//! - a failing job never affects the others; its partial artifacts are kept
//!
//! ## Example
//!
//! ```no_run
//! use asciivid::{AppConfig, JobManager, JobParameters, JobRequest, Style};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = JobManager::with_ffmpeg(AppConfig::default())?;
//! let params = JobParameters::default().with_width(80).with_style(Style::Dots);
//! let id = manager.submit(JobRequest::new("clip.mp4", params))?;
//!
//! let done = manager.wait(id).await?;
//! println!("{} after {} frames", done.status, done.frames_done);
//! # Ok(())
//! # }
//! ```
//!
//! ## Progress
//!
//! Every frame produces a [`ProgressEvent`] carrying the frame's text
//! rendering, so a live preview can subscribe to the manager:
//!
//! ```no_run
//! # use asciivid::{JobManager, ProgressKind};
//! # async fn preview(manager: JobManager) {
//! let mut events = manager.subscribe();
//! while let Ok(event) = events.recv().await {
//!     if let ProgressKind::Frame(frame) = event.kind {
//!         print!("{}", frame.text);
//!     }
//! }
//! # }
//! ```

pub mod artifacts;
pub mod compose;
pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod mapper;
pub mod mux;
pub mod params;
pub mod pipeline;
pub mod progress;
pub mod source;
pub mod tone;

pub use artifacts::ArtifactWriter;
pub use compose::{AsciiFrame, ColorComposer, FramePalette, RenderedFrame};
pub use config::{AppConfig, FfmpegConfig, RandomPalette, RenderConfig};
pub use error::{ErrorKind, JobError, JobFailure, JobResult};
pub use job::{Artifact, ArtifactKind, JobId, JobSnapshot, JobStatus};
pub use manager::{JobManager, ManagerStats};
pub use mapper::{AsciiMapper, GlyphGrid};
pub use mux::{FfmpegMuxer, MuxRequest, Muxer};
pub use params::{JobParameters, JobRequest, OutputToggles, Rgb, Style};
pub use pipeline::{CancelReason, CancellationToken, ConversionPipeline, PipelineOutcome, PipelineReport};
pub use progress::{FrameProgress, ProgressEvent, ProgressKind, ProgressSink};
pub use source::{FfmpegSourceFactory, FrameSource, MemoryFrameSource, RawFrame, SourceFactory};
pub use tone::ToneCorrector;
