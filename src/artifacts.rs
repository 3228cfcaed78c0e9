//! Persistence of per-frame outputs and the final video.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use image::{ImageFormat, RgbaImage};
use tracing::{debug, error, warn};

use crate::compose::RenderedFrame;
use crate::error::{JobError, JobResult};
use crate::job::{Artifact, ArtifactKind, ArtifactSet, JobId};
use crate::mux::{MuxRequest, Muxer};
use crate::params::OutputToggles;

pub const VIDEO_FILE_NAME: &str = "ascii_video.mp4";

/// Directory holding every artifact of `job_id`.
pub fn job_dir(results_dir: &Path, job_id: JobId) -> PathBuf {
    results_dir.join(job_id.to_string())
}

pub fn frame_file_name(sequence: u64, extension: &str) -> String {
    format!("frame_{:06}.{}", sequence, extension)
}

/// Job directories under `results_dir` not modified for at least `older_than`.
/// Only directories named like a job id are considered.
pub fn stale_job_dirs(results_dir: &Path, older_than: Duration) -> Vec<PathBuf> {
    let now = SystemTime::now();
    let mut dirs: Vec<PathBuf> = walkdir::WalkDir::new(results_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
        .filter(|e| e.file_name().to_str().is_some_and(|name| name.parse::<JobId>().is_ok()))
        .filter(|e| {
            e.metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age >= older_than)
        })
        .map(|e| e.into_path())
        .collect();
    dirs.sort();
    dirs
}

/// Write through a sibling temp file so readers never see a partial artifact.
fn write_atomically<F>(path: &Path, write: F) -> JobResult<()>
where
    F: FnOnce(&mut BufWriter<File>) -> JobResult<()>,
{
    let tmp = path.with_extension("partial");
    let result: JobResult<()> = (|| {
        let mut out = BufWriter::new(File::create(&tmp)?);
        write(&mut out)?;
        out.flush()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Writes one job's artifacts in sequence order.
///
/// When a video is wanted but PNG frames are not, images are still written as
/// encoder input. They are never registered as artifacts and are removed after
/// encoding, or when the writer is dropped.
pub struct ArtifactWriter {
    dir: PathBuf,
    outputs: OutputToggles,
    next_text: u64,
    next_image: u64,
    images: Vec<PathBuf>,
    artifacts: ArtifactSet,
}

impl ArtifactWriter {
    pub fn create(results_dir: &Path, job_id: JobId, outputs: OutputToggles) -> JobResult<Self> {
        let dir = job_dir(results_dir, job_id);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            outputs,
            next_text: 0,
            next_image: 0,
            images: Vec::new(),
            artifacts: ArtifactSet::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn intermediate_images(&self) -> bool {
        self.outputs.save_mp4 && !self.outputs.save_png
    }

    fn check_sequence(kind: ArtifactKind, expected: u64, got: u64) -> JobResult<()> {
        if expected != got {
            error!(?kind, expected, got, "artifact written out of order");
            return Err(JobError::invariant(format!(
                "{:?} artifact {} written while {} was expected",
                kind, got, expected
            )));
        }
        Ok(())
    }

    fn register(&mut self, kind: ArtifactKind, sequence_number: Option<u64>, location: PathBuf) -> Artifact {
        let artifact = Artifact {
            kind,
            sequence_number,
            location,
        };
        self.artifacts.push(artifact.clone());
        artifact
    }

    pub fn write_text(&mut self, sequence: u64, text: &str) -> JobResult<Artifact> {
        Self::check_sequence(ArtifactKind::TextFrame, self.next_text, sequence)?;
        let path = self.dir.join(frame_file_name(sequence, "txt"));
        write_atomically(&path, |out| Ok(out.write_all(text.as_bytes())?))?;
        self.next_text += 1;
        Ok(self.register(ArtifactKind::TextFrame, Some(sequence), path))
    }

    /// Returns `None` when the image is only encoder input.
    pub fn write_image(&mut self, sequence: u64, image: &RgbaImage) -> JobResult<Option<Artifact>> {
        Self::check_sequence(ArtifactKind::ImageFrame, self.next_image, sequence)?;
        let path = self.dir.join(frame_file_name(sequence, "png"));
        write_atomically(&path, |out| Ok(image.write_to(out, ImageFormat::Png)?))?;
        self.next_image += 1;
        self.images.push(path.clone());
        if self.intermediate_images() {
            return Ok(None);
        }
        Ok(Some(self.register(ArtifactKind::ImageFrame, Some(sequence), path)))
    }

    /// Persist whatever `outputs` asks for; returns the newly registered artifacts.
    pub fn write_frame(&mut self, sequence: u64, frame: &RenderedFrame) -> JobResult<Vec<Artifact>> {
        let mut written = Vec::new();
        if self.outputs.save_txt {
            written.push(self.write_text(sequence, &frame.text)?);
        }
        if self.outputs.needs_images() {
            let image = frame
                .image
                .as_ref()
                .ok_or_else(|| JobError::invariant(format!("frame {} has no image to persist", sequence)))?;
            if let Some(artifact) = self.write_image(sequence, image)? {
                written.push(artifact);
            }
        }
        Ok(written)
    }

    /// Encode all images written so far into the job's video.
    pub fn finalize_video(&mut self, muxer: &dyn Muxer, fps: u32, quality: u8) -> JobResult<Artifact> {
        let output = self.dir.join(VIDEO_FILE_NAME);
        let request = MuxRequest {
            frames: self.images.clone(),
            output: output.clone(),
            fps,
            quality,
        };
        let result = muxer.mux(&request);
        if self.intermediate_images() {
            self.remove_intermediates();
        }
        result?;
        debug!(video = %output.display(), frames = request.frames.len(), "video artifact ready");
        Ok(self.register(ArtifactKind::Video, None, output))
    }

    fn remove_intermediates(&mut self) {
        for path in self.images.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove intermediate frame");
                }
            }
        }
    }

    /// Registered artifacts of one kind, ordered by sequence number.
    pub fn artifacts(&self, kind: ArtifactKind) -> Vec<Artifact> {
        self.artifacts.of_kind(kind)
    }

    pub fn into_artifacts(mut self) -> ArtifactSet {
        std::mem::take(&mut self.artifacts)
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if self.intermediate_images() {
            self.remove_intermediates();
        }
    }
}
