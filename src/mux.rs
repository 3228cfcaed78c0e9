//! Encoding ordered frame images into an H.264 MP4.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use tracing::{debug, warn};

use crate::config::FfmpegConfig;
use crate::error::{JobError, JobResult};

/// Everything needed to encode one video.
#[derive(Debug, Clone)]
pub struct MuxRequest {
    /// PNG frames in presentation order
    pub frames: Vec<PathBuf>,
    pub output: PathBuf,
    pub fps: u32,
    /// x264 CRF, lower is better
    pub quality: u8,
}

pub trait Muxer: Send + Sync {
    fn mux(&self, request: &MuxRequest) -> JobResult<()>;
}

/// Muxer backed by the `ffmpeg` binary, frames streamed over stdin.
#[derive(Debug, Clone, Default)]
pub struct FfmpegMuxer {
    config: FfmpegConfig,
}

impl FfmpegMuxer {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    fn args(&self, request: &MuxRequest) -> Vec<String> {
        vec![
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "image2pipe".into(),
            "-framerate".into(),
            request.fps.to_string(),
            "-i".into(),
            "-".into(),
            "-vf".into(),
            "pad=ceil(iw/2)*2:ceil(ih/2)*2,format=yuv420p".into(),
            "-c:v".into(),
            "libx264".into(),
            "-crf".into(),
            request.quality.to_string(),
            "-preset".into(),
            self.config.encode_preset.clone(),
            "-movflags".into(),
            "+faststart".into(),
            request.output.to_string_lossy().into_owned(),
        ]
    }
}

impl Muxer for FfmpegMuxer {
    fn mux(&self, request: &MuxRequest) -> JobResult<()> {
        if request.frames.is_empty() {
            return Err(JobError::mux("no frames to encode"));
        }

        let mut child = Command::new(self.config.ffmpeg_cmd())
            .args(self.args(request))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| JobError::mux(format!("failed to start {}: {}", self.config.ffmpeg_cmd(), e)))?;

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let fed: io::Result<()> = match child.stdin.take() {
            Some(mut stdin) => request.frames.iter().try_for_each(|path| {
                let mut file = File::open(path)?;
                io::copy(&mut file, &mut stdin)?;
                Ok(())
            }),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "ffmpeg stdin unavailable")),
        };
        // stdin is dropped here so ffmpeg sees EOF.

        let status = exit_status(child.wait())?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        if !status.success() {
            return Err(JobError::Mux {
                message: format!("ffmpeg exited with {}", status),
                stderr,
                exit_code: status.code(),
            });
        }
        if let Err(e) = fed {
            warn!(error = %e, "ffmpeg finished but frame feed was interrupted");
            return Err(JobError::Mux {
                message: format!("feeding frames to ffmpeg failed: {}", e),
                stderr,
                exit_code: status.code(),
            });
        }

        match fs::metadata(&request.output) {
            Ok(meta) if meta.len() > 0 => {
                debug!(output = %request.output.display(), bytes = meta.len(), "video encoded");
                Ok(())
            }
            _ => Err(JobError::Mux {
                message: format!("ffmpeg produced no output at {}", request.output.display()),
                stderr,
                exit_code: status.code(),
            }),
        }
    }
}

fn exit_status(waited: io::Result<ExitStatus>) -> JobResult<ExitStatus> {
    waited.map_err(|e| JobError::mux(format!("waiting for ffmpeg failed: {}", e)))
}

/// Writes a frame listing instead of encoding.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ConcatMuxer;

#[cfg(test)]
impl Muxer for ConcatMuxer {
    fn mux(&self, request: &MuxRequest) -> JobResult<()> {
        use std::io::Write;

        if request.frames.is_empty() {
            return Err(JobError::mux("no frames to encode"));
        }
        let mut out = File::create(&request.output)?;
        writeln!(out, "fps={} crf={}", request.fps, request.quality)?;
        for frame in &request.frames {
            writeln!(out, "{}", frame.display())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(frames: Vec<PathBuf>, output: PathBuf) -> MuxRequest {
        MuxRequest {
            frames,
            output,
            fps: 24,
            quality: 18,
        }
    }

    #[test]
    fn test_ffmpeg_args() {
        let muxer = FfmpegMuxer::new(FfmpegConfig::default());
        let args = muxer.args(&request(vec![], PathBuf::from("/out/ascii_video.mp4")));
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("-framerate") + 1], "24");
        assert_eq!(args[pos("-crf") + 1], "18");
        assert_eq!(args[pos("-c:v") + 1], "libx264");
        assert_eq!(args[pos("-preset") + 1], "medium");
        assert!(args[pos("-vf") + 1].contains("yuv420p"));
        assert_eq!(args.last().unwrap(), "/out/ascii_video.mp4");
    }

    #[test]
    fn test_empty_frame_list_is_a_mux_error() {
        let muxer = FfmpegMuxer::new(FfmpegConfig::default());
        let err = muxer.mux(&request(vec![], PathBuf::from("unused.mp4"))).unwrap_err();
        assert!(matches!(err, JobError::Mux { .. }));
    }

    #[test]
    fn test_missing_binary_is_a_mux_error() {
        let dir = tempfile::tempdir().unwrap();
        let frame = dir.path().join("frame_000000.png");
        fs::write(&frame, b"png").unwrap();
        let muxer = FfmpegMuxer::new(FfmpegConfig {
            ffmpeg: "/nonexistent/ffmpeg-binary".to_string(),
            ..FfmpegConfig::default()
        });
        let err = muxer.mux(&request(vec![frame], dir.path().join("out.mp4"))).unwrap_err();
        assert!(matches!(err, JobError::Mux { .. }));
    }

    #[test]
    fn test_lost_encoder_process_is_a_mux_error() {
        let err = exit_status(Err(io::Error::new(io::ErrorKind::Interrupted, "wait interrupted"))).unwrap_err();
        assert!(matches!(err, JobError::Mux { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::MuxError);
    }

    #[test]
    fn test_concat_muxer_lists_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let frames = vec![dir.path().join("a.png"), dir.path().join("b.png")];
        let out = dir.path().join("video.mp4");
        ConcatMuxer.mux(&request(frames, out.clone())).unwrap();
        let text = fs::read_to_string(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "fps=24 crf=18");
        assert!(lines[1].ends_with("a.png") && lines[2].ends_with("b.png"));
    }
}
