//! Decoded frame supply: the `FrameSource` seam and its ffmpeg implementation.

use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command as ProcCommand, Stdio};
use std::thread::JoinHandle;

use image::RgbImage;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::FfmpegConfig;
use crate::error::{JobError, JobResult};

/// One decoded frame plus its presentation time in seconds.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub image: RgbImage,
    pub timestamp: f64,
}

impl RawFrame {
    pub fn new(image: RgbImage, timestamp: f64) -> Self {
        Self { image, timestamp }
    }
}

/// Sequential supply of decoded frames in presentation order.
pub trait FrameSource: Send {
    /// Total number of frames, when the container reports it.
    fn frames_total(&self) -> Option<u64>;

    /// Next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> JobResult<Option<RawFrame>>;
}

/// Opens a `FrameSource` for a job's input locator.
pub trait SourceFactory: Send + Sync {
    fn open(&self, input: &Path) -> JobResult<Box<dyn FrameSource>>;
}

impl<F> SourceFactory for F
where
    F: Fn(&Path) -> JobResult<Box<dyn FrameSource>> + Send + Sync,
{
    fn open(&self, input: &Path) -> JobResult<Box<dyn FrameSource>> {
        self(input)
    }
}

/// Frames held in memory, e.g. already-decoded stills.
pub struct MemoryFrameSource {
    frames: std::vec::IntoIter<RawFrame>,
    total: Option<u64>,
}

impl MemoryFrameSource {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        let total = Some(frames.len() as u64);
        Self {
            frames: frames.into_iter(),
            total,
        }
    }

    /// Override the advertised total, e.g. to mimic a container that misreports it.
    pub fn with_total_hint(mut self, total: Option<u64>) -> Self {
        self.total = total;
        self
    }
}

impl FrameSource for MemoryFrameSource {
    fn frames_total(&self) -> Option<u64> {
        self.total
    }

    fn next_frame(&mut self) -> JobResult<Option<RawFrame>> {
        Ok(self.frames.next())
    }
}

/// Stream geometry and timing reported by ffprobe.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frames_total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    nb_read_packets: Option<String>,
}

fn parse_frame_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

fn parse_count(raw: Option<&String>) -> Option<u64> {
    raw.and_then(|s| s.trim().parse::<u64>().ok()).filter(|n| *n > 0)
}

fn run_ffprobe(config: &FfmpegConfig, input: &Path, extra: &[&str], entries: &str) -> JobResult<FfprobeStream> {
    let output = ProcCommand::new(config.ffprobe_cmd())
        .args(["-v", "error", "-select_streams", "v:0"])
        .args(extra)
        .args(["-show_entries", entries, "-of", "json"])
        .arg(input)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| JobError::decode(format!("running {}: {}", config.ffprobe_cmd(), e)))?;

    if !output.status.success() {
        return Err(JobError::decode(format!(
            "ffprobe could not read {}: {}",
            input.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| JobError::decode(format!("parsing ffprobe output: {}", e)))?;
    probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| JobError::decode(format!("no video stream in {}", input.display())))
}

/// Probe width, height, frame rate and frame count of the first video stream.
pub fn probe_stream(config: &FfmpegConfig, input: &Path) -> JobResult<StreamInfo> {
    if !input.exists() {
        return Err(JobError::decode(format!("input {} does not exist", input.display())));
    }

    let stream = run_ffprobe(config, input, &[], "stream=width,height,r_frame_rate,avg_frame_rate,nb_frames")?;
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(JobError::decode("video stream has no dimensions")),
    };
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(30.0);

    let frames_total = match parse_count(stream.nb_frames.as_ref()) {
        Some(n) => Some(n),
        // Containers like mkv omit nb_frames; counting packets reads the whole file.
        None => run_ffprobe(config, input, &["-count_packets"], "stream=nb_read_packets")
            .ok()
            .and_then(|s| parse_count(s.nb_read_packets.as_ref())),
    };

    Ok(StreamInfo {
        width,
        height,
        fps,
        frames_total,
    })
}

/// Output size after clamping the width to `max_width`, keeping even dimensions.
pub(crate) fn decode_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if max_width == 0 || width <= max_width {
        return (width, height);
    }
    let w = (max_width / 2 * 2).max(2);
    let h = ((height as f64 * w as f64 / width as f64 / 2.0).round() as u32 * 2).max(2);
    (w, h)
}

/// Decodes a video through an `ffmpeg` child process emitting raw RGB24.
pub struct FfmpegFrameSource {
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    fps: f64,
    frames_total: Option<u64>,
    next_index: u64,
    finished: bool,
}

impl FfmpegFrameSource {
    pub fn open(config: &FfmpegConfig, input: &Path) -> JobResult<Self> {
        let info = probe_stream(config, input)?;
        let (width, height) = decode_dimensions(info.width, info.height, config.decode_max_width);

        let mut cmd = ProcCommand::new(config.ffmpeg_cmd());
        cmd.args(["-loglevel", "error", "-nostdin", "-noautorotate", "-i"]).arg(input);
        if (width, height) != (info.width, info.height) {
            cmd.arg("-vf").arg(format!("scale={}:{}", width, height));
        }
        cmd.args(["-map", "0:v:0", "-vsync", "passthrough", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"]);

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| JobError::decode(format!("running {}: {}", config.ffmpeg_cmd(), e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobError::decode("ffmpeg stdout unavailable"))?;
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        debug!(
            input = %input.display(),
            width,
            height,
            fps = info.fps,
            frames_total = ?info.frames_total,
            "Opened ffmpeg frame source"
        );

        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            stderr,
            width,
            height,
            fps: info.fps,
            frames_total: info.frames_total,
            next_index: 0,
            finished: false,
        })
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Read one whole frame. `Ok(false)` means a clean end of stream.
    fn read_frame(&mut self, buf: &mut [u8]) -> JobResult<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(JobError::decode(format!("reading decoded frame: {}", e))),
            }
        }
        match filled {
            0 => Ok(false),
            n if n == buf.len() => Ok(true),
            n => Err(JobError::decode(format!(
                "truncated frame {}: got {} of {} bytes",
                self.next_index,
                n,
                buf.len()
            ))),
        }
    }

    fn finish(&mut self) -> JobResult<()> {
        self.finished = true;
        let status = self
            .child
            .wait()
            .map_err(|e| JobError::decode(format!("waiting for ffmpeg: {}", e)))?;
        let stderr = self.stderr.take().and_then(|h| h.join().ok()).unwrap_or_default();
        if !status.success() {
            return Err(JobError::decode(format!("ffmpeg decode failed ({}): {}", status, stderr.trim())));
        }
        Ok(())
    }
}

impl FrameSource for FfmpegFrameSource {
    fn frames_total(&self) -> Option<u64> {
        self.frames_total
    }

    fn next_frame(&mut self) -> JobResult<Option<RawFrame>> {
        if self.finished {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.frame_len()];
        if !self.read_frame(&mut buf)? {
            self.finish()?;
            return Ok(None);
        }
        let image = RgbImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| JobError::invariant("decoded buffer does not match frame size"))?;
        let timestamp = self.next_index as f64 / self.fps;
        self.next_index += 1;
        Ok(Some(RawFrame::new(image, timestamp)))
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.child.kill() {
                warn!("failed to stop ffmpeg decoder: {}", e);
            }
            let _ = self.child.wait();
        }
    }
}

/// Default factory: every input is a file path decoded by ffmpeg.
#[derive(Debug, Clone, Default)]
pub struct FfmpegSourceFactory {
    config: FfmpegConfig,
}

impl FfmpegSourceFactory {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }
}

impl SourceFactory for FfmpegSourceFactory {
    fn open(&self, input: &Path) -> JobResult<Box<dyn FrameSource>> {
        Ok(Box::new(FfmpegFrameSource::open(&self.config, input)?))
    }
}

/// Lists the video files directly inside `dir`, sorted by name.
pub fn find_video_files(dir: &Path) -> Vec<PathBuf> {
    const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "flv", "wmv", "webm", "m4v", "ts"];

    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_parse_count_skips_placeholders() {
        assert_eq!(parse_count(Some(&"120".to_string())), Some(120));
        assert_eq!(parse_count(Some(&"N/A".to_string())), None);
        assert_eq!(parse_count(Some(&"0".to_string())), None);
        assert_eq!(parse_count(None), None);
    }

    #[test]
    fn test_decode_dimensions_clamp_width() {
        assert_eq!(decode_dimensions(640, 480, 960), (640, 480));
        assert_eq!(decode_dimensions(1920, 1080, 960), (960, 540));
        assert_eq!(decode_dimensions(1921, 1081, 961), (960, 540));
        assert_eq!(decode_dimensions(1920, 1080, 0), (1920, 1080));
    }

    #[test]
    fn test_memory_source_yields_in_order() {
        let frames = (0..3).map(|i| RawFrame::new(RgbImage::from_pixel(4, 4, image::Rgb([i as u8; 3])), i as f64)).collect();
        let mut source = MemoryFrameSource::new(frames);
        assert_eq!(source.frames_total(), Some(3));
        let mut stamps = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            stamps.push(frame.timestamp);
        }
        assert_eq!(stamps, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_missing_input_is_a_decode_error() {
        let err = probe_stream(&FfmpegConfig::default(), Path::new("/definitely/not/here.mp4")).unwrap_err();
        assert!(matches!(err, JobError::Decode(_)));
    }

    #[test]
    fn test_find_video_files_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.MP4", "a.mkv", "notes.txt", "c.png"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let names: Vec<String> = find_video_files(dir.path())
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.mkv", "b.MP4"]);
    }
}
