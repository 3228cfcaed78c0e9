//! Service configuration: TOML file, environment overrides, built-in defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Where random per-frame colors are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RandomPalette {
    /// Fixed set of named terminal palettes
    #[default]
    Named,
    /// Any RGB value
    Uniform,
}

/// Image rendering settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    /// TTF/OTF used to rasterize glyphs; coverage blocks are drawn without one
    pub font_path: Option<PathBuf>,
    pub cell_width: u32,
    pub cell_height: u32,
    /// Glyph width divided by glyph height, used to keep rows from stretching
    pub char_aspect: f32,
    pub random_palette: RandomPalette,
    pub random_seed: Option<u64>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            cell_width: 8,
            cell_height: 16,
            char_aspect: 0.5,
            random_palette: RandomPalette::Named,
            random_seed: None,
        }
    }
}

/// External tool locations and encoder settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FfmpegConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub encode_preset: String,
    /// Sources wider than this are downscaled by the decoder
    pub decode_max_width: u32,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            encode_preset: "medium".to_string(),
            decode_max_width: 960,
        }
    }
}

impl FfmpegConfig {
    pub fn ffmpeg_cmd(&self) -> &str {
        &self.ffmpeg
    }

    pub fn ffprobe_cmd(&self) -> &str {
        &self.ffprobe
    }
}

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub max_concurrent_jobs: usize,
    pub job_timeout_secs: u64,
    /// How long a timed-out pipeline may take to acknowledge cancellation.
    /// After that the job fails and its slot is reused, but the pipeline thread
    /// cannot be stopped: it keeps decoding until its next frame boundary, so
    /// more than `max_concurrent_jobs` pipelines may briefly run, and it may
    /// write into a job directory that cleanup has already removed.
    pub cancel_grace_secs: u64,
    pub results_dir: PathBuf,
    pub retention_hours: u64,
    pub keep_failed_jobs: bool,
    /// Frames whose tone/mapping/compose stages run in parallel
    pub compute_batch: usize,
    /// Capacity of the progress broadcast channel
    pub event_buffer: usize,
    pub ffmpeg: FfmpegConfig,
    pub render: RenderConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            job_timeout_secs: 600,
            cancel_grace_secs: 30,
            results_dir: PathBuf::from("./results"),
            retention_hours: 24,
            keep_failed_jobs: true,
            compute_batch: 4,
            event_buffer: 1024,
            ffmpeg: FfmpegConfig::default(),
            render: RenderConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: AppConfig = toml::from_str(text).context("parsing config toml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("loading config {}", path.display()))
    }

    /// Resolve configuration: explicit path, user config dir, working dir, defaults.
    /// Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut cfg = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let mut tried: Vec<PathBuf> = Vec::new();
                if let Some(mut d) = dirs::config_dir() {
                    d.push("asciivid");
                    d.push("asciivid.toml");
                    tried.push(d);
                }
                tried.push(PathBuf::from("asciivid.toml"));

                match tried.iter().find(|p| p.exists()) {
                    Some(path) => Self::from_file(path)?,
                    None => Self::default(),
                }
            }
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `ASCIIVID_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| anyhow!("environment variable {} has invalid value '{}'", key, raw))
        }

        if let Some(v) = lookup("ASCIIVID_MAX_JOBS") {
            self.max_concurrent_jobs = parse("ASCIIVID_MAX_JOBS", v)?;
        }
        if let Some(v) = lookup("ASCIIVID_JOB_TIMEOUT_SECS") {
            self.job_timeout_secs = parse("ASCIIVID_JOB_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("ASCIIVID_RETENTION_HOURS") {
            self.retention_hours = parse("ASCIIVID_RETENTION_HOURS", v)?;
        }
        if let Some(v) = lookup("ASCIIVID_RESULTS_DIR") {
            self.results_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ASCIIVID_FFMPEG") {
            self.ffmpeg.ffmpeg = v;
        }
        if let Some(v) = lookup("ASCIIVID_FFPROBE") {
            self.ffmpeg.ffprobe = v;
        }
        if let Some(v) = lookup("ASCIIVID_FONT") {
            self.render.font_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(anyhow!("max_concurrent_jobs must be at least 1"));
        }
        if self.compute_batch == 0 {
            return Err(anyhow!("compute_batch must be at least 1"));
        }
        if self.event_buffer == 0 {
            return Err(anyhow!("event_buffer must be at least 1"));
        }
        if self.render.cell_width == 0 || self.render.cell_height == 0 {
            return Err(anyhow!("render cell size must be non-zero"));
        }
        if !(self.render.char_aspect > 0.0 && self.render.char_aspect.is_finite()) {
            return Err(anyhow!("render.char_aspect must be a positive number"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = AppConfig::from_toml_str(
            r#"
            max_concurrent_jobs = 2
            [render]
            cell_width = 6
            random_palette = "uniform"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_concurrent_jobs, 2);
        assert_eq!(cfg.job_timeout_secs, 600);
        assert_eq!(cfg.render.cell_width, 6);
        assert_eq!(cfg.render.cell_height, 16);
        assert_eq!(cfg.render.random_palette, RandomPalette::Uniform);
        assert_eq!(cfg.ffmpeg.ffmpeg_cmd(), "ffmpeg");
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(AppConfig::from_toml_str("max_jobs = 3").is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(AppConfig::from_toml_str("max_concurrent_jobs = 0").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ASCIIVID_MAX_JOBS", "7"),
            ("ASCIIVID_RESULTS_DIR", "/tmp/ascii"),
            ("ASCIIVID_FONT", "/fonts/mono.ttf"),
        ]);
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.max_concurrent_jobs, 7);
        assert_eq!(cfg.results_dir, PathBuf::from("/tmp/ascii"));
        assert_eq!(cfg.render.font_path, Some(PathBuf::from("/fonts/mono.ttf")));
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut cfg = AppConfig::default();
        let err = cfg
            .apply_env_overrides(|k| (k == "ASCIIVID_JOB_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("ASCIIVID_JOB_TIMEOUT_SECS"));
    }
}
