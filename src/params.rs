//! Conversion parameters, glyph ramps and submission-time validation.

use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{JobError, JobResult};

pub const WIDTH_RANGE: RangeInclusive<u32> = 10..=240;
pub const TONE_RANGE: RangeInclusive<f32> = 0.5..=2.0;
pub const FPS_RANGE: RangeInclusive<u32> = 1..=60;
pub const QUALITY_RANGE: RangeInclusive<u8> = 0..=51;

const NORMAL_RAMP: &[char] = &[' ', '.', ':', '-', '=', '+', '*', '#', '%', '@'];
const INVERTED_RAMP: &[char] = &['@', '%', '#', '*', '+', '=', '-', ':', '.', ' '];
const DOTS_RAMP: &[char] = &[' ', '∙', '·', '∘', '○', '◎', '●'];
const GRADIENT_RAMP: &[char] = &[' ', '░', '▒', '▓', '█'];

/// ASCII rendering style. Each variant owns an immutable glyph ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    #[default]
    Normal,
    Inverted,
    Dots,
    Gradient,
}

impl Style {
    pub const ALL: [Style; 4] = [Style::Normal, Style::Inverted, Style::Dots, Style::Gradient];

    /// Glyphs ordered from the first (lowest luminance bucket) to the last.
    pub fn ramp(&self) -> &'static [char] {
        match self {
            Style::Normal => NORMAL_RAMP,
            Style::Inverted => INVERTED_RAMP,
            Style::Dots => DOTS_RAMP,
            Style::Gradient => GRADIENT_RAMP,
        }
    }

    pub fn glyph(&self, index: u8) -> char {
        let ramp = self.ramp();
        ramp[(index as usize).min(ramp.len() - 1)]
    }

    /// Ink density in [0, 1] of the glyph at `index`, used when no font is
    /// available to rasterize the glyph itself.
    pub fn density(&self, index: u8) -> f32 {
        let last = (self.ramp().len() - 1) as f32;
        let rank = (index as f32).min(last) / last;
        match self {
            Style::Inverted => 1.0 - rank,
            _ => rank,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Style::Normal => "normal",
            Style::Inverted => "inverted",
            Style::Dots => "dots",
            Style::Gradient => "gradient",
        }
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Style {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Style::ALL
            .into_iter()
            .find(|style| style.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let available = Style::ALL.map(|s| s.as_str()).join(", ");
                JobError::invalid(format!("unknown style '{}'. Available styles: {}", s, available))
            })
    }
}

/// An opaque RGB color, written as `#RRGGBB` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const GREEN: Rgb = Rgb::new(0, 255, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

impl FromStr for Rgb {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix('#')
            .filter(|h| h.len() == 6 && h.is_ascii())
            .ok_or_else(|| JobError::invalid(format!("color '{}' must be in #RRGGBB form", s)))?;
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| JobError::invalid(format!("color '{}' is not valid hex", s)))
        };
        Ok(Rgb::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl TryFrom<String> for Rgb {
    type Error = JobError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rgb> for String {
    fn from(value: Rgb) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Which artifacts a job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputToggles {
    pub save_txt: bool,
    pub save_png: bool,
    pub save_mp4: bool,
}

impl Default for OutputToggles {
    fn default() -> Self {
        Self {
            save_txt: false,
            save_png: true,
            save_mp4: true,
        }
    }
}

impl OutputToggles {
    /// Images are rendered whenever they are kept or needed by the muxer.
    pub fn needs_images(&self) -> bool {
        self.save_png || self.save_mp4
    }
}

/// Immutable rendering parameters of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobParameters {
    /// Output width in characters
    pub width: u32,
    pub style: Style,
    pub brightness: f32,
    pub contrast: f32,
    pub gamma: f32,
    /// Draw a new text/background color for every frame
    pub random_colors: bool,
    /// Render image frames with a fully transparent background
    pub transparent_bg: bool,
    pub bg_color: Rgb,
    pub text_color: Rgb,
    /// Playback rate of the assembled video
    pub fps: u32,
    /// Encoder CRF, 0 is lossless and 51 the worst
    pub quality: u8,
    #[serde(flatten)]
    pub outputs: OutputToggles,
}

impl Default for JobParameters {
    fn default() -> Self {
        Self {
            width: 120,
            style: Style::Normal,
            brightness: 1.0,
            contrast: 1.0,
            gamma: 1.0,
            random_colors: false,
            transparent_bg: false,
            bg_color: Rgb::BLACK,
            text_color: Rgb::GREEN,
            fps: 30,
            quality: 23,
            outputs: OutputToggles::default(),
        }
    }
}

impl JobParameters {
    pub fn with_width(mut self, width: u32) -> Self {
        self.width = width;
        self
    }

    pub fn with_style(mut self, style: Style) -> Self {
        self.style = style;
        self
    }

    pub fn with_tone(mut self, brightness: f32, contrast: f32, gamma: f32) -> Self {
        self.brightness = brightness;
        self.contrast = contrast;
        self.gamma = gamma;
        self
    }

    pub fn with_outputs(mut self, outputs: OutputToggles) -> Self {
        self.outputs = outputs;
        self
    }

    /// Check every bound. Downstream stages rely on this having passed.
    pub fn validate(&self) -> JobResult<()> {
        if !WIDTH_RANGE.contains(&self.width) {
            return Err(JobError::invalid(format!(
                "width {} is outside {}..={}",
                self.width,
                WIDTH_RANGE.start(),
                WIDTH_RANGE.end()
            )));
        }
        for (name, value) in [
            ("brightness", self.brightness),
            ("contrast", self.contrast),
            ("gamma", self.gamma),
        ] {
            if !TONE_RANGE.contains(&value) {
                return Err(JobError::invalid(format!(
                    "{} {} is outside {}..={}",
                    name,
                    value,
                    TONE_RANGE.start(),
                    TONE_RANGE.end()
                )));
            }
        }
        if !FPS_RANGE.contains(&self.fps) {
            return Err(JobError::invalid(format!(
                "fps {} is outside {}..={}",
                self.fps,
                FPS_RANGE.start(),
                FPS_RANGE.end()
            )));
        }
        if !QUALITY_RANGE.contains(&self.quality) {
            return Err(JobError::invalid(format!(
                "quality {} is outside {}..={}",
                self.quality,
                QUALITY_RANGE.start(),
                QUALITY_RANGE.end()
            )));
        }
        let OutputToggles {
            save_txt,
            save_png,
            save_mp4,
        } = self.outputs;
        if !(save_txt || save_png || save_mp4) {
            return Err(JobError::invalid("at least one of save_txt, save_png, save_mp4 must be set"));
        }
        Ok(())
    }
}

/// A conversion request: what to read and how to render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Locator of the source video, resolved by the configured source factory
    pub input: PathBuf,
    #[serde(default)]
    pub params: JobParameters,
}

impl JobRequest {
    pub fn new(input: impl Into<PathBuf>, params: JobParameters) -> Self {
        Self {
            input: input.into(),
            params,
        }
    }
}
