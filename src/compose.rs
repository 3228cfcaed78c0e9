//! Color assignment and rendering of glyph grids into text and RGBA images.

use std::path::Path;
use std::sync::Arc;

use ab_glyph::{point, Font, FontVec, PxScale, ScaleFont};
use image::{Rgba, RgbaImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{RandomPalette, RenderConfig};
use crate::error::{JobError, JobResult};
use crate::mapper::GlyphGrid;
use crate::params::{JobParameters, Rgb, Style};

/// Named terminal palettes used for random colors: (name, text, background).
pub const NAMED_PALETTES: &[(&str, Rgb, Rgb)] = &[
    ("green", Rgb::new(0x00, 0xFF, 0x00), Rgb::BLACK),
    ("amber", Rgb::new(0xFF, 0xAA, 0x00), Rgb::BLACK),
    ("blue", Rgb::new(0x00, 0xAA, 0xFF), Rgb::BLACK),
    ("purple", Rgb::new(0xFF, 0x00, 0xFF), Rgb::BLACK),
    ("white", Rgb::new(0xFF, 0xFF, 0xFF), Rgb::BLACK),
    ("monochrome", Rgb::new(0xCC, 0xCC, 0xCC), Rgb::BLACK),
];

/// Colors of one frame. A `None` background is fully transparent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePalette {
    pub text: Rgb,
    pub background: Option<Rgb>,
}

/// Glyph grid plus its colors and source timestamp.
#[derive(Debug, Clone)]
pub struct AsciiFrame {
    pub grid: GlyphGrid,
    pub palette: FramePalette,
    pub timestamp: f64,
}

/// Output of composition: text always, image when requested.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub text: String,
    pub image: Option<RgbaImage>,
    pub timestamp: f64,
}

/// Per-frame palette chooser. Draws happen in frame order so a seed reproduces a job.
pub struct PaletteSource {
    fixed: FramePalette,
    random: Option<(RandomPalette, StdRng)>,
}

impl PaletteSource {
    pub fn new(params: &JobParameters, render: &RenderConfig) -> Self {
        let fixed = FramePalette {
            text: params.text_color,
            background: (!params.transparent_bg).then_some(params.bg_color),
        };
        let random = params.random_colors.then(|| {
            let rng = match render.random_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            (render.random_palette, rng)
        });
        Self { fixed, random }
    }

    pub fn next_palette(&mut self) -> FramePalette {
        let Some((mode, rng)) = self.random.as_mut() else {
            return self.fixed;
        };
        let (text, background) = match mode {
            RandomPalette::Named => {
                let (_, fg, bg) = NAMED_PALETTES[rng.random_range(0..NAMED_PALETTES.len())];
                (fg, bg)
            }
            RandomPalette::Uniform => (
                Rgb::new(rng.random(), rng.random(), rng.random()),
                Rgb::new(rng.random(), rng.random(), rng.random()),
            ),
        };
        FramePalette {
            text,
            background: self.fixed.background.map(|_| background),
        }
    }
}

/// Load a TTF/OTF font for glyph rasterization.
pub fn load_font(path: &Path) -> JobResult<FontVec> {
    let bytes = std::fs::read(path)?;
    FontVec::try_from_vec(bytes)
        .map_err(|e| JobError::invalid(format!("failed to parse font {}: {}", path.display(), e)))
}

/// Pre-rasterized coverage masks, one per glyph of a style's ramp.
#[derive(Debug, Clone)]
pub struct GlyphAtlas {
    cell_width: u32,
    cell_height: u32,
    masks: Vec<Vec<u8>>,
}

impl GlyphAtlas {
    /// Rasterize each ramp glyph with `font`, fitted into one cell.
    pub fn from_font(font: &FontVec, style: Style, cell_width: u32, cell_height: u32) -> Self {
        let mut scale = PxScale::from(cell_height as f32);
        let widest = style
            .ramp()
            .iter()
            .map(|&ch| font.as_scaled(scale).h_advance(font.glyph_id(ch)))
            .fold(0.0f32, f32::max);
        if widest > cell_width as f32 {
            let shrink = cell_width as f32 / widest;
            scale = PxScale::from(cell_height as f32 * shrink);
        }
        let scaled = font.as_scaled(scale);
        let ascent = scaled.ascent();
        let descent = scaled.descent();
        let baseline = ((cell_height as f32 - (ascent - descent)) / 2.0).max(0.0) + ascent;

        let masks = style
            .ramp()
            .iter()
            .map(|&ch| {
                let mut mask = vec![0u8; (cell_width * cell_height) as usize];
                let id = font.glyph_id(ch);
                let x0 = ((cell_width as f32 - scaled.h_advance(id)) / 2.0).max(0.0);
                let glyph = id.with_scale_and_position(scale, point(x0, baseline));
                if let Some(outlined) = font.outline_glyph(glyph) {
                    let bounds = outlined.px_bounds();
                    outlined.draw(|gx, gy, coverage| {
                        let x = bounds.min.x as i32 + gx as i32;
                        let y = bounds.min.y as i32 + gy as i32;
                        if x >= 0 && y >= 0 && (x as u32) < cell_width && (y as u32) < cell_height {
                            let idx = (y as u32 * cell_width + x as u32) as usize;
                            let value = (coverage.clamp(0.0, 1.0) * 255.0).round() as u8;
                            mask[idx] = mask[idx].max(value);
                        }
                    });
                }
                mask
            })
            .collect();

        Self {
            cell_width,
            cell_height,
            masks,
        }
    }

    /// Font-less fallback: a centered solid block whose area matches the glyph's ink density.
    pub fn coverage(style: Style, cell_width: u32, cell_height: u32) -> Self {
        let masks = (0..style.ramp().len())
            .map(|i| {
                let side = style.density(i as u8).sqrt();
                let bw = (cell_width as f32 * side).round() as u32;
                let bh = (cell_height as f32 * side).round() as u32;
                let x0 = (cell_width - bw) / 2;
                let y0 = (cell_height - bh) / 2;
                let mut mask = vec![0u8; (cell_width * cell_height) as usize];
                for y in y0..y0 + bh {
                    for x in x0..x0 + bw {
                        mask[(y * cell_width + x) as usize] = 255;
                    }
                }
                mask
            })
            .collect();

        Self {
            cell_width,
            cell_height,
            masks,
        }
    }

    pub fn cell_size(&self) -> (u32, u32) {
        (self.cell_width, self.cell_height)
    }

    fn mask(&self, index: u8) -> &[u8] {
        &self.masks[(index as usize).min(self.masks.len() - 1)]
    }
}

fn even(n: u32) -> u32 {
    n + (n % 2)
}

fn blend(fg: Rgb, background: Option<Rgb>, coverage: u8) -> Rgba<u8> {
    match background {
        None => Rgba([fg.r, fg.g, fg.b, coverage]),
        Some(bg) => {
            let a = coverage as u32;
            let mix = |f: u8, b: u8| ((f as u32 * a + b as u32 * (255 - a) + 127) / 255) as u8;
            Rgba([mix(fg.r, bg.r), mix(fg.g, bg.g), mix(fg.b, bg.b), 255])
        }
    }
}

/// Turns glyph grids into renderable frames for one job.
#[derive(Debug, Clone)]
pub struct ColorComposer {
    atlas: Arc<GlyphAtlas>,
}

impl ColorComposer {
    pub fn new(atlas: Arc<GlyphAtlas>) -> Self {
        Self { atlas }
    }

    /// Build the atlas for `style` from the configured font, or coverage blocks without one.
    pub fn for_style(style: Style, render: &RenderConfig, font: Option<&FontVec>) -> Self {
        let atlas = match font {
            Some(font) => GlyphAtlas::from_font(font, style, render.cell_width, render.cell_height),
            None => GlyphAtlas::coverage(style, render.cell_width, render.cell_height),
        };
        Self::new(Arc::new(atlas))
    }

    pub fn compose(&self, frame: &AsciiFrame, with_image: bool) -> RenderedFrame {
        RenderedFrame {
            text: frame.grid.to_text(),
            image: with_image.then(|| self.render_image(frame)),
            timestamp: frame.timestamp,
        }
    }

    /// Image dimensions are padded to even numbers for the video encoder.
    pub fn render_image(&self, frame: &AsciiFrame) -> RgbaImage {
        let (cw, ch) = self.atlas.cell_size();
        let grid = &frame.grid;
        let width = even(grid.columns() * cw);
        let height = even(grid.rows() * ch);
        let FramePalette { text, background } = frame.palette;

        let fill = blend(text, background, 0);
        let mut image = RgbaImage::from_pixel(width, height, fill);
        for row in 0..grid.rows() {
            for col in 0..grid.columns() {
                let mask = self.atlas.mask(grid.index(col, row));
                for y in 0..ch {
                    for x in 0..cw {
                        let coverage = mask[(y * cw + x) as usize];
                        if coverage > 0 {
                            image.put_pixel(col * cw + x, row * ch + y, blend(text, background, coverage));
                        }
                    }
                }
            }
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::AsciiMapper;
    use image::RgbImage;

    fn grid(style: Style) -> GlyphGrid {
        let frame = RgbImage::from_fn(30, 12, |x, _| image::Rgb([(x * 8) as u8; 3]));
        AsciiMapper::new(0.5).map(&frame, 15, style)
    }

    fn render() -> RenderConfig {
        RenderConfig {
            cell_width: 5,
            cell_height: 6,
            ..RenderConfig::default()
        }
    }

    #[test]
    fn test_fixed_palette_without_random_colors() {
        let params = JobParameters::default();
        let mut source = PaletteSource::new(&params, &render());
        let first = source.next_palette();
        for _ in 0..10 {
            assert_eq!(source.next_palette(), first);
        }
        assert_eq!(first.text, Rgb::GREEN);
        assert_eq!(first.background, Some(Rgb::BLACK));
    }

    #[test]
    fn test_random_palette_varies_across_frames() {
        let params = JobParameters {
            random_colors: true,
            ..JobParameters::default()
        };
        for mode in [RandomPalette::Named, RandomPalette::Uniform] {
            let cfg = RenderConfig {
                random_palette: mode,
                random_seed: Some(7),
                ..render()
            };
            let mut source = PaletteSource::new(&params, &cfg);
            let palettes: Vec<FramePalette> = (0..32).map(|_| source.next_palette()).collect();
            assert!(palettes.iter().any(|p| *p != palettes[0]), "mode {:?}", mode);
        }
    }

    #[test]
    fn test_seeded_palettes_are_reproducible() {
        let params = JobParameters {
            random_colors: true,
            ..JobParameters::default()
        };
        let cfg = RenderConfig {
            random_seed: Some(42),
            ..render()
        };
        let a: Vec<_> = {
            let mut s = PaletteSource::new(&params, &cfg);
            (0..8).map(|_| s.next_palette()).collect()
        };
        let b: Vec<_> = {
            let mut s = PaletteSource::new(&params, &cfg);
            (0..8).map(|_| s.next_palette()).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_transparent_background_stays_transparent_with_random_colors() {
        let params = JobParameters {
            random_colors: true,
            transparent_bg: true,
            ..JobParameters::default()
        };
        let mut source = PaletteSource::new(&params, &render());
        assert!((0..5).all(|_| source.next_palette().background.is_none()));
    }

    #[test]
    fn test_image_has_even_dimensions_and_background() {
        let composer = ColorComposer::for_style(Style::Normal, &render(), None);
        let frame = AsciiFrame {
            grid: grid(Style::Normal),
            palette: FramePalette {
                text: Rgb::new(255, 0, 0),
                background: Some(Rgb::new(0, 0, 255)),
            },
            timestamp: 1.5,
        };
        let rendered = composer.compose(&frame, true);
        let image = rendered.image.unwrap();
        assert_eq!(image.width() % 2, 0);
        assert_eq!(image.height() % 2, 0);
        assert_eq!(image.width(), 15 * 5 + 1);
        // Cell (0, 0) is the darkest bucket: a blank glyph over the background.
        assert_eq!(image.get_pixel(0, 0), &Rgba([0, 0, 255, 255]));
        assert!(image.pixels().any(|p| p == &Rgba([255, 0, 0, 255])));
        assert_eq!(rendered.timestamp, 1.5);
        assert_eq!(rendered.text.lines().count() as u32, frame.grid.rows());
    }

    #[test]
    fn test_transparent_background_has_zero_alpha() {
        let composer = ColorComposer::for_style(Style::Gradient, &render(), None);
        let frame = AsciiFrame {
            grid: grid(Style::Gradient),
            palette: FramePalette {
                text: Rgb::GREEN,
                background: None,
            },
            timestamp: 0.0,
        };
        let image = composer.render_image(&frame);
        assert_eq!(image.get_pixel(0, 0)[3], 0);
        assert!(image.pixels().any(|p| p[3] == 255));
    }

    #[test]
    fn test_text_only_skips_image() {
        let composer = ColorComposer::for_style(Style::Dots, &render(), None);
        let frame = AsciiFrame {
            grid: grid(Style::Dots),
            palette: FramePalette {
                text: Rgb::GREEN,
                background: Some(Rgb::BLACK),
            },
            timestamp: 0.0,
        };
        let rendered = composer.compose(&frame, false);
        assert!(rendered.image.is_none());
        assert!(rendered.text.contains('●'));
        let glyphs = rendered.text.chars().filter(|&c| c != '\n').count();
        assert_eq!(glyphs, (frame.grid.columns() * frame.grid.rows()) as usize);
    }

    #[test]
    fn test_coverage_masks_grow_with_density() {
        let atlas = GlyphAtlas::coverage(Style::Normal, 8, 16);
        let ink = |i: u8| atlas.mask(i).iter().filter(|&&v| v > 0).count();
        assert_eq!(ink(0), 0);
        assert_eq!(ink(9), 8 * 16);
        assert!(ink(3) < ink(6));
    }
}
