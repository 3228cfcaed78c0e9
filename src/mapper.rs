//! Luminance quantization of frames into glyph grids.

use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::params::Style;

/// Grid of glyph indices into a style's ramp, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlyphGrid {
    columns: u32,
    rows: u32,
    style: Style,
    cells: Vec<u8>,
}

impl GlyphGrid {
    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn style(&self) -> Style {
        self.style
    }

    pub fn index(&self, col: u32, row: u32) -> u8 {
        self.cells[(row * self.columns + col) as usize]
    }

    pub fn indices(&self) -> &[u8] {
        &self.cells
    }

    pub fn glyph(&self, col: u32, row: u32) -> char {
        self.style.glyph(self.index(col, row))
    }

    /// Plain text rendering, one line per row.
    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity((self.columns as usize + 1) * self.rows as usize * 3);
        for row in self.cells.chunks(self.columns as usize) {
            out.extend(row.iter().map(|&i| self.style.glyph(i)));
            out.push('\n');
        }
        out
    }
}

fn luminance(px: &image::Rgb<u8>) -> f32 {
    0.2126 * px[0] as f32 + 0.7152 * px[1] as f32 + 0.0722 * px[2] as f32
}

/// Resamples frames to a character grid and picks a glyph per cell.
#[derive(Debug, Clone, Copy)]
pub struct AsciiMapper {
    char_aspect: f32,
}

impl Default for AsciiMapper {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl AsciiMapper {
    /// `char_aspect` is glyph width over glyph height as rendered.
    pub fn new(char_aspect: f32) -> Self {
        Self { char_aspect }
    }

    /// Rows needed for `columns` so the output keeps the frame's proportions.
    pub fn rows_for(&self, frame_width: u32, frame_height: u32, columns: u32) -> u32 {
        let rows = frame_height as f32 / frame_width.max(1) as f32 * columns as f32 * self.char_aspect;
        (rows.round() as u32).max(1)
    }

    pub fn map(&self, frame: &RgbImage, columns: u32, style: Style) -> GlyphGrid {
        let columns = columns.max(1);
        let (w, h) = frame.dimensions();
        let rows = self.rows_for(w, h, columns);

        let sampled = if (w, h) == (columns, rows) {
            frame.clone()
        } else {
            imageops::resize(frame, columns, rows, FilterType::Triangle)
        };

        let luma: Vec<f32> = sampled.pixels().map(luminance).collect();
        let (min, max) = luma
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), &l| (lo.min(l), hi.max(l)));

        let buckets = style.ramp().len();
        let cells = if luma.is_empty() || max <= min {
            vec![0u8; luma.len()]
        } else {
            let range = max - min;
            luma.iter()
                .map(|&l| {
                    let bucket = ((l - min) / range * buckets as f32) as usize;
                    bucket.min(buckets - 1) as u8
                })
                .collect()
        };

        GlyphGrid {
            columns,
            rows,
            style,
            cells,
        }
    }
}
