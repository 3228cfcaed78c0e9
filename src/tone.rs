//! Brightness, contrast and gamma adjustment of decoded frames.

use image::RgbImage;

/// Tone correction for one job. Parameters are bounds-checked at submission.
///
/// Stages run in order on every channel value:
/// brightness scales linearly, contrast stretches around the frame mean,
/// gamma remaps `v -> 255 * (v / 255)^(1 / gamma)`.
/// With all three at 1.0 the transform is the identity.
#[derive(Debug, Clone)]
pub struct ToneCorrector {
    brightness: f32,
    contrast: f32,
    gamma_lut: Option<[u8; 256]>,
}

fn clamp_u8(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

impl ToneCorrector {
    pub fn new(brightness: f32, contrast: f32, gamma: f32) -> Self {
        let gamma_lut = (gamma != 1.0).then(|| {
            let inv = 1.0 / gamma as f64;
            let mut lut = [0u8; 256];
            for (i, slot) in lut.iter_mut().enumerate() {
                *slot = clamp_u8((i as f64 / 255.0).powf(inv) * 255.0);
            }
            lut
        });
        Self {
            brightness,
            contrast,
            gamma_lut,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.brightness == 1.0 && self.contrast == 1.0 && self.gamma_lut.is_none()
    }

    fn bright(&self, v: u8) -> u8 {
        if self.brightness == 1.0 {
            v
        } else {
            clamp_u8(v as f64 * self.brightness as f64)
        }
    }

    /// Build the per-value lookup table for `frame`; contrast needs the frame mean.
    fn lookup_table(&self, frame: &RgbImage) -> [u8; 256] {
        let mut bright = [0u8; 256];
        for (i, slot) in bright.iter_mut().enumerate() {
            *slot = self.bright(i as u8);
        }

        let mean = if self.contrast == 1.0 {
            0.0
        } else {
            let mut histogram = [0u64; 256];
            for &v in frame.as_raw() {
                histogram[v as usize] += 1;
            }
            let count: u64 = histogram.iter().sum();
            let sum: f64 = histogram
                .iter()
                .enumerate()
                .map(|(v, n)| bright[v] as f64 * *n as f64)
                .sum();
            if count == 0 {
                0.0
            } else {
                sum / count as f64
            }
        };

        let mut lut = [0u8; 256];
        for (i, slot) in lut.iter_mut().enumerate() {
            let mut v = bright[i];
            if self.contrast != 1.0 {
                v = clamp_u8((v as f64 - mean) * self.contrast as f64 + mean);
            }
            if let Some(gamma) = &self.gamma_lut {
                v = gamma[v as usize];
            }
            *slot = v;
        }
        lut
    }

    pub fn apply(&self, frame: &RgbImage) -> RgbImage {
        let mut out = frame.clone();
        self.apply_in_place(&mut out);
        out
    }

    pub fn apply_in_place(&self, frame: &mut RgbImage) {
        if self.is_identity() {
            return;
        }
        let lut = self.lookup_table(frame);
        for v in frame.iter_mut() {
            *v = lut[*v as usize];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient_frame() -> RgbImage {
        RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 16) as u8, (y * 16) as u8, ((x + y) * 8) as u8]))
    }

    #[test]
    fn test_identity_round_trip() {
        let frame = gradient_frame();
        let corrected = ToneCorrector::new(1.0, 1.0, 1.0).apply(&frame);
        assert_eq!(corrected, frame);
    }

    #[test]
    fn test_brightness_scales_and_clamps() {
        let frame = RgbImage::from_pixel(2, 2, Rgb([100, 200, 10]));
        let out = ToneCorrector::new(2.0, 1.0, 1.0).apply(&frame);
        assert_eq!(out.get_pixel(0, 0), &Rgb([200, 255, 20]));
        let out = ToneCorrector::new(0.5, 1.0, 1.0).apply(&frame);
        assert_eq!(out.get_pixel(1, 1), &Rgb([50, 100, 5]));
    }

    #[test]
    fn test_contrast_leaves_uniform_frame_alone() {
        let frame = RgbImage::from_pixel(4, 4, Rgb([90, 90, 90]));
        let out = ToneCorrector::new(1.0, 2.0, 1.0).apply(&frame);
        assert_eq!(out, frame);
    }

    #[test]
    fn test_contrast_spreads_values_around_mean() {
        let mut frame = RgbImage::from_pixel(2, 1, Rgb([100, 100, 100]));
        frame.put_pixel(1, 0, Rgb([200, 200, 200]));
        let out = ToneCorrector::new(1.0, 2.0, 1.0).apply(&frame);
        assert_eq!(out.get_pixel(0, 0), &Rgb([50, 50, 50]));
        assert_eq!(out.get_pixel(1, 0), &Rgb([250, 250, 250]));
    }

    #[test]
    fn test_gamma_above_one_brightens_midtones() {
        let frame = RgbImage::from_pixel(1, 1, Rgb([64, 128, 255]));
        let out = ToneCorrector::new(1.0, 1.0, 2.0).apply(&frame);
        let px = out.get_pixel(0, 0);
        assert!(px[0] > 64 && px[1] > 128);
        assert_eq!(px[2], 255);
        let darker = ToneCorrector::new(1.0, 1.0, 0.5).apply(&frame);
        assert!(darker.get_pixel(0, 0)[1] < 128);
    }
}
