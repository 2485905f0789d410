//! Perceptual per-pixel diff.
//!
//! Pixels are compared in YIQ space after blending any translucency over a
//! white background. A pixel is a mismatch when its squared YIQ distance is
//! above `MAX_YIQ_DELTA * threshold^2`. Pixels that look like anti-aliasing on
//! either image are reported separately and not counted unless
//! [`DiffOptions::include_aa`] is set.

use super::RenderedImage;
use crate::{Error, Result};

/// Largest possible squared YIQ distance (black vs white)
const MAX_YIQ_DELTA: f64 = 35215.0;

/// Diff kernel options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffOptions {
    /// Sensitivity in `[0, 1]`; smaller is stricter
    pub threshold: f64,
    /// Count anti-aliased pixels as mismatches
    pub include_aa: bool,
    /// Opacity of the grayscale backdrop drawn for matching pixels
    pub alpha: f64,
    /// Color of mismatching pixels in the diff image
    pub diff_color: [u8; 3],
    /// Color of detected anti-aliasing in the diff image
    pub aa_color: [u8; 3],
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            include_aa: false,
            alpha: 0.1,
            diff_color: [255, 0, 0],
            aa_color: [255, 255, 0],
        }
    }
}

impl DiffOptions {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::ConfigError(format!(
                "diff threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(Error::ConfigError(format!(
                "diff alpha must be within [0, 1], got {}",
                self.alpha
            )));
        }
        Ok(())
    }
}

/// Outcome of comparing two equally sized images
#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult {
    pub mismatch_pixels: u64,
    pub total_pixels: u64,
    pub mismatch_percentage: f64,
    pub similarity_percentage: f64,
    /// Same size as the inputs: mismatches highlighted, matches faded to gray
    pub image: RenderedImage,
}

/// Compare `a` and `b` pixel by pixel.
///
/// Fails with [`Error::EmptyRegion`] when there are no pixels to compare and
/// with [`Error::InternalError`] when the dimensions differ.
pub fn diff(a: &RenderedImage, b: &RenderedImage, options: &DiffOptions) -> Result<DiffResult> {
    if a.width() != b.width() || a.height() != b.height() {
        return Err(Error::InternalError(format!(
            "diff inputs differ in size: {}x{} vs {}x{}",
            a.width(),
            a.height(),
            b.width(),
            b.height()
        )));
    }
    let (width, height) = (a.width(), a.height());
    let total_pixels = a.area();
    if total_pixels == 0 {
        return Err(Error::EmptyRegion { width, height });
    }

    let mut output = vec![0u8; a.pixels().len()];
    let mismatch_pixels = Kernel {
        img1: a.pixels(),
        img2: b.pixels(),
        width: width as usize,
        height: height as usize,
        options,
    }
    .run(&mut output);

    let mismatch_percentage = (mismatch_pixels as f64 / total_pixels as f64) * 100.0;
    Ok(DiffResult {
        mismatch_pixels,
        total_pixels,
        mismatch_percentage,
        similarity_percentage: 100.0 - mismatch_percentage,
        image: RenderedImage::from_rgba(width, height, output)?,
    })
}

struct Kernel<'a> {
    img1: &'a [u8],
    img2: &'a [u8],
    width: usize,
    height: usize,
    options: &'a DiffOptions,
}

impl Kernel<'_> {
    fn run(&self, output: &mut [u8]) -> u64 {
        let alpha = self.options.alpha;

        if self.img1 == self.img2 {
            for pos in (0..output.len()).step_by(4) {
                draw_gray_pixel(self.img1, pos, alpha, output);
            }
            return 0;
        }

        let max_delta = MAX_YIQ_DELTA * self.options.threshold * self.options.threshold;
        let mut mismatches = 0u64;

        for y in 0..self.height {
            for x in 0..self.width {
                let pos = (y * self.width + x) * 4;
                let delta = color_delta(self.img1, self.img2, pos, pos, false);

                if delta.abs() > max_delta {
                    if !self.options.include_aa && self.is_antialiased(x, y) {
                        draw_pixel(output, pos, self.options.aa_color);
                    } else {
                        draw_pixel(output, pos, self.options.diff_color);
                        mismatches += 1;
                    }
                } else {
                    draw_gray_pixel(self.img1, pos, alpha, output);
                }
            }
        }
        mismatches
    }

    // Checked from both sides so the count does not depend on argument order.
    fn is_antialiased(&self, x: usize, y: usize) -> bool {
        antialiased(self.img1, self.img2, x, y, self.width, self.height)
            || antialiased(self.img2, self.img1, x, y, self.width, self.height)
    }
}

/// Whether pixel (x1, y1) of `img` looks like an anti-aliased edge.
///
/// A pixel is anti-aliasing when at most two neighbours share its brightness
/// and its darkest or brightest neighbour sits inside a flat area in both images.
fn antialiased(img: &[u8], other: &[u8], x1: usize, y1: usize, width: usize, height: usize) -> bool {
    let x0 = x1.saturating_sub(1);
    let y0 = y1.saturating_sub(1);
    let x2 = (x1 + 1).min(width - 1);
    let y2 = (y1 + 1).min(height - 1);
    let pos = (y1 * width + x1) * 4;

    let mut zeroes = usize::from(x1 == x0 || x1 == x2 || y1 == y0 || y1 == y2);
    let mut min = 0.0;
    let mut max = 0.0;
    let mut min_at = (0, 0);
    let mut max_at = (0, 0);

    for x in x0..=x2 {
        for y in y0..=y2 {
            if x == x1 && y == y1 {
                continue;
            }
            let delta = color_delta(img, img, pos, (y * width + x) * 4, true);
            if delta == 0.0 {
                zeroes += 1;
                if zeroes > 2 {
                    return false;
                }
            } else if delta < min {
                min = delta;
                min_at = (x, y);
            } else if delta > max {
                max = delta;
                max_at = (x, y);
            }
        }
    }

    if min == 0.0 || max == 0.0 {
        return false;
    }

    (has_many_siblings(img, min_at.0, min_at.1, width, height)
        && has_many_siblings(other, min_at.0, min_at.1, width, height))
        || (has_many_siblings(img, max_at.0, max_at.1, width, height)
            && has_many_siblings(other, max_at.0, max_at.1, width, height))
}

/// Whether more than two neighbours of (x1, y1) have exactly its color.
fn has_many_siblings(img: &[u8], x1: usize, y1: usize, width: usize, height: usize) -> bool {
    let x0 = x1.saturating_sub(1);
    let y0 = y1.saturating_sub(1);
    let x2 = (x1 + 1).min(width - 1);
    let y2 = (y1 + 1).min(height - 1);
    let pos = (y1 * width + x1) * 4;

    let mut zeroes = usize::from(x1 == x0 || x1 == x2 || y1 == y0 || y1 == y2);
    for x in x0..=x2 {
        for y in y0..=y2 {
            if x == x1 && y == y1 {
                continue;
            }
            let pos2 = (y * width + x) * 4;
            if img[pos..pos + 4] == img[pos2..pos2 + 4] {
                zeroes += 1;
            }
            if zeroes > 2 {
                return true;
            }
        }
    }
    false
}

/// Squared YIQ distance between pixel `k` of `img1` and pixel `m` of `img2`.
///
/// The sign is negative when the first pixel is brighter. With `y_only` the
/// plain brightness difference is returned instead.
fn color_delta(img1: &[u8], img2: &[u8], k: usize, m: usize, y_only: bool) -> f64 {
    let (mut r1, mut g1, mut b1, a1) = rgba(img1, k);
    let (mut r2, mut g2, mut b2, a2) = rgba(img2, m);

    if a1 == a2 && r1 == r2 && g1 == g2 && b1 == b2 {
        return 0.0;
    }

    if a1 < 255.0 {
        let a = a1 / 255.0;
        r1 = blend(r1, a);
        g1 = blend(g1, a);
        b1 = blend(b1, a);
    }
    if a2 < 255.0 {
        let a = a2 / 255.0;
        r2 = blend(r2, a);
        g2 = blend(g2, a);
        b2 = blend(b2, a);
    }

    let y1 = rgb2y(r1, g1, b1);
    let y2 = rgb2y(r2, g2, b2);
    let y = y1 - y2;
    if y_only {
        return y;
    }

    let i = rgb2i(r1, g1, b1) - rgb2i(r2, g2, b2);
    let q = rgb2q(r1, g1, b1) - rgb2q(r2, g2, b2);
    let delta = 0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q;

    if y1 > y2 {
        -delta
    } else {
        delta
    }
}

fn rgba(img: &[u8], pos: usize) -> (f64, f64, f64, f64) {
    (
        f64::from(img[pos]),
        f64::from(img[pos + 1]),
        f64::from(img[pos + 2]),
        f64::from(img[pos + 3]),
    )
}

fn rgb2y(r: f64, g: f64, b: f64) -> f64 {
    r * 0.29889531 + g * 0.58662247 + b * 0.11448223
}

fn rgb2i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.59597799 - g * 0.27417610 - b * 0.32180189
}

fn rgb2q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.21147017 - g * 0.52261711 + b * 0.31114694
}

// blend a channel with white
fn blend(c: f64, a: f64) -> f64 {
    255.0 + (c - 255.0) * a
}

fn draw_pixel(output: &mut [u8], pos: usize, [r, g, b]: [u8; 3]) {
    output[pos] = r;
    output[pos + 1] = g;
    output[pos + 2] = b;
    output[pos + 3] = 255;
}

fn draw_gray_pixel(img: &[u8], pos: usize, alpha: f64, output: &mut [u8]) {
    let (r, g, b, a) = rgba(img, pos);
    let value = blend(rgb2y(r, g, b), alpha * a / 255.0) as u8;
    draw_pixel(output, pos, [value, value, value]);
}
