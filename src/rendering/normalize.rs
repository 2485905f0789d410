//! Reconcile two captures of different sizes into one comparable region.
//!
//! Both images are aligned at the origin and cropped to the smaller width and
//! the smaller height. Nothing is matched by content: if two layouts diverge
//! early, everything below the divergence shows up as mismatch.

use super::RenderedImage;
use std::borrow::Cow;

/// Two images with identical dimensions
#[derive(Debug, Clone)]
pub struct NormalizedPair<'a> {
    pub a: Cow<'a, RenderedImage>,
    pub b: Cow<'a, RenderedImage>,
}

impl NormalizedPair<'_> {
    pub fn width(&self) -> u32 {
        self.a.width()
    }

    pub fn height(&self) -> u32 {
        self.a.height()
    }

    /// True when the common region has no pixels.
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Crop `a` and `b` to their common top-left region.
///
/// Images that already have the target size are borrowed, not copied.
pub fn normalize<'a>(a: &'a RenderedImage, b: &'a RenderedImage) -> NormalizedPair<'a> {
    let width = a.width().min(b.width());
    let height = a.height().min(b.height());
    NormalizedPair {
        a: crop_top_left(a, width, height),
        b: crop_top_left(b, width, height),
    }
}

fn crop_top_left(img: &RenderedImage, width: u32, height: u32) -> Cow<'_, RenderedImage> {
    if img.width() == width && img.height() == height {
        return Cow::Borrowed(img);
    }
    let cropped = image::imageops::crop_imm(img.as_rgba(), 0, 0, width, height).to_image();
    Cow::Owned(RenderedImage::from(cropped))
}
