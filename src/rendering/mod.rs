//! Raster images produced by captures and by the diff kernel

pub mod diff;
pub mod normalize;

use crate::{Error, Result};
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;

/// An RGBA8 raster (`width * height * 4` bytes, row-major)
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedImage {
    buffer: RgbaImage,
}

impl RenderedImage {
    /// A fully transparent image of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            buffer: RgbaImage::new(width, height),
        }
    }

    /// An image where every pixel has the same color.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self {
            buffer: RgbaImage::from_pixel(width, height, image::Rgba(rgba)),
        }
    }

    /// Wrap a raw RGBA buffer. The length must be exactly `width * height * 4`.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 4;
        let actual = pixels.len();
        RgbaImage::from_raw(width, height, pixels)
            .map(|buffer| Self { buffer })
            .ok_or_else(|| {
                Error::InternalError(format!(
                    "pixel buffer for {}x{} must hold {} bytes, got {}",
                    width, height, expected, actual
                ))
            })
    }

    /// Decode a PNG into RGBA8.
    pub fn from_png(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory_with_format(bytes, ImageFormat::Png)?;
        Ok(Self {
            buffer: decoded.to_rgba8(),
        })
    }

    /// Encode as PNG.
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        self.buffer.write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    /// Raw RGBA bytes.
    pub fn pixels(&self) -> &[u8] {
        self.buffer.as_raw()
    }

    pub fn as_rgba(&self) -> &RgbaImage {
        &self.buffer
    }

    pub fn into_rgba(self) -> RgbaImage {
        self.buffer
    }
}

impl From<RgbaImage> for RenderedImage {
    fn from(buffer: RgbaImage) -> Self {
        Self { buffer }
    }
}
