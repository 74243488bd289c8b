//! The thumbnailer capability.
//!
//! A thumbnailer is handed raw upload bytes and either describes the media
//! and returns a thumbnail, or fails with one of a closed set of reasons.
//! Calls block, so async callers go through `spawn_blocking`.

mod process;
mod raster;

pub use self::raster::ImageThumbnailer;
pub use self::process::ProcessThumbnailer;

use crate::models::file::FileType;
use image::{DynamicImage, GenericImageView, ImageFormat, imageops::FilterType};
use std::io::Cursor;
use thiserror::Error;

/// Downscale factor applied before blurring a placeholder.
const BLUR_DOWNSCALE: u32 = 4;
const BLUR_SIGMA: f32 = 2.0;

/// Metadata and thumbnail bytes describing a decoded upload.
#[derive(Clone, Debug, Default)]
pub struct Thumbnail {
    pub mime: String,
    pub src_width: u16,
    pub src_height: u16,
    pub width: u16,
    pub height: u16,
    pub has_alpha: bool,
    pub has_video: bool,
    pub has_audio: bool,
    /// Duration in seconds.
    pub duration: u32,
    pub title: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ThumbError {
    #[error("unsupported file type")]
    Unsupported,
    #[error("no audio or video tracks")]
    NoTracks,
    #[error("thumbnailing process failed: {0}")]
    Process(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub trait Thumbnailer: Send + Sync {
    /// Describe `data` and produce its thumbnail. `actor` identifies who
    /// triggered the work, for quota and audit purposes.
    fn generate(&self, actor: &str, data: &[u8]) -> Result<Thumbnail, ThumbError>;

    /// Produce a blurred low-resolution placeholder from a stored thumbnail.
    fn blur_placeholder(&self, thumb: &[u8], thumb_type: FileType) -> Result<Vec<u8>, ThumbError> {
        let img =
            image::load_from_memory(thumb).map_err(|e| ThumbError::Process(e.to_string()))?;
        let (width, height) = img.dimensions();
        let small = img.resize_exact(
            (width / BLUR_DOWNSCALE).max(1),
            (height / BLUR_DOWNSCALE).max(1),
            FilterType::Triangle,
        );
        encode(&small.blur(BLUR_SIGMA), thumb_type)
    }
}

/// Encode as PNG when `kind` is PNG, JPEG otherwise.
pub(crate) fn encode(img: &DynamicImage, kind: FileType) -> Result<Vec<u8>, ThumbError> {
    let mut out = Vec::new();
    let mut cursor = Cursor::new(&mut out);
    let result = match kind {
        FileType::Png => {
            DynamicImage::ImageRgba8(img.to_rgba8()).write_to(&mut cursor, ImageFormat::Png)
        }
        _ => DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut cursor, ImageFormat::Jpeg),
    };
    result.map_err(|e| ThumbError::Other(anyhow::anyhow!("encode {:?} thumbnail: {}", kind, e)))?;
    Ok(out)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    pub fn png_fixture(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            Rgba([10, 200, 30, 128]),
        ));
        encode(&img, FileType::Png).unwrap()
    }

    pub fn jpeg_fixture(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 90])
        }));
        encode(&img, FileType::Jpeg).unwrap()
    }

    #[test]
    fn blur_placeholder_keeps_thumb_format() {
        let thumbnailer = ImageThumbnailer::default();
        let blurred = thumbnailer
            .blur_placeholder(&png_fixture(200, 100), FileType::Png)
            .unwrap();
        assert_eq!(image::guess_format(&blurred).unwrap(), ImageFormat::Png);
        let img = image::load_from_memory(&blurred).unwrap();
        assert_eq!(img.dimensions(), (50, 25));
    }

    #[test]
    fn blur_placeholder_rejects_garbage() {
        let thumbnailer = ImageThumbnailer::default();
        let err = thumbnailer
            .blur_placeholder(b"not an image", FileType::Jpeg)
            .unwrap_err();
        assert!(matches!(err, ThumbError::Process(_)));
    }
}
