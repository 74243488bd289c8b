//! Built-in thumbnailer for still images, backed by the `image` crate.

use super::{ThumbError, Thumbnail, Thumbnailer, encode};
use crate::models::file::FileType;
use image::{GenericImageView, ImageFormat};

/// Maximum width or height of a thumbnail.
const THUMB_SIZE: u32 = 200;

/// Handles JPEG, PNG and GIF in-process; anything else is unsupported.
#[derive(Clone, Debug)]
pub struct ImageThumbnailer {
    max_dim: u32,
}

impl Default for ImageThumbnailer {
    fn default() -> Self {
        Self {
            max_dim: THUMB_SIZE,
        }
    }
}

impl Thumbnailer for ImageThumbnailer {
    fn generate(&self, _actor: &str, data: &[u8]) -> Result<Thumbnail, ThumbError> {
        let format = image::guess_format(data).map_err(|_| ThumbError::Unsupported)?;
        let mime = match format {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
            _ => return Err(ThumbError::Unsupported),
        };

        let img = image::load_from_memory_with_format(data, format)
            .map_err(|e| ThumbError::Process(e.to_string()))?;
        let (src_width, src_height) = img.dimensions();
        let has_alpha = img.color().has_alpha();

        // Never upscale.
        let thumb = if src_width > self.max_dim || src_height > self.max_dim {
            img.thumbnail(self.max_dim, self.max_dim)
        } else {
            img
        };
        let thumb_type = if has_alpha {
            FileType::Png
        } else {
            FileType::Jpeg
        };

        let (width, height) = thumb.dimensions();
        Ok(Thumbnail {
            mime: mime.to_string(),
            src_width: clamp_dim(src_width),
            src_height: clamp_dim(src_height),
            width: clamp_dim(width),
            height: clamp_dim(height),
            has_alpha,
            data: encode(&thumb, thumb_type)?,
            ..Thumbnail::default()
        })
    }
}

fn clamp_dim(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::thumbnailer::tests::{jpeg_fixture, png_fixture};

    #[test]
    fn jpeg_gets_jpeg_thumbnail() {
        let thumb = ImageThumbnailer::default()
            .generate("tester", &jpeg_fixture(800, 600))
            .unwrap();
        assert_eq!(thumb.mime, "image/jpeg");
        assert_eq!(
            (thumb.src_width, thumb.src_height, thumb.width, thumb.height),
            (800, 600, 200, 150)
        );
        assert!(!thumb.has_alpha);
        assert_eq!(image::guess_format(&thumb.data).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn alpha_source_gets_png_thumbnail() {
        let thumb = ImageThumbnailer::default()
            .generate("tester", &png_fixture(400, 400))
            .unwrap();
        assert_eq!(thumb.mime, "image/png");
        assert!(thumb.has_alpha);
        assert_eq!((thumb.width, thumb.height), (200, 200));
        assert_eq!(image::guess_format(&thumb.data).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn small_images_are_not_upscaled() {
        let thumb = ImageThumbnailer::default()
            .generate("tester", &jpeg_fixture(64, 32))
            .unwrap();
        assert_eq!((thumb.width, thumb.height), (64, 32));
    }

    #[test]
    fn non_images_are_unsupported() {
        let err = ImageThumbnailer::default()
            .generate("tester", b"%PDF-1.4 not really")
            .unwrap_err();
        assert!(matches!(err, ThumbError::Unsupported));
    }

    #[test]
    fn truncated_image_is_a_process_failure() {
        let mut data = png_fixture(50, 50);
        data.truncate(40);
        let err = ImageThumbnailer::default()
            .generate("tester", &data)
            .unwrap_err();
        assert!(matches!(err, ThumbError::Process(_)));
    }
}
