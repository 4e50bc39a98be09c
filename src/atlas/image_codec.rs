use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbaImage};
use tracing::debug;

use crate::config::AtlasFormat;
use crate::error::Result;

/// An encoded image ready to be embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

/// Pixel decode/encode/resize capability used by the pipeline.
///
/// Implementations must be shareable across the worker pool.
pub trait ImageCodec: Sync {
    fn decode(&self, bytes: &[u8], mime_type: Option<&str>) -> Result<RgbaImage>;

    fn encode(&self, image: &RgbaImage) -> Result<EncodedImage>;

    fn resize(&self, image: &RgbaImage, width: u32, height: u32) -> RgbaImage;
}

/// Default codec backed by the `image` crate.
#[derive(Debug, Clone)]
pub struct ImageCrateCodec {
    pub format: AtlasFormat,
    /// Write fully opaque atlases as JPEG.
    pub compress: bool,
    /// JPEG quality, 1-100.
    pub quality: u8,
}

impl Default for ImageCrateCodec {
    fn default() -> Self {
        Self {
            format: AtlasFormat::Png,
            compress: false,
            quality: 85,
        }
    }
}

fn is_opaque(image: &RgbaImage) -> bool {
    image.pixels().all(|p| p.0[3] == u8::MAX)
}

fn encode_with_format(image: &RgbaImage, format: ImageFormat, mime_type: &str) -> Result<EncodedImage> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, format)?;
    Ok(EncodedImage {
        bytes: buf.into_inner(),
        mime_type: mime_type.into(),
        width: image.width(),
        height: image.height(),
    })
}

fn encode_jpeg(image: &RgbaImage, quality: u8) -> Result<EncodedImage> {
    let rgb = DynamicImage::ImageRgba8(image.clone()).into_rgb8();
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    DynamicImage::ImageRgb8(rgb).write_with_encoder(encoder)?;
    Ok(EncodedImage {
        bytes: buf.into_inner(),
        mime_type: "image/jpeg".into(),
        width: image.width(),
        height: image.height(),
    })
}

impl ImageCodec for ImageCrateCodec {
    fn decode(&self, bytes: &[u8], mime_type: Option<&str>) -> Result<RgbaImage> {
        let hinted = mime_type
            .and_then(ImageFormat::from_mime_type)
            .and_then(|format| image::load_from_memory_with_format(bytes, format).ok());
        let image = match hinted {
            Some(image) => image,
            None => image::load_from_memory(bytes)?,
        };
        Ok(image.to_rgba8())
    }

    fn encode(&self, image: &RgbaImage) -> Result<EncodedImage> {
        if self.compress && is_opaque(image) {
            debug!(quality = self.quality, "Encoding opaque atlas as JPEG");
            return encode_jpeg(image, self.quality);
        }
        match self.format {
            AtlasFormat::Png => encode_with_format(image, ImageFormat::Png, "image/png"),
            AtlasFormat::Webp => encode_with_format(image, ImageFormat::WebP, "image/webp"),
        }
    }

    fn resize(&self, image: &RgbaImage, width: u32, height: u32) -> RgbaImage {
        if image.dimensions() == (width, height) {
            return image.clone();
        }
        imageops::resize(image, width.max(1), height.max(1), FilterType::Triangle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn checkerboard(size: u32, alpha: u8) -> RgbaImage {
        RgbaImage::from_fn(size, size, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([255, 0, 0, alpha])
            } else {
                Rgba([0, 0, 255, alpha])
            }
        })
    }

    #[test]
    fn png_roundtrip() {
        let codec = ImageCrateCodec::default();
        let img = checkerboard(4, 255);
        let encoded = codec.encode(&img).unwrap();
        assert_eq!(encoded.mime_type, "image/png");
        assert_eq!((encoded.width, encoded.height), (4, 4));

        let decoded = codec.decode(&encoded.bytes, Some("image/png")).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn compress_uses_jpeg_only_for_opaque_images() {
        let codec = ImageCrateCodec {
            compress: true,
            quality: 70,
            ..Default::default()
        };

        let opaque = codec.encode(&checkerboard(8, 255)).unwrap();
        assert_eq!(opaque.mime_type, "image/jpeg");
        let decoded = codec.decode(&opaque.bytes, None).unwrap();
        assert_eq!(decoded.dimensions(), (8, 8));

        let translucent = codec.encode(&checkerboard(8, 128)).unwrap();
        assert_eq!(translucent.mime_type, "image/png");
    }

    #[test]
    fn webp_format_respected() {
        let codec = ImageCrateCodec {
            format: AtlasFormat::Webp,
            ..Default::default()
        };
        let encoded = codec.encode(&checkerboard(8, 200)).unwrap();
        assert_eq!(encoded.mime_type, "image/webp");
        let decoded = codec.decode(&encoded.bytes, Some("image/webp")).unwrap();
        assert_eq!(decoded.dimensions(), (8, 8));
    }

    #[test]
    fn wrong_mime_hint_falls_back_to_sniffing() {
        let codec = ImageCrateCodec::default();
        let encoded = codec.encode(&checkerboard(2, 255)).unwrap();
        let decoded = codec.decode(&encoded.bytes, Some("image/jpeg")).unwrap();
        assert_eq!(decoded.dimensions(), (2, 2));
    }

    #[test]
    fn garbage_does_not_decode() {
        let codec = ImageCrateCodec::default();
        assert!(codec.decode(b"not an image", None).is_err());
    }

    #[test]
    fn resize_changes_dimensions() {
        let codec = ImageCrateCodec::default();
        let img = checkerboard(16, 255);
        assert_eq!(codec.resize(&img, 5, 3).dimensions(), (5, 3));
        assert_eq!(codec.resize(&img, 16, 16), img);
    }
}
