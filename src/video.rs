//! JPEG stills for the video channel.
//!
//! The live API accepts individual `image/jpeg` frames as realtime input.
//! These helpers turn a decoded image or a photo on disk into that payload.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageResult};
use std::path::Path;
use tracing::debug;

pub const DEFAULT_JPEG_QUALITY: u8 = 75;

/// Longest edge sent by default; larger stills are downscaled.
pub const DEFAULT_MAX_EDGE: u32 = 1024;

/// Encode `image` as a baseline JPEG. Alpha is dropped.
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> ImageResult<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder.encode_image(&rgb)?;

    debug!(
        "Encoded {}x{} frame to {} bytes of JPEG",
        rgb.width(),
        rgb.height(),
        jpeg.len()
    );
    Ok(jpeg)
}

/// Load an image file, shrink it so neither edge exceeds `max_edge`, and
/// encode it for [`Session::send_video_frame`](crate::Session::send_video_frame).
pub fn load_jpeg_frame(path: impl AsRef<Path>, max_edge: u32) -> ImageResult<Vec<u8>> {
    let image = image::open(path.as_ref())?;

    let image = if image.width() > max_edge || image.height() > max_edge {
        image.resize(max_edge, max_edge, FilterType::Triangle)
    } else {
        image
    };

    encode_jpeg(&image, DEFAULT_JPEG_QUALITY)
}
