//! Image loading and preprocessing for the CLI.
//!
//! Scales the longer side of an image down to a target size before detection
//! and optionally rotates it in quarter turns.

use std::path::Path;

use anyhow::Context;
use image::{imageops, RgbImage};

/// Default length of the longer image side after preprocessing.
pub const DEFAULT_TARGET_SIZE: u32 = 1000;

/// Dimensions after scaling the longer side to `target_size`.
///
/// Images already within the target keep their size; aspect ratio is
/// preserved and neither side drops below one pixel.
fn scaled_dimensions(width: u32, height: u32, target_size: u32) -> (u32, u32) {
    let longer = width.max(height);
    if longer <= target_size {
        return (width, height);
    }
    let scale = target_size as f32 / longer as f32;
    (
        ((width as f32 * scale) as u32).max(1),
        ((height as f32 * scale) as u32).max(1),
    )
}

/// Rotate by the given angle; only quarter turns are supported.
fn rotated(image: RgbImage, rotate: i32) -> anyhow::Result<RgbImage> {
    match rotate.rem_euclid(360) {
        0 => Ok(image),
        90 => Ok(imageops::rotate90(&image)),
        180 => Ok(imageops::rotate180(&image)),
        270 => Ok(imageops::rotate270(&image)),
        other => anyhow::bail!("unsupported rotation {other}; use a multiple of 90"),
    }
}

/// Load an image, scale it to the target size, and apply rotation.
pub fn load(path: &Path, target_size: u32, rotate: Option<i32>) -> anyhow::Result<RgbImage> {
    let image = image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?
        .to_rgb8();

    let (w, h) = scaled_dimensions(image.width(), image.height(), target_size);
    let image = if (w, h) != image.dimensions() {
        tracing::debug!(path = %path.display(), width = w, height = h, "image scaled");
        imageops::resize(&image, w, h, imageops::FilterType::Triangle)
    } else {
        image
    };

    match rotate {
        Some(angle) => rotated(image, angle),
        None => Ok(image),
    }
}
