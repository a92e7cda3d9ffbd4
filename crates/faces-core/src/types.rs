use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved identity label returned when a query matches nobody.
pub const DEFAULT_RESTKLASSE: &str = "Anonymous";

/// Bounding box for a detected face, in image pixel coordinates.
///
/// `(x0, y0)` is the top-left corner, `(x1, y1)` the bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    /// Detection confidence in [0, 1].
    pub confidence: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Clamp the box corners to an image of the given dimensions.
    pub fn clamped(&self, image_width: u32, image_height: u32) -> BoundingBox {
        let w = image_width as f32;
        let h = image_height as f32;
        BoundingBox {
            x0: self.x0.clamp(0.0, w),
            y0: self.y0.clamp(0.0, h),
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            confidence: self.confidence,
        }
    }

    /// Intersection-over-union with another box. Zero when either box is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix0 = self.x0.max(other.x0);
        let iy0 = self.y0.max(other.y0);
        let ix1 = self.x1.min(other.x1);
        let iy1 = self.y1.min(other.y1);
        let inter = (ix1 - ix0).max(0.0) * (iy1 - iy0).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// An extracted face crop: owned RGB8 pixels, row-major, 3 bytes per pixel.
///
/// Patches are compared bytewise so the registry can deduplicate entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FacePatch {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl FacePatch {
    /// Build a patch, validating that the buffer matches the dimensions.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, PatchShapeError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(PatchShapeError {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }
}

/// RGB buffer length does not match the declared patch dimensions.
#[derive(Debug, thiserror::Error)]
#[error("patch buffer of {actual} bytes does not fit {width}x{height} RGB ({expected} bytes)")]
pub struct PatchShapeError {
    pub width: u32,
    pub height: u32,
    pub expected: usize,
    pub actual: usize,
}

/// Face embedding vector (typically 512-dimensional).
///
/// Immutable after creation; compared only through a distance metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean (L2) distance to another embedding of the same dimension.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Opaque identity label. The restklasse value is reserved for "unknown".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(label: &str) -> Self {
        Self(label.to_string())
    }
}

impl From<String> for Identity {
    fn from(label: String) -> Self {
        Self(label)
    }
}

/// One registered (patch, identity) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub patch: FacePatch,
    pub identity: Identity,
}
