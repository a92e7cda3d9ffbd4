//! Rendering of detection results onto images.
//!
//! Draws box outlines with the `image` crate. Labels pick a stable per-label
//! color from a small palette and are drawn as a filled strip along the top
//! edge of the box; textual output is the caller's job (the CLI prints
//! labels alongside the rendered file).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use image::{Rgb, RgbImage};

use crate::types::BoundingBox;

/// A bounding box with an optional display label (identity or probability).
pub type LabelledBox = (BoundingBox, Option<String>);

/// Renders labelled boxes onto a copy of an image.
pub trait Annotate {
    fn render(&self, image: &RgbImage, boxes: &[LabelledBox]) -> RgbImage;
}

/// Default annotator: red outlines, color-coded label strips.
pub struct BoxAnnotator {
    pub line_width: u32,
    pub box_color: Rgb<u8>,
}

impl Default for BoxAnnotator {
    fn default() -> Self {
        Self {
            line_width: 4,
            box_color: Rgb([255, 0, 0]),
        }
    }
}

/// Fixed palette for label strips; distinct labels map to distinct colors
/// deterministically (modulo palette size).
const LABEL_PALETTE: [Rgb<u8>; 6] = [
    Rgb([255, 215, 0]),
    Rgb([0, 200, 80]),
    Rgb([60, 120, 255]),
    Rgb([255, 120, 0]),
    Rgb([200, 0, 200]),
    Rgb([0, 200, 200]),
];

fn color_for_label(label: &str) -> Rgb<u8> {
    let mut hasher = DefaultHasher::new();
    label.hash(&mut hasher);
    LABEL_PALETTE[hasher.finish() as usize % LABEL_PALETTE.len()]
}

/// Fill an axis-aligned rectangle, clipped to the image.
fn fill_rect(image: &mut RgbImage, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgb<u8>) {
    let (w, h) = (image.width() as i64, image.height() as i64);
    for y in y0.max(0)..y1.min(h) {
        for x in x0.max(0)..x1.min(w) {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

impl BoxAnnotator {
    fn draw_outline(&self, image: &mut RgbImage, bbox: &BoundingBox) {
        let lw = self.line_width as i64;
        let (x0, y0) = (bbox.x0 as i64, bbox.y0 as i64);
        let (x1, y1) = (bbox.x1 as i64, bbox.y1 as i64);
        fill_rect(image, x0, y0, x1, y0 + lw, self.box_color); // top
        fill_rect(image, x0, y1 - lw, x1, y1, self.box_color); // bottom
        fill_rect(image, x0, y0, x0 + lw, y1, self.box_color); // left
        fill_rect(image, x1 - lw, y0, x1, y1, self.box_color); // right
    }

    fn draw_label_strip(&self, image: &mut RgbImage, bbox: &BoundingBox, label: &str) {
        let lw = self.line_width as i64;
        let (x0, y0) = (bbox.x0 as i64, bbox.y0 as i64);
        let x1 = bbox.x1 as i64;
        fill_rect(
            image,
            x0 + lw,
            y0 + lw,
            x1 - lw,
            y0 + 4 * lw,
            color_for_label(label),
        );
    }
}

impl Annotate for BoxAnnotator {
    fn render(&self, image: &RgbImage, boxes: &[LabelledBox]) -> RgbImage {
        let mut out = image.clone();
        for (bbox, label) in boxes {
            let bbox = bbox.clamped(out.width(), out.height());
            self.draw_outline(&mut out, &bbox);
            if let Some(label) = label {
                self.draw_label_strip(&mut out, &bbox, label);
            }
        }
        out
    }
}
