//! Face detection via ONNX Runtime.
//!
//! Wraps a single-shot face detector of the Ultraface family: 320x240 RGB
//! input, one score tensor and one tensor of normalized corner boxes,
//! filtered by probability and de-duplicated with non-maximum suppression.

use std::path::Path;

use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::types::{BoundingBox, FacePatch};

const DETECTOR_INPUT_WIDTH: u32 = 320;
const DETECTOR_INPUT_HEIGHT: u32 = 240;
const DETECTOR_MEAN: f32 = 127.0;
const DETECTOR_STD: f32 = 128.0;
const NMS_IOU_THRESHOLD: f32 = 0.4;

/// Side length of extracted face patches, matching the encoder input.
pub const PATCH_SIZE: u32 = 160;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detected box lies outside the image")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces in an image and cuts them out as encoder-ready patches.
pub trait Detector {
    /// Bounding boxes of detected faces, most confident first.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;

    /// Crop a patch for each box. Boxes are clamped to the image first.
    fn extract(
        &mut self,
        image: &RgbImage,
        boxes: &[BoundingBox],
    ) -> Result<Vec<(BoundingBox, FacePatch)>, DetectorError> {
        boxes
            .iter()
            .map(|b| crop_patch(image, b).map(|patch| (*b, patch)))
            .collect()
    }

    /// Detect and extract in one pass.
    fn faces(&mut self, image: &RgbImage) -> Result<Vec<(BoundingBox, FacePatch)>, DetectorError> {
        let boxes = self.detect(image)?;
        self.extract(image, &boxes)
    }
}

/// Cut a box out of the image and resize it to [`PATCH_SIZE`].
pub fn crop_patch(image: &RgbImage, bbox: &BoundingBox) -> Result<FacePatch, DetectorError> {
    let b = bbox.clamped(image.width(), image.height());
    let (w, h) = (b.width() as u32, b.height() as u32);
    if w == 0 || h == 0 {
        return Err(DetectorError::EmptyCrop);
    }

    let crop = imageops::crop_imm(image, b.x0 as u32, b.y0 as u32, w, h).to_image();
    let resized = imageops::resize(&crop, PATCH_SIZE, PATCH_SIZE, imageops::FilterType::Triangle);
    let (pw, ph) = resized.dimensions();
    FacePatch::new(pw, ph, resized.into_raw())
        .map_err(|e| DetectorError::InferenceFailed(e.to_string()))
}

/// ONNX-backed face detector.
#[derive(Debug)]
pub struct OnnxDetector {
    session: Session,
    /// Minimum face probability; lower values detect more candidate faces.
    probability_threshold: f32,
}

impl OnnxDetector {
    /// Load the detection model from the given path.
    pub fn load(
        model_path: &str,
        probability_threshold: f32,
        intra_threads: usize,
    ) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let num_outputs = session.outputs().len();
        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded detector model"
        );
        if num_outputs < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "detector model requires 2 outputs (scores, boxes), got {num_outputs}"
            )));
        }

        Ok(Self {
            session,
            probability_threshold,
        })
    }

    /// Resize to the network input and pack as a normalized NCHW tensor.
    fn preprocess(image: &RgbImage) -> Array4<f32> {
        let resized = imageops::resize(
            image,
            DETECTOR_INPUT_WIDTH,
            DETECTOR_INPUT_HEIGHT,
            imageops::FilterType::Triangle,
        );

        let (w, h) = (DETECTOR_INPUT_WIDTH as usize, DETECTOR_INPUT_HEIGHT as usize);
        let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 - DETECTOR_MEAN) / DETECTOR_STD;
            }
        }
        tensor
    }
}

impl Detector for OnnxDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let input = Self::preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("score tensor: {e}")))?;
        let (_, boxes) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("box tensor: {e}")))?;

        // scores: [1, N, 2] (background, face); boxes: [1, N, 4] normalized corners
        let anchors = scores.len() / 2;
        if boxes.len() != anchors * 4 {
            return Err(DetectorError::InferenceFailed(format!(
                "{anchors} anchors but {} box values",
                boxes.len()
            )));
        }

        let (img_w, img_h) = (image.width() as f32, image.height() as f32);
        let candidates = decode_candidates(
            scores,
            boxes,
            anchors,
            self.probability_threshold,
            img_w,
            img_h,
        );
        let kept = non_maximum_suppression(candidates, NMS_IOU_THRESHOLD);

        tracing::debug!(
            faces = kept.len(),
            threshold = self.probability_threshold,
            "detection complete"
        );
        Ok(kept)
    }
}

/// Filter anchors by face probability and scale their boxes to image pixels.
fn decode_candidates(
    scores: &[f32],
    boxes: &[f32],
    anchors: usize,
    probability_threshold: f32,
    img_w: f32,
    img_h: f32,
) -> Vec<BoundingBox> {
    let mut candidates = Vec::new();
    for i in 0..anchors {
        let face_prob = scores[i * 2 + 1];
        if face_prob < probability_threshold {
            continue;
        }
        candidates.push(BoundingBox {
            x0: boxes[i * 4] * img_w,
            y0: boxes[i * 4 + 1] * img_h,
            x1: boxes[i * 4 + 2] * img_w,
            y1: boxes[i * 4 + 3] * img_h,
            confidence: face_prob,
        });
    }
    candidates
}

/// Greedy non-maximum suppression: keep the most confident box, drop any
/// remaining box whose IoU with a kept one exceeds the threshold.
fn non_maximum_suppression(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
