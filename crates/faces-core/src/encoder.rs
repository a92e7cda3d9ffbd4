//! Face embedding extraction via ONNX Runtime.
//!
//! Wraps a FaceNet-style embedding network: 160x160 RGB input, 512-d output,
//! L2-normalized so Euclidean distances are comparable across queries.

use std::path::Path;

use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::types::{Embedding, FacePatch};

const ENCODER_INPUT_SIZE: u32 = 160;
const ENCODER_MEAN: f32 = 127.5;
const ENCODER_STD: f32 = 128.0;
const EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("patch buffer does not match its declared dimensions")]
    MalformedPatch,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a face patch into a fixed-length embedding.
///
/// Implementations must be deterministic for a given set of weights, and must
/// produce embeddings of exactly `dimension()` values.
pub trait Encoder {
    fn encode(&mut self, patch: &FacePatch) -> Result<Embedding, EncoderError>;

    /// Embedding dimensionality, fixed per encoder instance.
    fn dimension(&self) -> usize;
}

/// ONNX-backed face encoder.
#[derive(Debug)]
pub struct OnnxEncoder {
    session: Session,
}

impl OnnxEncoder {
    /// Load the embedding model from the given path.
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, EncoderError> {
        if !Path::new(model_path).exists() {
            return Err(EncoderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded encoder model"
        );

        Ok(Self { session })
    }

    /// Resize an RGB patch to the network input size and pack it as a
    /// mean/std-normalized NCHW tensor.
    fn preprocess(patch: &RgbImage) -> Array4<f32> {
        let size = ENCODER_INPUT_SIZE;
        let resized = if patch.dimensions() == (size, size) {
            patch.clone()
        } else {
            imageops::resize(patch, size, size, imageops::FilterType::Triangle)
        };

        let s = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 - ENCODER_MEAN) / ENCODER_STD;
            }
        }
        tensor
    }
}

impl Encoder for OnnxEncoder {
    fn encode(&mut self, patch: &FacePatch) -> Result<Embedding, EncoderError> {
        let rgb = RgbImage::from_raw(patch.width, patch.height, patch.data.clone())
            .ok_or(EncoderError::MalformedPatch)?;
        let input = Self::preprocess(&rgb);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;
        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != EMBEDDING_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        // L2-normalize
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Embedding::new(values))
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let patch = RgbImage::from_pixel(64, 48, image::Rgb([128, 128, 128]));
        let tensor = OnnxEncoder::preprocess(&patch);
        assert_eq!(
            tensor.shape(),
            &[1, 3, ENCODER_INPUT_SIZE as usize, ENCODER_INPUT_SIZE as usize]
        );
    }

    #[test]
    fn test_preprocess_normalization() {
        let patch = RgbImage::from_pixel(
            ENCODER_INPUT_SIZE,
            ENCODER_INPUT_SIZE,
            image::Rgb([128, 0, 255]),
        );
        let tensor = OnnxEncoder::preprocess(&patch);
        let expect = |p: f32| (p - ENCODER_MEAN) / ENCODER_STD;
        assert!((tensor[[0, 0, 0, 0]] - expect(128.0)).abs() < 1e-6);
        assert!((tensor[[0, 1, 0, 0]] - expect(0.0)).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] - expect(255.0)).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxEncoder::load("/nonexistent/model.onnx", 1).unwrap_err();
        assert!(matches!(err, EncoderError::ModelNotFound(_)));
    }
}
