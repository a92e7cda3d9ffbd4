//! Pipeline configuration.
//!
//! Immutable after construction. Loaded from `FACES_*` environment variables
//! with defaults; the CLI overlays its flags on top before building a
//! [`crate::builder::Pipeline`].

use std::path::PathBuf;

use crate::types::{Identity, DEFAULT_RESTKLASSE};

const DETECTOR_MODEL_FILE: &str = "version-RFB-320.onnx";
const ENCODER_MODEL_FILE: &str = "facenet-vggface2.onnx";

/// Configuration owned by the pipeline builder.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path of the persisted registry store.
    pub registry_path: PathBuf,
    /// Minimum face probability accepted from the detector.
    pub probability_threshold: f32,
    /// Maximum Euclidean distance for a positive identification.
    pub distance_threshold: f32,
    /// Label returned for faces that match no registered identity.
    pub restklasse: Identity,
    /// Intra-op thread count for the ONNX sessions.
    pub intra_threads: usize,
}

impl PipelineConfig {
    /// Load configuration from `FACES_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACES_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_model_dir());

        let registry_path = std::env::var("FACES_REGISTRY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join(".faces.json"));

        Self {
            model_dir,
            registry_path,
            probability_threshold: env_f32("FACES_PROBABILITY_THRESHOLD", 0.9),
            distance_threshold: env_f32("FACES_DISTANCE_THRESHOLD", 1.0),
            restklasse: Identity::new(
                std::env::var("FACES_RESTKLASSE").unwrap_or_else(|_| DEFAULT_RESTKLASSE.into()),
            ),
            intra_threads: env_usize("FACES_INTRA_THREADS", 2),
        }
    }

    /// Path to the face detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the face embedding model.
    pub fn encoder_model_path(&self) -> String {
        self.model_dir
            .join(ENCODER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Default model directory: `$XDG_DATA_HOME/faces/models` or the equivalent
/// under `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("faces/models")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
