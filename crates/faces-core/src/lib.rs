//! faces-core — open-set face identification.
//!
//! Detects faces, embeds them as fixed-length vectors, and matches query
//! embeddings against a persistent registry of known identities with a
//! nearest-neighbour classifier that rejects strangers to a reserved
//! "restklasse" label. Detection and embedding run via ONNX Runtime.

pub mod annotate;
pub mod builder;
pub mod classifier;
pub mod config;
pub mod detector;
pub mod encoder;
pub mod registry;
pub mod session;
pub mod types;

pub use annotate::{Annotate, BoxAnnotator, LabelledBox};
pub use builder::{Pipeline, PipelineError};
pub use classifier::{ClassifierIndex, NearestNeighbourClassifier};
pub use config::PipelineConfig;
pub use detector::{Detector, OnnxDetector};
pub use encoder::{Encoder, OnnxEncoder};
pub use registry::{FileRegistry, MemoryRegistry, Registry};
pub use session::Session;
pub use types::{BoundingBox, Embedding, FacePatch, Identity, DEFAULT_RESTKLASSE};
