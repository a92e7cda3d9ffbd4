//! Pipeline composition root.
//!
//! Owns the configuration and lazily materializes the expensive parts
//! (detector and encoder sessions, annotator) at most once per [`Pipeline`].
//! The classifier is cached separately: it is a pure function of the current
//! registry contents, so it is rebuilt off to the side and swapped in
//! atomically, and [`Pipeline::reload`] drops only that cache. The registry
//! accessor is deliberately not cached — every call re-opens the store, so
//! both same-process `add`s and out-of-process file changes are visible.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};

use image::RgbImage;
use thiserror::Error;

use crate::annotate::{Annotate, BoxAnnotator, LabelledBox};
use crate::classifier::{ClassifierError, NearestNeighbourClassifier};
use crate::config::PipelineConfig;
use crate::detector::{Detector, DetectorError, OnnxDetector};
use crate::encoder::{Encoder, EncoderError, OnnxEncoder};
use crate::registry::{FileRegistry, Registry, RegistryError};
use crate::types::{BoundingBox, Embedding, FacePatch, Identity};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("expected exactly one face, found {0}")]
    MultipleFaces(usize),
}

type BoxedDetector = Box<dyn Detector + Send>;
type BoxedEncoder = Box<dyn Encoder + Send>;

/// Lazily-constructed face identification pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    detector: Mutex<Option<BoxedDetector>>,
    encoder: Mutex<Option<BoxedEncoder>>,
    annotator: OnceLock<BoxAnnotator>,
    classifier: RwLock<Option<Arc<NearestNeighbourClassifier>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Pipeline {
    /// Build a pipeline that loads its ONNX models on first use.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            detector: Mutex::new(None),
            encoder: Mutex::new(None),
            annotator: OnceLock::new(),
            classifier: RwLock::new(None),
        }
    }

    /// Build a pipeline around preconstructed detector and encoder handles.
    pub fn with_components(
        config: PipelineConfig,
        detector: BoxedDetector,
        encoder: BoxedEncoder,
    ) -> Self {
        Self {
            config,
            detector: Mutex::new(Some(detector)),
            encoder: Mutex::new(Some(encoder)),
            annotator: OnceLock::new(),
            classifier: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Open the registry store. Never cached: re-opening per call keeps
    /// same-run registrations and external file changes visible.
    pub fn registry(&self) -> Result<FileRegistry, RegistryError> {
        FileRegistry::open(&self.config.registry_path)
    }

    fn with_detector<T>(
        &self,
        f: impl FnOnce(&mut dyn Detector) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let mut guard = lock(&self.detector);
        let detector = match guard.as_mut() {
            Some(d) => d,
            None => {
                let path = self.config.detector_model_path();
                tracing::info!(path, "loading detector");
                let d = OnnxDetector::load(
                    &path,
                    self.config.probability_threshold,
                    self.config.intra_threads,
                )?;
                guard.insert(Box::new(d))
            }
        };
        f(detector.as_mut())
    }

    fn with_encoder<T>(
        &self,
        f: impl FnOnce(&mut dyn Encoder) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let mut guard = lock(&self.encoder);
        let encoder = match guard.as_mut() {
            Some(e) => e,
            None => {
                let path = self.config.encoder_model_path();
                tracing::info!(path, "loading encoder");
                let e = OnnxEncoder::load(&path, self.config.intra_threads)?;
                guard.insert(Box::new(e))
            }
        };
        f(encoder.as_mut())
    }

    /// Current classifier, fitting one from the registry if none is cached.
    ///
    /// The new classifier is built before the cache slot is touched, so
    /// concurrent readers only ever observe a complete index.
    pub fn classifier(&self) -> Result<Arc<NearestNeighbourClassifier>, PipelineError> {
        if let Ok(guard) = self.classifier.read() {
            if let Some(clf) = guard.as_ref() {
                return Ok(Arc::clone(clf));
            }
        }

        let registry = self.registry()?;
        let fitted = self.with_encoder(|encoder| {
            Ok(NearestNeighbourClassifier::fit(
                registry.entries(),
                self.config.distance_threshold,
                self.config.restklasse.clone(),
                encoder,
            )?)
        })?;
        let fitted = Arc::new(fitted);

        let mut guard = self
            .classifier
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // keep a classifier another thread may have fitted in the meantime
        Ok(Arc::clone(guard.get_or_insert(fitted)))
    }

    /// Drop the cached classifier so the next access re-fits from the
    /// current registry state. Model handles are untouched.
    pub fn reload(&self) {
        let mut guard = self
            .classifier
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = None;
        tracing::debug!("classifier cache invalidated");
    }

    /// Detect faces in an image.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, PipelineError> {
        self.with_detector(|d| Ok(d.detect(image)?))
    }

    /// Detect faces and cut out their patches.
    pub fn extract(
        &self,
        image: &RgbImage,
    ) -> Result<Vec<(BoundingBox, FacePatch)>, PipelineError> {
        self.with_detector(|d| Ok(d.faces(image)?))
    }

    /// Embed a face patch.
    pub fn encode(&self, patch: &FacePatch) -> Result<Embedding, PipelineError> {
        self.with_encoder(|e| Ok(e.encode(patch)?))
    }

    /// Classify a query embedding against the registered identities.
    pub fn classify(&self, embedding: &Embedding) -> Result<Identity, PipelineError> {
        Ok(self.classifier()?.classify(embedding).clone())
    }

    /// Identify every face in an image.
    pub fn identify(
        &self,
        image: &RgbImage,
    ) -> Result<Vec<(BoundingBox, Identity)>, PipelineError> {
        let faces = self.extract(image)?;
        let classifier = self.classifier()?;
        let mut results = Vec::with_capacity(faces.len());
        for (bbox, patch) in faces {
            let embedding = self.encode(&patch)?;
            let identity = classifier.classify(&embedding).clone();
            results.push((bbox, identity));
        }
        Ok(results)
    }

    /// Register a face patch under an identity and persist it.
    ///
    /// The restklasse label is rejected: registering it would later be
    /// indistinguishable from "unknown". Does not invalidate the cached
    /// classifier; call [`Pipeline::reload`] once registration is done.
    pub fn register(&self, patch: FacePatch, identity: Identity) -> Result<(), PipelineError> {
        if identity == self.config.restklasse {
            return Err(RegistryError::InvalidIdentity(
                identity.as_str().to_string(),
                "label is reserved for unknown faces",
            )
            .into());
        }
        let mut registry = self.registry()?;
        registry.add(patch, identity)?;
        Ok(())
    }

    /// Register the single face found in an image.
    ///
    /// Errors when the image contains no face or more than one, so a caller
    /// can never silently register the wrong person.
    pub fn register_image(
        &self,
        image: &RgbImage,
        identity: Identity,
    ) -> Result<BoundingBox, PipelineError> {
        let mut faces = self.extract(image)?;
        match faces.len() {
            0 => Err(PipelineError::NoFaceDetected),
            1 => {
                let (bbox, patch) = faces.remove(0);
                self.register(patch, identity)?;
                Ok(bbox)
            }
            n => Err(PipelineError::MultipleFaces(n)),
        }
    }

    /// Render labelled boxes onto a copy of an image.
    pub fn annotate(&self, image: &RgbImage, boxes: &[LabelledBox]) -> RgbImage {
        self.annotator
            .get_or_init(BoxAnnotator::default)
            .render(image, boxes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::types::DEFAULT_RESTKLASSE;

    /// Encoder mapping the first three patch bytes to coordinates (scaled by
    /// 1/10), counting how often it runs.
    struct StubEncoder {
        encodes: Arc<AtomicUsize>,
    }

    impl Encoder for StubEncoder {
        fn encode(&mut self, patch: &FacePatch) -> Result<Embedding, EncoderError> {
            self.encodes.fetch_add(1, Ordering::SeqCst);
            Ok(Embedding::new(
                patch.data[..3].iter().map(|&b| b as f32 / 10.0).collect(),
            ))
        }

        fn dimension(&self) -> usize {
            3
        }
    }

    /// Detector reporting one fixed full-image face.
    struct StubDetector;

    impl Detector for StubDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(vec![BoundingBox {
                x0: 0.0,
                y0: 0.0,
                x1: image.width() as f32,
                y1: image.height() as f32,
                confidence: 0.99,
            }])
        }
    }

    fn patch(coords: [u8; 3]) -> FacePatch {
        let mut data = vec![0u8; 12];
        data[..3].copy_from_slice(&coords);
        FacePatch::new(2, 2, data).unwrap()
    }

    fn test_pipeline(dir: &tempfile::TempDir) -> (Pipeline, Arc<AtomicUsize>) {
        let encodes = Arc::new(AtomicUsize::new(0));
        let config = PipelineConfig {
            model_dir: dir.path().to_path_buf(),
            registry_path: dir.path().join("faces.json"),
            probability_threshold: 0.9,
            distance_threshold: 1.0,
            restklasse: DEFAULT_RESTKLASSE.into(),
            intra_threads: 1,
        };
        let pipeline = Pipeline::with_components(
            config,
            Box::new(StubDetector),
            Box::new(StubEncoder {
                encodes: Arc::clone(&encodes),
            }),
        );
        (pipeline, encodes)
    }

    #[test]
    fn test_empty_registry_classifies_as_restklasse() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = test_pipeline(&dir);
        let identity = pipeline.classify(&Embedding::new(vec![1.0, 0.0, 0.0])).unwrap();
        assert_eq!(identity.as_str(), DEFAULT_RESTKLASSE);
    }

    #[test]
    fn test_registration_visible_only_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = test_pipeline(&dir);
        let query = Embedding::new(vec![1.0, 0.0, 0.0]);

        // prime the classifier cache on the empty registry
        assert_eq!(
            pipeline.classify(&query).unwrap().as_str(),
            DEFAULT_RESTKLASSE
        );

        pipeline.register(patch([10, 0, 0]), "bob".into()).unwrap();

        // stale cache until an explicit reload
        assert_eq!(
            pipeline.classify(&query).unwrap().as_str(),
            DEFAULT_RESTKLASSE
        );
        pipeline.reload();
        assert_eq!(pipeline.classify(&query).unwrap().as_str(), "bob");
    }

    #[test]
    fn test_classifier_is_cached_between_queries() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, encodes) = test_pipeline(&dir);
        pipeline.register(patch([10, 0, 0]), "alice".into()).unwrap();
        pipeline.register(patch([0, 10, 0]), "bob".into()).unwrap();

        let query = Embedding::new(vec![1.0, 0.0, 0.0]);
        pipeline.classify(&query).unwrap();
        let after_first = encodes.load(Ordering::SeqCst);
        assert_eq!(after_first, 2); // one encode per registry entry

        pipeline.classify(&query).unwrap();
        pipeline.classify(&query).unwrap();
        assert_eq!(encodes.load(Ordering::SeqCst), after_first);

        // reload forces a re-fit
        pipeline.reload();
        pipeline.classify(&query).unwrap();
        assert_eq!(encodes.load(Ordering::SeqCst), after_first * 2);
    }

    #[test]
    fn test_register_rejects_restklasse_label() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = test_pipeline(&dir);
        let err = pipeline
            .register(patch([10, 0, 0]), DEFAULT_RESTKLASSE.into())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Registry(RegistryError::InvalidIdentity(..))
        ));
        assert_eq!(pipeline.registry().unwrap().len(), 0);
    }

    #[test]
    fn test_registry_reopens_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = test_pipeline(&dir);
        assert_eq!(pipeline.registry().unwrap().len(), 0);
        pipeline.register(patch([10, 0, 0]), "alice".into()).unwrap();
        // a fresh accessor observes the persisted add
        assert_eq!(pipeline.registry().unwrap().len(), 1);
    }

    #[test]
    fn test_identify_labels_each_face() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = test_pipeline(&dir);

        // the stub detector reports the whole image as one face; a uniform
        // image of (10,0,0) crops to a patch that embeds exactly onto alice
        pipeline.register(patch([10, 0, 0]), "alice".into()).unwrap();
        pipeline.reload();

        let image = RgbImage::from_pixel(4, 4, image::Rgb([10, 0, 0]));
        let results = pipeline.identify(&image).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.as_str(), "alice");
    }

    #[test]
    fn test_register_image_requires_exactly_one_face() {
        struct NoFaceDetector;
        impl Detector for NoFaceDetector {
            fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
                Ok(Vec::new())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            model_dir: dir.path().to_path_buf(),
            registry_path: dir.path().join("faces.json"),
            probability_threshold: 0.9,
            distance_threshold: 1.0,
            restklasse: DEFAULT_RESTKLASSE.into(),
            intra_threads: 1,
        };
        let pipeline = Pipeline::with_components(
            config,
            Box::new(NoFaceDetector),
            Box::new(StubEncoder {
                encodes: Arc::new(AtomicUsize::new(0)),
            }),
        );

        let image = RgbImage::from_pixel(4, 4, image::Rgb([0, 0, 0]));
        let err = pipeline.register_image(&image, "alice".into()).unwrap_err();
        assert!(matches!(err, PipelineError::NoFaceDetected));
    }
}
