//! Open-set nearest-neighbour classification.
//!
//! A query embedding is matched against every indexed embedding by Euclidean
//! distance; the nearest identity wins unless its distance exceeds the
//! threshold, in which case the reserved restklasse label is returned. The
//! hard threshold is what makes the classifier open-set: strangers are
//! rejected instead of being forced onto the nearest known identity.

use thiserror::Error;

use crate::encoder::{Encoder, EncoderError};
use crate::types::{Embedding, Identity, RegistryEntry};

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("embedding for {identity:?} has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        identity: Identity,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

/// Read-only index mapping stored embeddings to identities.
///
/// Pure data derived from a registry snapshot. It is rebuilt wholesale via
/// [`NearestNeighbourClassifier::fit`]; there is no incremental update path.
#[derive(Debug, Clone)]
pub struct ClassifierIndex {
    embeddings: Vec<Embedding>,
    identities: Vec<Identity>,
    /// Entries excluded at build time because they carried the restklasse.
    excluded: usize,
}

impl ClassifierIndex {
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    pub fn excluded(&self) -> usize {
        self.excluded
    }

    pub fn identity(&self, row: usize) -> Option<&Identity> {
        self.identities.get(row)
    }
}

/// Nearest-neighbour classifier with a hard rejection threshold.
#[derive(Debug, Clone)]
pub struct NearestNeighbourClassifier {
    index: ClassifierIndex,
    distance_threshold: f32,
    restklasse: Identity,
}

impl NearestNeighbourClassifier {
    /// Build a classifier from a registry snapshot.
    ///
    /// Restklasse entries are filtered out before encoding; an index with
    /// zero rows is valid and classifies everything as restklasse. Every
    /// encoded embedding must match the encoder's declared dimensionality.
    pub fn fit(
        entries: &[RegistryEntry],
        distance_threshold: f32,
        restklasse: Identity,
        encoder: &mut dyn Encoder,
    ) -> Result<Self, ClassifierError> {
        let expected = encoder.dimension();
        let mut embeddings = Vec::new();
        let mut identities = Vec::new();
        let mut excluded = 0usize;

        for entry in entries {
            if entry.identity == restklasse {
                excluded += 1;
                continue;
            }
            let embedding = encoder.encode(&entry.patch)?;
            if embedding.dim() != expected {
                return Err(ClassifierError::DimensionMismatch {
                    identity: entry.identity.clone(),
                    expected,
                    actual: embedding.dim(),
                });
            }
            embeddings.push(embedding);
            identities.push(entry.identity.clone());
        }

        tracing::debug!(
            rows = embeddings.len(),
            excluded,
            distance_threshold,
            "classifier index built"
        );

        Ok(Self {
            index: ClassifierIndex {
                embeddings,
                identities,
                excluded,
            },
            distance_threshold,
            restklasse,
        })
    }

    pub fn index(&self) -> &ClassifierIndex {
        &self.index
    }

    pub fn restklasse(&self) -> &Identity {
        &self.restklasse
    }

    pub fn distance_threshold(&self) -> f32 {
        self.distance_threshold
    }

    /// Classify a query embedding.
    ///
    /// Exhaustive scan over the index; the lowest-index row wins among exact
    /// distance ties, so repeated queries against one index are stable. A
    /// minimum distance strictly greater than the threshold is rejected to
    /// restklasse.
    pub fn classify(&self, query: &Embedding) -> &Identity {
        let mut best: Option<(usize, f32)> = None;
        for (row, stored) in self.index.embeddings.iter().enumerate() {
            let dist = query.euclidean_distance(stored);
            match best {
                Some((_, best_dist)) if dist >= best_dist => {}
                _ => best = Some((row, dist)),
            }
        }

        match best {
            Some((row, dist)) if dist <= self.distance_threshold => {
                tracing::trace!(row, dist, identity = %self.index.identities[row], "match");
                &self.index.identities[row]
            }
            Some((_, dist)) => {
                tracing::trace!(dist, threshold = self.distance_threshold, "rejected");
                &self.restklasse
            }
            None => &self.restklasse,
        }
    }
}
