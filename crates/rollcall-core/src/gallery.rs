//! Gallery store: the enrolled reference embeddings eligible for matching.
//!
//! One store is bound to one embedding model (identifier + dimensionality D);
//! embeddings from different models are never compared. Nearest-neighbor
//! queries are an exact brute-force scan — at event-attendance scale (tens of
//! thousands of references) this is fast enough, and approximate indexes
//! would reintroduce exactly the false-accept risk the matcher exists to
//! prevent.

use crate::types::{Embedding, EmbeddingId, Metric, PersonId, ReferenceEmbedding};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("embedding dimensionality {got} does not match gallery dimensionality {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("embedding from model '{got}' cannot be compared against a gallery built on '{expected}'")]
    ModelMismatch { expected: String, got: String },
    #[error("no such person or reference embedding")]
    NotFound,
}

/// One nearest-neighbor hit, ascending by distance.
#[derive(Debug, Clone)]
pub struct NearestHit {
    pub person_id: PersonId,
    pub embedding_id: EmbeddingId,
    pub distance: f32,
}

/// Thread-safe store of reference embeddings, keyed by person.
///
/// Mutations (add/remove) are mutually exclusive; queries take a read lock
/// for their whole scan, so each query sees either the pre- or post-mutation
/// gallery, never a partially mutated one.
pub struct GalleryStore {
    model_id: String,
    dimensionality: usize,
    metric: Metric,
    people: RwLock<HashMap<PersonId, Vec<ReferenceEmbedding>>>,
}

impl GalleryStore {
    /// Create an empty gallery bound to one embedding model.
    pub fn new(model_id: impl Into<String>, dimensionality: usize, metric: Metric) -> Self {
        Self {
            model_id: model_id.into(),
            dimensionality,
            metric,
            people: RwLock::new(HashMap::new()),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimensionality(&self) -> usize {
        self.dimensionality
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Total number of stored reference embeddings.
    pub fn len(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn person_count(&self) -> usize {
        self.read().len()
    }

    /// Reference embeddings currently enrolled for one person.
    pub fn references_for(&self, person_id: PersonId) -> Vec<ReferenceEmbedding> {
        self.read().get(&person_id).cloned().unwrap_or_default()
    }

    /// Enroll a new reference embedding for a person.
    ///
    /// The embedding must match the gallery's model identifier and
    /// dimensionality; mismatches are configuration errors, never coerced.
    pub fn add(
        &self,
        person_id: PersonId,
        embedding: Embedding,
        source_image: impl Into<String>,
    ) -> Result<ReferenceEmbedding, GalleryError> {
        self.check_compatible(&embedding)?;

        let reference = ReferenceEmbedding {
            id: EmbeddingId::new(),
            person_id,
            embedding,
            source_image: source_image.into(),
            enrolled_at: Utc::now(),
        };

        let mut people = self.write();
        people.entry(person_id).or_default().push(reference.clone());

        tracing::debug!(%person_id, embedding_id = %reference.id, "reference enrolled");
        Ok(reference)
    }

    /// Remove one reference embedding. Fails with `NotFound` if the person or
    /// the embedding id is unknown.
    pub fn remove(&self, person_id: PersonId, embedding_id: EmbeddingId) -> Result<(), GalleryError> {
        let mut people = self.write();
        let refs = people.get_mut(&person_id).ok_or(GalleryError::NotFound)?;

        let before = refs.len();
        refs.retain(|r| r.id != embedding_id);
        if refs.len() == before {
            return Err(GalleryError::NotFound);
        }
        if refs.is_empty() {
            people.remove(&person_id);
        }

        tracing::debug!(%person_id, %embedding_id, "reference revoked");
        Ok(())
    }

    /// Remove a person and all of their reference embeddings.
    /// Returns the number of embeddings removed.
    pub fn remove_person(&self, person_id: PersonId) -> Result<usize, GalleryError> {
        let removed = self
            .write()
            .remove(&person_id)
            .ok_or(GalleryError::NotFound)?;

        tracing::debug!(%person_id, references = removed.len(), "person removed");
        Ok(removed.len())
    }

    /// Exact k-nearest-neighbor query over every stored reference, ordered
    /// ascending by distance. An empty gallery legally yields an empty result.
    pub fn query_nearest(&self, probe: &Embedding, k: usize) -> Result<Vec<NearestHit>, GalleryError> {
        self.check_compatible(probe)?;

        let people = self.read();
        let mut hits: Vec<NearestHit> = people
            .iter()
            .flat_map(|(&person_id, refs)| {
                refs.iter().map(move |r| NearestHit {
                    person_id,
                    embedding_id: r.id,
                    distance: self.metric.distance(probe, &r.embedding),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);

        Ok(hits)
    }

    fn check_compatible(&self, embedding: &Embedding) -> Result<(), GalleryError> {
        if embedding.model_id != self.model_id {
            return Err(GalleryError::ModelMismatch {
                expected: self.model_id.clone(),
                got: embedding.model_id.clone(),
            });
        }
        if embedding.dimensionality() != self.dimensionality {
            return Err(GalleryError::DimensionMismatch {
                expected: self.dimensionality,
                got: embedding.dimensionality(),
            });
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PersonId, Vec<ReferenceEmbedding>>> {
        self.people
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PersonId, Vec<ReferenceEmbedding>>> {
        self.people
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
