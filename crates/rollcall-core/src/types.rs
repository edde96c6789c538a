use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of an enrolled person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonId(pub Uuid);

impl PersonId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PersonId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PersonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of one stored reference embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingId(pub Uuid);

impl EmbeddingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EmbeddingId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EmbeddingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of an event image being resolved. Opaque to the core; the
/// storage layer owns the actual event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Fixed-length face embedding, tagged with the model that produced it.
///
/// Embeddings from different models are never comparable; the gallery
/// enforces a single model id and dimensionality per store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Identifier of the model that produced this embedding (e.g. "w600k_r50").
    pub model_id: String,
}

impl Embedding {
    pub fn dimensionality(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Euclidean (L2) distance.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Distance metric recommended by an embedding model.
///
/// Both variants are expressed as distances (lower = more similar) so a
/// single threshold convention covers either: cosine distance is
/// `1 - cosine_similarity`, landing in [0, 2].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
    Euclidean,
}

impl Metric {
    pub fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            Metric::Cosine => 1.0 - a.cosine_similarity(b),
            Metric::Euclidean => a.euclidean_distance(b),
        }
    }
}

/// One enrolled reference embedding. Immutable once created; a changed
/// reference photo is a remove-then-add, never an in-place mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceEmbedding {
    pub id: EmbeddingId,
    pub person_id: PersonId,
    pub embedding: Embedding,
    /// Opaque id of the source image this embedding was derived from.
    pub source_image: String,
    pub enrolled_at: DateTime<Utc>,
}

/// Outcome class of one probe-to-gallery resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Matched,
    Unknown,
    Ambiguous,
}

/// Result of resolving one probe face against the gallery.
///
/// `person_id` is populated only for `Matched`; `Ambiguous` deliberately
/// withholds the candidate even though one cleared the threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    /// Index of the probe face within its source image.
    pub probe: usize,
    pub person_id: Option<PersonId>,
    /// Best distance seen, retained for audit even on unknown/ambiguous.
    /// `None` when the gallery held no candidates at all; kept finite so the
    /// JSON form round-trips through the storage layer.
    pub distance: Option<f32>,
    pub status: MatchStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding {
            values,
            model_id: "test".into(),
        }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        let b = emb(vec![1.0, 0.0, 0.0]);
        assert!((a.cosine_similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![0.0, 1.0]);
        assert!(a.cosine_similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![-1.0, 0.0]);
        assert!((a.cosine_similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![1.0, 0.0]);
        assert_eq!(a.cosine_similarity(&b), 0.0);
    }

    #[test]
    fn test_cosine_distance_range() {
        let a = emb(vec![1.0, 0.0]);
        let same = emb(vec![2.0, 0.0]);
        let opposite = emb(vec![-1.0, 0.0]);
        assert!(Metric::Cosine.distance(&a, &same).abs() < 1e-6);
        assert!((Metric::Cosine.distance(&a, &opposite) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![3.0, 4.0]);
        assert!((Metric::Euclidean.distance(&a, &b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(PersonId::new(), PersonId::new());
        assert_ne!(EmbeddingId::new(), EmbeddingId::new());
    }

    #[test]
    fn test_match_result_json_roundtrip() {
        // No-candidate results carry no distance; both shapes must survive
        // a serialize/deserialize cycle through the storage layer.
        let unknown = MatchResult {
            probe: 0,
            person_id: None,
            distance: None,
            status: MatchStatus::Unknown,
        };
        let json = serde_json::to_string(&unknown).unwrap();
        let back: MatchResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.distance, None);
        assert_eq!(back.status, MatchStatus::Unknown);

        let person = PersonId::new();
        let matched = MatchResult {
            probe: 2,
            person_id: Some(person),
            distance: Some(0.25),
            status: MatchStatus::Matched,
        };
        let json = serde_json::to_string(&matched).unwrap();
        let back: MatchResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.person_id, Some(person));
        assert!((back.distance.unwrap() - 0.25).abs() < 1e-6);
    }
}
