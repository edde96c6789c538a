//! Probe-to-gallery decision policy.
//!
//! Resolves one probe embedding to zero-or-one enrolled persons:
//! nearest-reference aggregation per person, a distance threshold, and an
//! ambiguity margin that refuses to pick between two persons who are both
//! close. Attendance records must never misattribute presence, so the policy
//! trades recall for precision.

use crate::gallery::{GalleryError, GalleryStore};
use crate::types::{Embedding, MatchResult, MatchStatus, PersonId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tunable decision parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatchPolicy {
    /// Maximum distance for a candidate to be eligible as a match (T).
    pub threshold: f32,
    /// Minimum separation between the best and second-best distinct-person
    /// candidates; anything tighter is declared ambiguous (ε).
    pub ambiguity_margin: f32,
    /// How many nearest references to retrieve. Must cover several references
    /// per person for the nearest-reference aggregation to see them.
    pub k: usize,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            ambiguity_margin: 0.05,
            k: 5,
        }
    }
}

/// Resolves probe embeddings against one gallery.
pub struct Matcher {
    gallery: Arc<GalleryStore>,
    policy: MatchPolicy,
}

impl Matcher {
    pub fn new(gallery: Arc<GalleryStore>, policy: MatchPolicy) -> Self {
        Self { gallery, policy }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Resolve one probe embedding to a match decision.
    ///
    /// An empty gallery yields `Unknown`; only configuration errors
    /// (dimension or model mismatch) are surfaced as errors.
    pub fn resolve(&self, probe_index: usize, probe: &Embedding) -> Result<MatchResult, GalleryError> {
        let hits = self.gallery.query_nearest(probe, self.policy.k)?;

        // Per-person aggregation: hits arrive ascending, so the first hit per
        // person is that person's nearest reference. Minimum, not centroid —
        // averaging distinct poses into an artificial blur costs recall.
        let mut candidates: Vec<(PersonId, f32)> = Vec::new();
        for hit in &hits {
            if !candidates.iter().any(|(p, _)| *p == hit.person_id) {
                candidates.push((hit.person_id, hit.distance));
            }
        }

        let Some(&(best_person, best_distance)) = candidates.first() else {
            return Ok(MatchResult {
                probe: probe_index,
                person_id: None,
                distance: None,
                status: MatchStatus::Unknown,
            });
        };

        // Threshold test: the best candidate must clear T.
        if best_distance >= self.policy.threshold {
            return Ok(MatchResult {
                probe: probe_index,
                person_id: None,
                distance: Some(best_distance),
                status: MatchStatus::Unknown,
            });
        }

        // Ambiguity test: a second distinct person inside T and within ε of
        // the best means we refuse to pick, even though one candidate passed.
        if let Some(&(_, second_distance)) = candidates.get(1) {
            if second_distance < self.policy.threshold
                && (second_distance - best_distance) < self.policy.ambiguity_margin
            {
                tracing::debug!(
                    probe = probe_index,
                    best = best_distance,
                    second = second_distance,
                    "ambiguous probe: two persons within margin"
                );
                return Ok(MatchResult {
                    probe: probe_index,
                    person_id: None,
                    distance: Some(best_distance),
                    status: MatchStatus::Ambiguous,
                });
            }
        }

        Ok(MatchResult {
            probe: probe_index,
            person_id: Some(best_person),
            distance: Some(best_distance),
            status: MatchStatus::Matched,
        })
    }
}
