//! Batch resolver: one event image in, attendance decisions out.
//!
//! Runs the detector over the image, embeds and matches every usable face
//! region, then reconciles the per-face results into a deduplicated list of
//! accepted person ids plus a full audit trail. Per-face failures are
//! isolated: a bad region is recorded against that probe and the rest of the
//! image continues.

use crate::detector::{DetectError, FaceDetect};
use crate::embedder::{EmbedError, EmbeddingModel};
use crate::gallery::GalleryError;
use crate::matcher::Matcher;
use crate::types::{BoundingBox, EventId, MatchResult, MatchStatus, PersonId};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("detection failed: {0}")]
    Detect(#[from] DetectError),
    #[error("embedding failed: {0}")]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("resolution cancelled")]
    Cancelled,
}

/// Cooperative cancellation for a long-running batch resolution.
///
/// Checked between per-face steps; model calls are treated as atomic and are
/// not interrupted mid-inference.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Region filtering applied before embedding. Policy lives here, not in the
/// detector, which always returns raw detections.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResolvePolicy {
    /// Detections scoring below this are discarded without embedding.
    pub min_confidence: f32,
    /// Regions narrower or shorter than this many pixels are discarded.
    pub min_face_size: f32,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            min_face_size: 24.0,
        }
    }
}

/// Audit record for one raw match attempt within an event image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeAudit {
    /// Index of the face within the detector's output for this image.
    pub probe: usize,
    pub region: BoundingBox,
    /// The match decision, absent when embedding failed for this probe.
    pub result: Option<MatchResult>,
    pub error: Option<String>,
    /// Set when this probe originally matched a person but lost the
    /// same-person deduplication to a closer probe in the same image.
    pub demoted_from: Option<PersonId>,
}

/// Final outcome for one event image: deduplicated accepted person ids plus
/// the audit trail of every raw attempt (matched, unknown, ambiguous,
/// demoted, failed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResolution {
    pub event_id: EventId,
    pub accepted: Vec<PersonId>,
    pub audit: Vec<ProbeAudit>,
}

/// Orchestrates detector → embedder → matcher for every face in an image.
pub struct BatchResolver {
    detector: Arc<dyn FaceDetect>,
    embedder: Arc<dyn EmbeddingModel>,
    matcher: Matcher,
    policy: ResolvePolicy,
}

impl BatchResolver {
    pub fn new(
        detector: Arc<dyn FaceDetect>,
        embedder: Arc<dyn EmbeddingModel>,
        matcher: Matcher,
        policy: ResolvePolicy,
    ) -> Self {
        Self {
            detector,
            embedder,
            matcher,
            policy,
        }
    }

    pub fn detector(&self) -> &Arc<dyn FaceDetect> {
        &self.detector
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingModel> {
        &self.embedder
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn policy(&self) -> ResolvePolicy {
        self.policy
    }

    /// Resolve one event image into attendance decisions.
    ///
    /// Zero detected faces is a legal empty resolution. Per-face embedding
    /// failures become audit entries; only unusable input, a missing model,
    /// gallery misconfiguration, or cancellation fail the whole image.
    pub fn resolve(
        &self,
        event_id: EventId,
        image: &GrayImage,
        cancel: &CancelFlag,
    ) -> Result<EventResolution, ResolveError> {
        if cancel.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }

        let detections = self.detector.detect(image)?;
        tracing::debug!(event = %event_id, faces = detections.len(), "faces detected");

        let mut audit: Vec<ProbeAudit> = Vec::new();

        for (probe, face) in detections.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ResolveError::Cancelled);
            }

            if face.confidence < self.policy.min_confidence
                || face.width < self.policy.min_face_size
                || face.height < self.policy.min_face_size
            {
                tracing::trace!(
                    event = %event_id,
                    probe,
                    confidence = face.confidence,
                    "region discarded below confidence/size floor"
                );
                continue;
            }

            let embedding = match self.embedder.embed(image, face) {
                Ok(e) => e,
                // A missing model fails every probe identically; abort.
                Err(e @ EmbedError::ModelUnavailable(_)) => return Err(ResolveError::Embed(e)),
                Err(e) => {
                    tracing::warn!(event = %event_id, probe, error = %e, "probe skipped: embedding failed");
                    audit.push(ProbeAudit {
                        probe,
                        region: face.clone(),
                        result: None,
                        error: Some(e.to_string()),
                        demoted_from: None,
                    });
                    continue;
                }
            };

            let result = self.matcher.resolve(probe, &embedding)?;
            audit.push(ProbeAudit {
                probe,
                region: face.clone(),
                result: Some(result),
                error: None,
                demoted_from: None,
            });
        }

        let accepted = reconcile(&mut audit);

        tracing::info!(
            event = %event_id,
            attempts = audit.len(),
            accepted = accepted.len(),
            "event image resolved"
        );

        Ok(EventResolution {
            event_id,
            accepted,
            audit,
        })
    }
}

/// Same-person deduplication: a person cannot attend twice in one photo.
///
/// When several probes match one person, the smallest distance wins and the
/// others are demoted to `Unknown` (conservatively treated as non-evidence —
/// either a re-detection of the same face or a lookalike bystander). Returns
/// the accepted person ids in probe order.
fn reconcile(audit: &mut [ProbeAudit]) -> Vec<PersonId> {
    // Best (audit index, distance) per matched person.
    let mut best: HashMap<PersonId, (usize, f32)> = HashMap::new();
    for (idx, entry) in audit.iter().enumerate() {
        let Some(result) = &entry.result else { continue };
        if result.status != MatchStatus::Matched {
            continue;
        }
        let Some(person) = result.person_id else { continue };
        let Some(distance) = result.distance else { continue };

        match best.get(&person) {
            Some(&(_, d)) if d <= distance => {}
            _ => {
                best.insert(person, (idx, distance));
            }
        }
    }

    let mut accepted = Vec::new();
    for (idx, entry) in audit.iter_mut().enumerate() {
        let person = match &entry.result {
            Some(r) if r.status == MatchStatus::Matched => match r.person_id {
                Some(p) => p,
                None => continue,
            },
            _ => continue,
        };

        if best.get(&person).map(|&(winner, _)| winner) == Some(idx) {
            accepted.push(person);
        } else {
            tracing::debug!(%person, probe = entry.probe, "duplicate match demoted");
            entry.demoted_from = Some(person);
            if let Some(result) = &mut entry.result {
                result.person_id = None;
                result.status = MatchStatus::Unknown;
            }
        }
    }

    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::GalleryStore;
    use crate::matcher::MatchPolicy;
    use crate::types::{Embedding, Metric};

    /// Detector stub returning a fixed set of regions.
    struct StubDetector {
        boxes: Vec<BoundingBox>,
    }

    impl FaceDetect for StubDetector {
        fn detect(&self, _image: &GrayImage) -> Result<Vec<BoundingBox>, DetectError> {
            Ok(self.boxes.clone())
        }
    }

    /// Embedder stub keyed by the region's x coordinate. Regions without a
    /// mapping fail like a degenerate crop would.
    struct StubEmbedder {
        vectors: HashMap<i32, Vec<f32>>,
    }

    impl EmbeddingModel for StubEmbedder {
        fn embed(&self, _frame: &GrayImage, face: &BoundingBox) -> Result<Embedding, EmbedError> {
            self.vectors
                .get(&(face.x as i32))
                .map(|values| Embedding {
                    values: values.clone(),
                    model_id: "stub".into(),
                })
                .ok_or(EmbedError::InvalidRegion {
                    width: face.width,
                    height: face.height,
                })
        }

        fn dimensionality(&self) -> usize {
            2
        }

        fn recommended_metric(&self) -> Metric {
            Metric::Euclidean
        }

        fn model_id(&self) -> &str {
            "stub"
        }
    }

    fn bbox(x: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x,
            y: 0.0,
            width: 50.0,
            height: 50.0,
            confidence: conf,
            landmarks: None,
        }
    }

    fn resolver(
        boxes: Vec<BoundingBox>,
        vectors: HashMap<i32, Vec<f32>>,
        gallery: Arc<GalleryStore>,
    ) -> BatchResolver {
        BatchResolver::new(
            Arc::new(StubDetector { boxes }),
            Arc::new(StubEmbedder { vectors }),
            Matcher::new(gallery, MatchPolicy::default()),
            ResolvePolicy::default(),
        )
    }

    fn stub_gallery() -> Arc<GalleryStore> {
        Arc::new(GalleryStore::new("stub", 2, Metric::Euclidean))
    }

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding {
            values,
            model_id: "stub".into(),
        }
    }

    #[test]
    fn test_no_faces_is_empty_resolution() {
        let r = resolver(vec![], HashMap::new(), stub_gallery());
        let out = r
            .resolve(EventId::new(), &GrayImage::new(10, 10), &CancelFlag::new())
            .unwrap();
        assert!(out.accepted.is_empty());
        assert!(out.audit.is_empty());
    }

    #[test]
    fn test_same_person_twice_accepted_once() {
        let gallery = stub_gallery();
        let person = PersonId::new();
        gallery.add(person, emb(vec![0.0, 0.0]), "ref").unwrap();

        // Two overlapping detections of the same face: the second embeds closer.
        let vectors = HashMap::from([(10, vec![0.10, 0.0]), (20, vec![0.05, 0.0])]);
        let r = resolver(vec![bbox(10.0, 0.9), bbox(20.0, 0.8)], vectors, gallery);

        let out = r
            .resolve(EventId::new(), &GrayImage::new(10, 10), &CancelFlag::new())
            .unwrap();

        assert_eq!(out.accepted, vec![person]);
        assert_eq!(out.audit.len(), 2);

        // First probe demoted to unknown, demotion recorded.
        let demoted = &out.audit[0];
        assert_eq!(demoted.demoted_from, Some(person));
        let result = demoted.result.as_ref().unwrap();
        assert_eq!(result.status, MatchStatus::Unknown);
        assert_eq!(result.person_id, None);

        // Winner untouched.
        let winner = out.audit[1].result.as_ref().unwrap();
        assert_eq!(winner.status, MatchStatus::Matched);
        assert_eq!(winner.person_id, Some(person));
    }

    #[test]
    fn test_distinct_persons_both_accepted() {
        let gallery = stub_gallery();
        let a = PersonId::new();
        let b = PersonId::new();
        gallery.add(a, emb(vec![0.0, 0.0]), "a").unwrap();
        gallery.add(b, emb(vec![10.0, 0.0]), "b").unwrap();

        let vectors = HashMap::from([(10, vec![0.1, 0.0]), (20, vec![10.1, 0.0])]);
        let r = resolver(vec![bbox(10.0, 0.9), bbox(20.0, 0.9)], vectors, gallery);

        let out = r
            .resolve(EventId::new(), &GrayImage::new(10, 10), &CancelFlag::new())
            .unwrap();
        assert_eq!(out.accepted, vec![a, b]);
    }

    #[test]
    fn test_low_confidence_and_small_regions_discarded() {
        let gallery = stub_gallery();
        gallery.add(PersonId::new(), emb(vec![0.0, 0.0]), "a").unwrap();

        let mut small = bbox(10.0, 0.9);
        small.width = 10.0; // below the 24px floor
        let vectors = HashMap::from([(10, vec![0.0, 0.0]), (20, vec![0.0, 0.0])]);
        let r = resolver(vec![small, bbox(20.0, 0.2)], vectors, gallery);

        let out = r
            .resolve(EventId::new(), &GrayImage::new(10, 10), &CancelFlag::new())
            .unwrap();
        // Discarded regions never reach embedding; no attempts recorded.
        assert!(out.accepted.is_empty());
        assert!(out.audit.is_empty());
    }

    #[test]
    fn test_per_face_failure_is_isolated() {
        let gallery = stub_gallery();
        let person = PersonId::new();
        gallery.add(person, emb(vec![0.0, 0.0]), "a").unwrap();

        // Probe at x=10 has no stub vector → embed fails; x=20 matches.
        let vectors = HashMap::from([(20, vec![0.1, 0.0])]);
        let r = resolver(vec![bbox(10.0, 0.9), bbox(20.0, 0.9)], vectors, gallery);

        let out = r
            .resolve(EventId::new(), &GrayImage::new(10, 10), &CancelFlag::new())
            .unwrap();

        assert_eq!(out.accepted, vec![person]);
        assert_eq!(out.audit.len(), 2);
        assert!(out.audit[0].result.is_none());
        assert!(out.audit[0].error.is_some());
    }

    #[test]
    fn test_ambiguous_probe_not_accepted_but_audited() {
        let gallery = stub_gallery();
        let a = PersonId::new();
        let b = PersonId::new();
        gallery.add(a, emb(vec![0.40, 0.0]), "a").unwrap();
        gallery.add(b, emb(vec![-0.42, 0.0]), "b").unwrap();

        let vectors = HashMap::from([(10, vec![0.0, 0.0])]);
        let r = resolver(vec![bbox(10.0, 0.9)], vectors, gallery);

        let out = r
            .resolve(EventId::new(), &GrayImage::new(10, 10), &CancelFlag::new())
            .unwrap();
        assert!(out.accepted.is_empty());
        let result = out.audit[0].result.as_ref().unwrap();
        assert_eq!(result.status, MatchStatus::Ambiguous);
    }

    #[test]
    fn test_cancellation_between_faces() {
        let cancel = CancelFlag::new();
        cancel.cancel();

        let r = resolver(vec![bbox(10.0, 0.9)], HashMap::new(), stub_gallery());
        match r.resolve(EventId::new(), &GrayImage::new(10, 10), &cancel) {
            Err(ResolveError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[test]
    fn test_model_unavailable_aborts_batch() {
        struct BrokenEmbedder;
        impl EmbeddingModel for BrokenEmbedder {
            fn embed(&self, _: &GrayImage, _: &BoundingBox) -> Result<Embedding, EmbedError> {
                Err(EmbedError::ModelUnavailable("missing".into()))
            }
            fn dimensionality(&self) -> usize {
                2
            }
            fn recommended_metric(&self) -> Metric {
                Metric::Euclidean
            }
            fn model_id(&self) -> &str {
                "stub"
            }
        }

        let r = BatchResolver::new(
            Arc::new(StubDetector {
                boxes: vec![bbox(10.0, 0.9), bbox(20.0, 0.9)],
            }),
            Arc::new(BrokenEmbedder),
            Matcher::new(stub_gallery(), MatchPolicy::default()),
            ResolvePolicy::default(),
        );

        match r.resolve(EventId::new(), &GrayImage::new(10, 10), &CancelFlag::new()) {
            Err(ResolveError::Embed(EmbedError::ModelUnavailable(_))) => {}
            other => panic!("expected ModelUnavailable, got {other:?}"),
        }
    }
}
