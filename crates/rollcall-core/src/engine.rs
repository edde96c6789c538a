//! Process-facing engine: a fixed-size pool of worker threads behind a
//! clone-safe async handle.
//!
//! Inference work (enrollment, event resolution) is CPU-bound and runs on
//! dedicated OS threads fed by a request channel; gallery mutations that need
//! no inference (revoke, remove person) go straight to the store. The web and
//! storage layers above this engine see only opaque ids and decision values.

use crate::config::EngineConfig;
use crate::detector::{DetectError, FaceDetect, ScrfdDetector};
use crate::embedder::{ArcFaceEmbedder, EmbedError, EmbeddingModel};
use crate::gallery::{GalleryError, GalleryStore};
use crate::matcher::Matcher;
use crate::resolver::{BatchResolver, CancelFlag, EventResolution, ResolveError};
use crate::types::{EmbeddingId, EventId, PersonId, ReferenceEmbedding};
use image::GrayImage;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("image could not be decoded: {0}")]
    UnreadableImage(String),
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("expected exactly one face in the reference image, found {found}")]
    FaceCount { found: usize },
    #[error("reference image matches already-enrolled person {person_id}")]
    DuplicateIdentity { person_id: PersonId },
    #[error("engine workers exited")]
    ChannelClosed,
}

/// Messages sent from async callers to the worker pool.
enum EngineRequest {
    Enroll {
        person_id: PersonId,
        source_image: String,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<ReferenceEmbedding, EngineError>>,
    },
    Resolve {
        event_id: EventId,
        bytes: Vec<u8>,
        cancel: CancelFlag,
        reply: oneshot::Sender<Result<EventResolution, EngineError>>,
    },
}

/// Clone-safe handle to the engine worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    gallery: Arc<GalleryStore>,
}

impl EngineHandle {
    /// Enroll one reference image for a person.
    ///
    /// The image must contain exactly one usable face, and that face must not
    /// already match a different enrolled person — a reference photo of an
    /// already-known individual under a new identity is rejected.
    pub async fn enroll_reference(
        &self,
        person_id: PersonId,
        source_image: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<ReferenceEmbedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                person_id,
                source_image: source_image.into(),
                bytes,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Resolve one event photograph into attendance decisions.
    ///
    /// `cancel` is checked between per-face steps; pass a fresh flag when no
    /// cancellation is needed.
    pub async fn resolve_event_image(
        &self,
        event_id: EventId,
        bytes: Vec<u8>,
        cancel: CancelFlag,
    ) -> Result<EventResolution, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Resolve {
                event_id,
                bytes,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Remove one reference embedding. No inference involved, so this goes
    /// straight to the gallery.
    pub fn revoke_reference(
        &self,
        person_id: PersonId,
        embedding_id: EmbeddingId,
    ) -> Result<(), GalleryError> {
        self.gallery.remove(person_id, embedding_id)
    }

    /// Remove a person and all of their references. Returns the number of
    /// embeddings removed.
    pub fn remove_person(&self, person_id: PersonId) -> Result<usize, GalleryError> {
        self.gallery.remove_person(person_id)
    }

    pub fn gallery(&self) -> &Arc<GalleryStore> {
        &self.gallery
    }
}

/// Per-worker resources: the shared gallery plus a resolver owning the
/// adapter and policy set; enrollment borrows the resolver's parts.
struct Worker {
    gallery: Arc<GalleryStore>,
    resolver: BatchResolver,
}

impl Worker {
    fn run_enroll(
        &self,
        person_id: PersonId,
        source_image: String,
        bytes: &[u8],
    ) -> Result<ReferenceEmbedding, EngineError> {
        let image = decode_grayscale(bytes)?;
        let policy = self.resolver.policy();

        let detections = self.resolver.detector().detect(&image)?;
        let usable: Vec<_> = detections
            .iter()
            .filter(|f| {
                f.confidence >= policy.min_confidence
                    && f.width >= policy.min_face_size
                    && f.height >= policy.min_face_size
            })
            .collect();

        // Reference photos must carry exactly one identity.
        if usable.len() != 1 {
            return Err(EngineError::FaceCount {
                found: usable.len(),
            });
        }

        let embedding = self.resolver.embedder().embed(&image, usable[0])?;

        // Duplicate-identity guard: a face within the match threshold of ANY
        // other enrolled person must not be enrolled as someone new. This
        // scans the raw neighbors rather than the matcher's decision so an
        // enrollee sitting close to two persons (where the matcher would
        // refuse to pick) is still rejected.
        let match_policy = self.resolver.matcher().policy();
        let hits = self.gallery.query_nearest(&embedding, self.gallery.len())?;
        if let Some(hit) = hits
            .iter()
            .find(|h| h.person_id != person_id && h.distance < match_policy.threshold)
        {
            tracing::warn!(
                new = %person_id,
                existing = %hit.person_id,
                distance = hit.distance,
                "enrollment rejected: face matches another enrolled person"
            );
            return Err(EngineError::DuplicateIdentity {
                person_id: hit.person_id,
            });
        }

        let reference = self.gallery.add(person_id, embedding, source_image)?;
        tracing::info!(%person_id, embedding_id = %reference.id, "reference enrolled");
        Ok(reference)
    }

    fn run_resolve(
        &self,
        event_id: EventId,
        bytes: &[u8],
        cancel: &CancelFlag,
    ) -> Result<EventResolution, EngineError> {
        let image = decode_grayscale(bytes)?;
        Ok(self.resolver.resolve(event_id, &image, cancel)?)
    }
}

fn decode_grayscale(bytes: &[u8]) -> Result<GrayImage, EngineError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| EngineError::UnreadableImage(e.to_string()))?;
    Ok(image.to_luma8())
}

/// Spawn the engine with the default ONNX adapters from `config`.
///
/// Models load lazily on first use inside the adapters; a missing model file
/// surfaces as `ModelUnavailable` on the first inference call.
pub fn spawn_engine(config: EngineConfig) -> EngineHandle {
    let detector: Arc<dyn FaceDetect> = Arc::new(ScrfdDetector::new(config.detector_model_path()));
    let embedder = Arc::new(ArcFaceEmbedder::new(config.embedder_model_path()));
    let gallery = Arc::new(GalleryStore::new(
        embedder.model_id(),
        embedder.dimensionality(),
        embedder.recommended_metric(),
    ));
    spawn_engine_with(detector, embedder, gallery, config)
}

/// Spawn the engine with injected components: alternate model families in
/// production, stubs in tests. The gallery must be built for the injected
/// embedder's model id, dimensionality, and metric.
pub fn spawn_engine_with(
    detector: Arc<dyn FaceDetect>,
    embedder: Arc<dyn EmbeddingModel>,
    gallery: Arc<GalleryStore>,
    config: EngineConfig,
) -> EngineHandle {
    let (tx, rx) = mpsc::channel::<EngineRequest>(16);
    let rx = Arc::new(Mutex::new(rx));

    for i in 0..config.workers.max(1) {
        let worker = Worker {
            gallery: gallery.clone(),
            resolver: BatchResolver::new(
                detector.clone(),
                embedder.clone(),
                Matcher::new(gallery.clone(), config.match_policy()),
                config.resolve_policy(),
            ),
        };
        let rx = rx.clone();

        std::thread::Builder::new()
            .name(format!("rollcall-engine-{i}"))
            .spawn(move || {
                tracing::info!(worker = i, "engine worker started");
                loop {
                    // Hold the lock only to receive; processing runs unlocked
                    // so workers handle requests in parallel.
                    let req = {
                        let mut rx = rx
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        match rx.blocking_recv() {
                            Some(req) => req,
                            None => break,
                        }
                    };

                    match req {
                        EngineRequest::Enroll {
                            person_id,
                            source_image,
                            bytes,
                            reply,
                        } => {
                            let result = worker.run_enroll(person_id, source_image, &bytes);
                            let _ = reply.send(result);
                        }
                        EngineRequest::Resolve {
                            event_id,
                            bytes,
                            cancel,
                            reply,
                        } => {
                            let result = worker.run_resolve(event_id, &bytes, &cancel);
                            let _ = reply.send(result);
                        }
                    }
                }
                tracing::info!(worker = i, "engine worker exiting");
            })
            .expect("failed to spawn engine worker");
    }

    EngineHandle { tx, gallery }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding, MatchStatus, Metric};

    /// Detector stub keyed on image width: 32 → no faces, 128 → two faces,
    /// anything else → one face.
    struct WidthKeyedDetector;

    fn stub_face(x: f32) -> BoundingBox {
        BoundingBox {
            x,
            y: 0.0,
            width: 50.0,
            height: 50.0,
            confidence: 0.9,
            landmarks: None,
        }
    }

    impl FaceDetect for WidthKeyedDetector {
        fn detect(&self, image: &GrayImage) -> Result<Vec<BoundingBox>, DetectError> {
            Ok(match image.width() {
                32 => vec![],
                128 => vec![stub_face(0.0), stub_face(60.0)],
                _ => vec![stub_face(0.0)],
            })
        }
    }

    /// Embedder stub: the embedding encodes the image width, so tests choose
    /// distances by choosing image sizes.
    struct WidthKeyedEmbedder;

    impl EmbeddingModel for WidthKeyedEmbedder {
        fn embed(&self, frame: &GrayImage, _face: &BoundingBox) -> Result<Embedding, EmbedError> {
            Ok(Embedding {
                values: vec![frame.width() as f32 / 100.0, 0.0],
                model_id: "stub".into(),
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

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = GrayImage::new(width, height);
        let mut buf = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .expect("encode test png");
        buf
    }

    fn spawn_stub_engine() -> EngineHandle {
        let gallery = Arc::new(GalleryStore::new("stub", 2, Metric::Euclidean));
        spawn_engine_with(
            Arc::new(WidthKeyedDetector),
            Arc::new(WidthKeyedEmbedder),
            gallery,
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_enroll_and_resolve_roundtrip() {
        let engine = spawn_stub_engine();
        let person = PersonId::new();

        let reference = engine
            .enroll_reference(person, "img-1", png_bytes(64, 64))
            .await
            .unwrap();
        assert_eq!(reference.person_id, person);
        assert_eq!(engine.gallery().len(), 1);

        // Event image of the same width embeds to the same vector → matched.
        let resolution = engine
            .resolve_event_image(EventId::new(), png_bytes(64, 64), CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(resolution.accepted, vec![person]);
    }

    #[tokio::test]
    async fn test_enroll_requires_exactly_one_face() {
        let engine = spawn_stub_engine();

        match engine
            .enroll_reference(PersonId::new(), "none", png_bytes(32, 32))
            .await
        {
            Err(EngineError::FaceCount { found: 0 }) => {}
            other => panic!("expected FaceCount 0, got {other:?}"),
        }

        match engine
            .enroll_reference(PersonId::new(), "crowd", png_bytes(128, 128))
            .await
        {
            Err(EngineError::FaceCount { found: 2 }) => {}
            other => panic!("expected FaceCount 2, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_enroll_rejects_duplicate_identity() {
        let engine = spawn_stub_engine();
        let alice = PersonId::new();
        let impostor = PersonId::new();

        engine
            .enroll_reference(alice, "alice-1", png_bytes(64, 64))
            .await
            .unwrap();

        // Width 65 embeds within the threshold of Alice's reference.
        match engine
            .enroll_reference(impostor, "impostor", png_bytes(65, 64))
            .await
        {
            Err(EngineError::DuplicateIdentity { person_id }) => assert_eq!(person_id, alice),
            other => panic!("expected DuplicateIdentity, got {other:?}"),
        }

        // The same person adding a close second reference is fine.
        engine
            .enroll_reference(alice, "alice-2", png_bytes(66, 64))
            .await
            .unwrap();
        assert_eq!(engine.gallery().references_for(alice).len(), 2);

        // A genuinely distant face enrolls normally.
        let bob = PersonId::new();
        engine
            .enroll_reference(bob, "bob-1", png_bytes(200, 64))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_enroll_rejects_face_near_two_enrolled_persons() {
        let engine = spawn_stub_engine();
        let a = PersonId::new();
        let b = PersonId::new();

        engine
            .enroll_reference(a, "a-1", png_bytes(100, 64))
            .await
            .unwrap();
        engine
            .enroll_reference(b, "b-1", png_bytes(200, 64))
            .await
            .unwrap();

        // Width 150 embeds equidistant (0.5) from both A and B — within the
        // threshold of each. A matcher would call this ambiguous; enrollment
        // must still reject it rather than mint a third identity.
        match engine
            .enroll_reference(PersonId::new(), "between", png_bytes(150, 64))
            .await
        {
            Err(EngineError::DuplicateIdentity { person_id }) => {
                assert!(person_id == a || person_id == b);
            }
            other => panic!("expected DuplicateIdentity, got {other:?}"),
        }
        assert_eq!(engine.gallery().person_count(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_image() {
        let engine = spawn_stub_engine();

        match engine
            .enroll_reference(PersonId::new(), "junk", b"not an image".to_vec())
            .await
        {
            Err(EngineError::UnreadableImage(_)) => {}
            other => panic!("expected UnreadableImage, got {other:?}"),
        }

        match engine
            .resolve_event_image(EventId::new(), b"junk".to_vec(), CancelFlag::new())
            .await
        {
            Err(EngineError::UnreadableImage(_)) => {}
            other => panic!("expected UnreadableImage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_revoke_and_remove_person() {
        let engine = spawn_stub_engine();
        let person = PersonId::new();

        let reference = engine
            .enroll_reference(person, "img", png_bytes(64, 64))
            .await
            .unwrap();

        engine.revoke_reference(person, reference.id).unwrap();
        assert!(engine.gallery().is_empty());

        assert!(matches!(
            engine.revoke_reference(person, reference.id),
            Err(GalleryError::NotFound)
        ));
        assert!(matches!(
            engine.remove_person(person),
            Err(GalleryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_resolve_cancellation() {
        let engine = spawn_stub_engine();
        let cancel = CancelFlag::new();
        cancel.cancel();

        match engine
            .resolve_event_image(EventId::new(), png_bytes(64, 64), cancel)
            .await
        {
            Err(EngineError::Resolve(ResolveError::Cancelled)) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_empty_gallery_is_all_unknown() {
        let engine = spawn_stub_engine();

        let resolution = engine
            .resolve_event_image(EventId::new(), png_bytes(64, 64), CancelFlag::new())
            .await
            .unwrap();
        assert!(resolution.accepted.is_empty());
        assert_eq!(resolution.audit.len(), 1);
        assert_eq!(
            resolution.audit[0].result.as_ref().unwrap().status,
            MatchStatus::Unknown
        );
    }
}
