//! rollcall-core — face-embedding attendance matching engine.
//!
//! Identifies which enrolled individuals appear in an event photograph:
//! SCRFD face detection and ArcFace embeddings via ONNX Runtime, an exact
//! brute-force gallery of enrolled references, and a precision-first decision
//! policy (distance threshold + ambiguity margin) that never misattributes
//! presence. HTTP, accounts, and relational persistence live above this
//! crate; it exchanges only opaque ids and decision values with them.

pub mod alignment;
pub mod config;
pub mod detector;
pub mod embedder;
pub mod engine;
pub mod gallery;
pub mod matcher;
pub mod resolver;
pub mod types;

pub use config::EngineConfig;
pub use detector::{DetectError, FaceDetect, ScrfdDetector};
pub use embedder::{ArcFaceEmbedder, EmbedError, EmbeddingModel};
pub use engine::{spawn_engine, spawn_engine_with, EngineError, EngineHandle};
pub use gallery::{GalleryError, GalleryStore, NearestHit};
pub use matcher::{MatchPolicy, Matcher};
pub use resolver::{
    BatchResolver, CancelFlag, EventResolution, ProbeAudit, ResolveError, ResolvePolicy,
};
pub use types::{
    BoundingBox, Embedding, EmbeddingId, EventId, MatchResult, MatchStatus, Metric, PersonId,
    ReferenceEmbedding,
};
