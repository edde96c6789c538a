//! Embedding model adapter.
//!
//! [`EmbeddingModel`] is the uniform interface the matcher configures itself
//! from: any model family substitutes behind it without touching the decision
//! policy. [`ArcFaceEmbedder`] is the ONNX implementation, extracting
//! 512-dimensional embeddings from aligned face crops with the w600k_r50
//! ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding, Metric};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0 — ArcFace uses symmetric normalization
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_ID: &str = "w600k_r50";
/// Regions narrower or shorter than this cannot carry enough identity
/// signal once upscaled into the 112×112 aligned crop.
const ARCFACE_MIN_REGION: f32 = 16.0;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("face region {width:.0}x{height:.0} is too small or degenerate to embed")]
    InvalidRegion { width: f32, height: f32 },
    #[error("face has no landmarks — detector must return landmarks for alignment")]
    MissingLandmarks,
    #[error("embedding inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Pluggable face-embedding model.
///
/// Produces a fixed-length vector per face region and advertises its own
/// dimensionality, distance metric, and identity so the gallery and matcher
/// configure themselves without hardcoding model knowledge.
pub trait EmbeddingModel: Send + Sync {
    /// Embed one detected face from a grayscale image.
    ///
    /// Fails with [`EmbedError::InvalidRegion`] for degenerate regions and
    /// [`EmbedError::ModelUnavailable`] if the backing model cannot load.
    fn embed(&self, frame: &GrayImage, face: &BoundingBox) -> Result<Embedding, EmbedError>;

    /// Fixed output dimensionality D.
    fn dimensionality(&self) -> usize;

    /// Distance metric this model's embeddings are meant to be compared with.
    fn recommended_metric(&self) -> Metric;

    /// Stable identifier of the model family and weights version.
    fn model_id(&self) -> &str;
}

/// Lazy load-once session state shared by concurrent callers. A failed load
/// is sticky; retrying a deterministic load failure per call gains nothing.
enum SessionState {
    Unloaded,
    Ready(Session),
    Failed(String),
}

impl SessionState {
    fn ensure_loaded(&mut self, path: &Path) -> Result<&mut Session, EmbedError> {
        if let SessionState::Unloaded = self {
            *self = match load_session(path) {
                Ok(s) => SessionState::Ready(s),
                Err(e) => SessionState::Failed(e.to_string()),
            };
        }
        match self {
            SessionState::Ready(s) => Ok(s),
            SessionState::Failed(msg) => Err(EmbedError::ModelUnavailable(msg.clone())),
            SessionState::Unloaded => Err(EmbedError::ModelUnavailable("model not loaded".into())),
        }
    }
}

fn load_session(model_path: &Path) -> Result<Session, EmbedError> {
    if !model_path.exists() {
        return Err(EmbedError::ModelUnavailable(format!(
            "model file not found: {} — download from insightface and place in the model dir",
            model_path.display()
        )));
    }

    let session = Session::builder()?
        .with_intra_threads(2)
        .map_err(ort::Error::from)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = %model_path.display(),
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ArcFace model"
    );

    Ok(session)
}

/// ArcFace-based embedding model.
pub struct ArcFaceEmbedder {
    model_path: PathBuf,
    state: Mutex<SessionState>,
}

impl ArcFaceEmbedder {
    /// Create an embedder for the given ONNX model path. The session is not
    /// loaded until the first [`EmbeddingModel::embed`] call; the mutex
    /// guarantees concurrent first calls load it exactly once.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            state: Mutex::new(SessionState::Unloaded),
        }
    }

    /// Preprocess a 112×112 grayscale aligned face crop into a NCHW float tensor.
    fn preprocess(aligned_face: &[u8]) -> Array4<f32> {
        let size = ALIGNED_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let pixel = aligned_face.get(y * size + x).copied().unwrap_or(0) as f32;

                let normalized = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
                // Grayscale → 3-channel: replicate Y → [R=Y, G=Y, B=Y]
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        tensor
    }
}

impl EmbeddingModel for ArcFaceEmbedder {
    fn embed(&self, frame: &GrayImage, face: &BoundingBox) -> Result<Embedding, EmbedError> {
        if !face.width.is_finite()
            || !face.height.is_finite()
            || face.width < ARCFACE_MIN_REGION
            || face.height < ARCFACE_MIN_REGION
        {
            return Err(EmbedError::InvalidRegion {
                width: face.width,
                height: face.height,
            });
        }

        let landmarks = face.landmarks.as_ref().ok_or(EmbedError::MissingLandmarks)?;

        // Align face to the canonical 112x112 position before extraction.
        let aligned = alignment::align_face(frame, landmarks);
        let input = Self::preprocess(&aligned);

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let session = state.ensure_loaded(&self.model_path)?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::Inference(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedError::Inference(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        // L2-normalize so cosine distance behaves uniformly across probes.
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Embedding {
            values,
            model_id: ARCFACE_MODEL_ID.to_string(),
        })
    }

    fn dimensionality(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    fn recommended_metric(&self) -> Metric {
        Metric::Cosine
    }

    fn model_id(&self) -> &str {
        ARCFACE_MODEL_ID
    }
}
