use crate::matcher::MatchPolicy;
use crate::resolver::ResolvePolicy;
use std::path::PathBuf;

/// Engine configuration, loaded from `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// File name of the face detection model within `model_dir`.
    pub detector_model: String,
    /// File name of the embedding model within `model_dir`.
    pub embedder_model: String,
    /// Maximum match distance T (cosine distance for the default model).
    pub match_threshold: f32,
    /// Ambiguity margin ε between best and second-best distinct persons.
    pub ambiguity_margin: f32,
    /// Detections scoring below this are discarded by the resolver.
    ///
    /// The SCRFD decoder already drops anchors under its own noise floor
    /// ([`crate::detector::SCRFD_SCORE_FLOOR`]), so values below 0.3 have no
    /// further effect
    /// with the default detector.
    pub min_detection_confidence: f32,
    /// Face regions narrower or shorter than this many pixels are discarded.
    pub min_face_size: f32,
    /// Nearest references retrieved per probe.
    pub nearest_k: usize,
    /// Engine worker threads processing enroll/resolve requests.
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            detector_model: "det_10g.onnx".to_string(),
            embedder_model: "w600k_r50.onnx".to_string(),
            match_threshold: 0.6,
            ambiguity_margin: 0.05,
            min_detection_confidence: 0.5,
            min_face_size: 24.0,
            nearest_k: 5,
            workers: 2,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            model_dir: std::env::var("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            detector_model: std::env::var("ROLLCALL_DETECTOR_MODEL")
                .unwrap_or(defaults.detector_model),
            embedder_model: std::env::var("ROLLCALL_EMBEDDING_MODEL")
                .unwrap_or(defaults.embedder_model),
            match_threshold: env_f32("ROLLCALL_MATCH_THRESHOLD", defaults.match_threshold),
            ambiguity_margin: env_f32("ROLLCALL_AMBIGUITY_MARGIN", defaults.ambiguity_margin),
            min_detection_confidence: env_f32(
                "ROLLCALL_MIN_DETECTION_CONFIDENCE",
                defaults.min_detection_confidence,
            ),
            min_face_size: env_f32("ROLLCALL_MIN_FACE_SIZE", defaults.min_face_size),
            nearest_k: env_usize("ROLLCALL_NEAREST_K", defaults.nearest_k).max(1),
            workers: env_usize("ROLLCALL_WORKERS", defaults.workers).max(1),
        }
    }

    /// Path to the face detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    /// Path to the embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedder_model)
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            threshold: self.match_threshold,
            ambiguity_margin: self.ambiguity_margin,
            k: self.nearest_k,
        }
    }

    pub fn resolve_policy(&self) -> ResolvePolicy {
        ResolvePolicy {
            min_confidence: self.min_detection_confidence,
            min_face_size: self.min_face_size,
        }
    }
}

/// Default model directory: `$XDG_DATA_HOME/rollcall/models` (or the
/// equivalent under `$HOME/.local/share`).
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
