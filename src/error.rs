use thiserror::Error;

/// Failures surfaced to a caller of the request handler.
///
/// Each variant corresponds to one outcome the HTTP layer maps to a status
/// code; see `server::status_for`.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("busy")]
    AdmissionRejected,

    #[error("inference worker is not running")]
    WorkerStopped,

    #[error("timeout")]
    Timeout,

    #[error("Invalid input: {0}")]
    InvalidInput(#[from] PreprocessError),

    #[error("Inference failed: {0}")]
    InferenceFailure(#[from] InferenceError),
}

impl ServiceError {
    /// Short label used for the `outcome` metric dimension.
    pub fn outcome(&self) -> &'static str {
        match self {
            ServiceError::AdmissionRejected => "busy",
            ServiceError::WorkerStopped => "stopped",
            ServiceError::Timeout => "timeout",
            ServiceError::InvalidInput(_) => "invalid_input",
            ServiceError::InferenceFailure(_) => "inference_failure",
        }
    }
}

/// Errors raised while turning uploaded bytes into a model input tensor.
#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("empty upload")]
    Empty,

    #[error("cannot decode image: {0}")]
    InvalidImage(#[from] image::ImageError),

    #[error("image has zero size ({width}x{height})")]
    ZeroSized { width: u32, height: u32 },

    #[error("tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Errors raised while decoding logits into text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("expected {expected} classes (alphabet + blank), model produced {actual}")]
    ClassCountMismatch { expected: usize, actual: usize },

    #[error("logits contain no batch elements")]
    EmptyBatch,
}

/// Errors raised by the inference engine or while processing a work item.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Model load failed: {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("Model download failed: {0}")]
    Download(String),

    #[error("Inference execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Unexpected model output: {0}")]
    OutputShape(String),

    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Inference panicked: {0}")]
    Panicked(String),

    #[error("Inference engine unavailable")]
    EngineUnavailable,

    #[error("Result channel closed before completion")]
    Dropped,
}

impl From<ort::Error> for InferenceError {
    fn from(err: ort::Error) -> Self {
        InferenceError::ExecutionFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
