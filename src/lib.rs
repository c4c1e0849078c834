pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod handler;
pub mod inference;
pub mod metrics;
pub mod preprocess;
pub mod server;

// Re-export commonly used types for easier testing
pub use crate::config::{Config, PreprocessConfig, QueueConfig, Vocabulary};
pub use crate::decoder::CtcDecoder;
pub use crate::engine::{InferenceEngine, OnnxEngine};
pub use crate::error::{DecodeError, InferenceError, PreprocessError, ServiceError};
pub use crate::handler::RequestHandler;
pub use crate::inference::{AdmissionQueue, CompletionHandle, InferenceWorker, WorkItem};
pub use crate::metrics::ServiceMetrics;
pub use crate::preprocess::{Preprocessed, Preprocessor};
pub use crate::server::create_router;
