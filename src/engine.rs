//! Model execution behind a narrow `run(input) -> logits` seam.
//!
//! The worker is the only owner of an engine; nothing here is shared or
//! locked. `OnnxEngine` runs the exported CRNN on ONNX Runtime's CPU
//! execution provider.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ndarray::{Array3, Array4};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::error::InferenceError;

/// Opaque recognition model.
///
/// Implementations need not be thread-safe or re-entrant: the worker calls
/// `run` for one input at a time and never from two threads at once.
pub trait InferenceEngine: Send + 'static {
    fn name(&self) -> &str;

    /// Run the model on a `[1, 1, H, W]` input and return logits of shape
    /// `(T, batch, classes)`.
    fn run(&mut self, input: &Array4<f32>) -> Result<Array3<f32>, InferenceError>;
}

/// Largest model artifact we are willing to download (200MB).
pub const MAX_MODEL_DOWNLOAD_SIZE: u64 = 200 * 1024 * 1024;

pub struct OnnxEngine {
    session: Session,
    input_name: String,
    name: String,
}

impl OnnxEngine {
    /// Load the model once. Failure here is fatal for the service.
    pub fn load(path: &Path, input_name: &str) -> Result<Self, InferenceError> {
        let load_err = |reason: String| InferenceError::ModelLoad {
            path: path.display().to_string(),
            reason,
        };

        let session = Session::builder()
            .map_err(|e| load_err(e.to_string()))?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .map_err(|e| load_err(e.to_string()))?
            .with_intra_threads(1)
            .map_err(|e| load_err(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e| load_err(e.to_string()))?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());

        info!(model = %name, path = %path.display(), "ONNX model loaded on CPU provider");

        Ok(Self {
            session,
            input_name: input_name.to_string(),
            name,
        })
    }
}

impl InferenceEngine for OnnxEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, input: &Array4<f32>) -> Result<Array3<f32>, InferenceError> {
        let tensor = Tensor::from_array(input.clone())?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();

        if dims.len() != 3 {
            return Err(InferenceError::OutputShape(format!(
                "expected (T, batch, classes), got {:?}",
                dims
            )));
        }

        Array3::from_shape_vec((dims[0], dims[1], dims[2]), data.to_vec())
            .map_err(|e| InferenceError::OutputShape(e.to_string()))
    }
}

/// Make sure the model artifact is on disk, downloading it when a URL is
/// configured and the file is missing.
pub async fn ensure_model(config: &ModelConfig) -> Result<PathBuf, InferenceError> {
    if config.path.exists() {
        info!(path = %config.path.display(), "✓ Model already present");
        return Ok(config.path.clone());
    }

    let Some(url) = config.download_url.as_deref() else {
        return Err(InferenceError::ModelLoad {
            path: config.path.display().to_string(),
            reason: "file not found and CAPTCHA_MODEL_URL is not set".to_string(),
        });
    };

    info!("📥 Downloading model from {}...", url);
    let size = download_model(url, &config.path).await?;
    info!("✅ Downloaded model ({} bytes) to {:?}", size, config.path);
    Ok(config.path.clone())
}

/// Download a model from URL to the specified path.
async fn download_model(url: &str, path: &Path) -> Result<u64, InferenceError> {
    use tokio::io::AsyncWriteExt;

    let download_err = |e: reqwest::Error| InferenceError::Download(e.to_string());
    let io_err = |e: std::io::Error| InferenceError::Download(e.to_string());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(download_err)?;

    let response = client.get(url).send().await.map_err(download_err)?;

    if !response.status().is_success() {
        return Err(InferenceError::Download(format!(
            "HTTP error: {}",
            response.status()
        )));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_MODEL_DOWNLOAD_SIZE {
            return Err(InferenceError::Download(format!(
                "Model too large: {} bytes",
                len
            )));
        }
    }

    let bytes = response.bytes().await.map_err(download_err)?;
    let size = bytes.len() as u64;

    if size > MAX_MODEL_DOWNLOAD_SIZE {
        return Err(InferenceError::Download(format!(
            "Downloaded file too large: {} bytes",
            size
        )));
    }

    // Atomic write: write to tmp file then rename
    let tmp_path = path.with_extension("download");
    let mut file = tokio::fs::File::create(&tmp_path).await.map_err(io_err)?;
    file.write_all(&bytes).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        warn!("Failed to move downloaded model into place: {}", e);
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(io_err(e));
    }

    Ok(size)
}
