use anyhow::Result;
use std::sync::Arc;

use captcha_solver_node::{
    config::Config, create_router, engine, AdmissionQueue, CtcDecoder, InferenceWorker,
    OnnxEngine, PreprocessConfig, Preprocessor, RequestHandler, ServiceMetrics,
};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with filters
    // ONNX Runtime logs every session option at info; keep it quiet
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,ort=warn")
            }),
        )
        .init();

    tracing::info!("Starting captcha solver node...");

    let config = Config::load()?;
    let vocabulary = config.vocabulary()?;
    tracing::info!(
        queue_capacity = config.queue_config.capacity,
        timeout_ms = config.queue_config.timeout.as_millis() as u64,
        classes = vocabulary.num_classes(),
        "Configuration loaded"
    );

    let metrics = Arc::new(ServiceMetrics::new()?);

    // Model is the only hard dependency; without it there is nothing to serve
    let model_path = engine::ensure_model(&config.model_config).await?;
    let onnx = OnnxEngine::load(&model_path, &config.model_config.input_name)?;

    let (queue, rx) = AdmissionQueue::new(config.queue_config.capacity, metrics.clone());
    let worker = InferenceWorker::new(Box::new(onnx), CtcDecoder::new(vocabulary), metrics.clone())
        .skip_abandoned(config.queue_config.skip_abandoned);
    let worker_handle = worker.spawn(rx);

    let handler = RequestHandler::new(
        Preprocessor::new(PreprocessConfig::default()),
        queue,
        config.queue_config.timeout,
        metrics,
    );
    let app = create_router(handler, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    tracing::info!("Captcha API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router owned the last queue sender; the worker drains and exits
    if let Err(e) = worker_handle.await {
        tracing::error!("Inference worker ended abnormally: {}", e);
    }

    Ok(())
}
