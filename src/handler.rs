use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, ServiceError};
use crate::inference::AdmissionQueue;
use crate::metrics::ServiceMetrics;
use crate::preprocess::Preprocessor;

/// Entry point for a single recognition request.
///
/// Preprocesses the upload, admits it to the queue or refuses, then waits
/// for the worker's answer up to `timeout`. Transport-agnostic; the HTTP
/// layer maps the returned error to a status code.
#[derive(Clone)]
pub struct RequestHandler {
    preprocessor: Preprocessor,
    queue: AdmissionQueue,
    timeout: Duration,
    metrics: Arc<ServiceMetrics>,
}

impl RequestHandler {
    pub fn new(
        preprocessor: Preprocessor,
        queue: AdmissionQueue,
        timeout: Duration,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            preprocessor,
            queue,
            timeout,
            metrics,
        }
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    /// Solve one uploaded captcha image.
    pub async fn solve(&self, image: &[u8]) -> Result<String> {
        let result = self.solve_inner(image).await;
        match &result {
            Ok(_) => self.metrics.record_outcome("ok"),
            Err(e) => self.metrics.record_outcome(e.outcome()),
        }
        result
    }

    async fn solve_inner(&self, image: &[u8]) -> Result<String> {
        // Fail fast before spending time on decoding; try_enqueue below is
        // the authoritative check.
        if self.queue.is_full() {
            return Err(ServiceError::AdmissionRejected);
        }

        let prepared = self.preprocessor.process_bytes(image)?;
        let report = prepared.report;
        if report.cropped {
            self.metrics.images_cropped.inc();
            info!(
                "image cropped ({}x{} -> {}x{})",
                report.original_width,
                report.original_height,
                self.preprocessor.config().crop_width,
                self.preprocessor.config().crop_height
            );
        } else {
            info!(
                "image not cropped ({}x{})",
                report.original_width, report.original_height
            );
        }

        let handle = self.queue.submit(prepared.tensor)?;
        let id = handle.id();
        debug!(request_id = %id, timeout_ms = self.timeout.as_millis() as u64, "Awaiting result");

        let result = handle.wait(self.timeout).await;
        if let Err(ServiceError::Timeout) = &result {
            info!(request_id = %id, "Timed out waiting for result; item left to finish");
        }
        result
    }
}
