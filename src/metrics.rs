use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Instant;

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Service metrics, registered into a registry owned by this value.
///
/// One instance is created at startup and shared (via `Arc`) with the
/// request handler and the worker.
pub struct ServiceMetrics {
    registry: Registry,

    /// Finished requests by outcome (`ok`, `busy`, `timeout`, ...)
    pub requests: IntCounterVec,
    /// Items waiting in the admission queue
    pub queue_depth: IntGauge,
    /// Time from enqueue to dequeue
    pub queue_wait: Histogram,
    /// Model run plus decode
    pub inference_latency: Histogram,
    pub inference_failures: IntCounter,
    pub images_cropped: IntCounter,
    /// Results produced after the caller stopped waiting
    pub orphaned_results: IntCounter,
    /// Items dropped at dequeue because the caller was gone
    pub abandoned_skipped: IntCounter,
}

impl ServiceMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("captcha_requests_total", "Total captcha requests by outcome"),
            &["outcome"],
        )?;
        let queue_depth = IntGauge::new(
            "captcha_queue_depth",
            "Current number of work items waiting in the admission queue",
        )?;
        let queue_wait = Histogram::with_opts(
            HistogramOpts::new(
                "captcha_queue_wait_seconds",
                "Time a work item spent queued before the worker picked it up",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let inference_latency = Histogram::with_opts(
            HistogramOpts::new(
                "captcha_inference_duration_seconds",
                "Model execution and decoding latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let inference_failures = IntCounter::new(
            "captcha_inference_failures_total",
            "Total number of work items that failed during inference or decoding",
        )?;
        let images_cropped = IntCounter::new(
            "captcha_images_cropped_total",
            "Total number of uploads cropped to the training box",
        )?;
        let orphaned_results = IntCounter::new(
            "captcha_orphaned_results_total",
            "Total results discarded because the caller had timed out",
        )?;
        let abandoned_skipped = IntCounter::new(
            "captcha_abandoned_skipped_total",
            "Total queued items skipped because the caller had already gone",
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(queue_wait.clone()))?;
        registry.register(Box::new(inference_latency.clone()))?;
        registry.register(Box::new(inference_failures.clone()))?;
        registry.register(Box::new(images_cropped.clone()))?;
        registry.register(Box::new(orphaned_results.clone()))?;
        registry.register(Box::new(abandoned_skipped.clone()))?;

        tracing::debug!("Metrics registry initialized with {} collectors", registry.gather().len());

        Ok(Self {
            registry,
            requests,
            queue_depth,
            queue_wait,
            inference_latency,
            inference_failures,
            images_cropped,
            orphaned_results,
            abandoned_skipped,
        })
    }

    pub fn record_outcome(&self, outcome: &str) {
        self.requests.with_label_values(&[outcome]).inc();
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn from_instant(start: Instant) -> Self {
        Self { start }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
