//! Serialized Inference Module
//!
//! Admission control and execution for captcha recognition. This module:
//! - Admits work into a bounded FIFO queue, refusing (never waiting) when full
//! - Runs a single worker that owns the model and processes one item at a time
//! - Delivers each result through a one-shot completion handle
//!
//! Architecture:
//! - `AdmissionQueue` is the producer side, cloned into every request task
//! - `InferenceWorker` is the only consumer and the only owner of the engine
//! - A caller that times out stops waiting; its item still runs unless
//!   `skip_abandoned` is enabled on the worker

use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::Array4;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{InferenceError, ServiceError};
use crate::metrics::{ServiceMetrics, Timer};

// Re-export for external use
pub use queue::AdmissionQueue;
pub use worker::InferenceWorker;

/// What the worker writes into a completion handle.
pub type Completion = std::result::Result<String, InferenceError>;

// ============================================================================
// Data Models
// ============================================================================

/// One unit of serialized inference work.
///
/// Owned by the queue until dequeued, then by the worker until its
/// completion is written. The completion sender is consumed by that write,
/// so it cannot happen twice.
#[derive(Debug)]
pub struct WorkItem {
    pub id: Uuid,
    pub tensor: Array4<f32>,
    pub enqueued_at: Instant,
    completion: oneshot::Sender<Completion>,
}

impl WorkItem {
    /// Create a work item and the handle its caller waits on.
    pub fn new(tensor: Array4<f32>) -> (Self, CompletionHandle) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let item = Self {
            id,
            tensor,
            enqueued_at: Instant::now(),
            completion: tx,
        };
        (item, CompletionHandle { id, rx })
    }

    /// True once the caller has stopped waiting for this item.
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }
}

/// Caller side of a work item's result slot.
#[derive(Debug)]
pub struct CompletionHandle {
    id: Uuid,
    rx: oneshot::Receiver<Completion>,
}

impl CompletionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the worker's result, giving up after `timeout`.
    ///
    /// Giving up only drops this handle; the work item is not withdrawn.
    pub async fn wait(self, timeout: Duration) -> Result<String, ServiceError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Err(_) => Err(ServiceError::Timeout),
            Ok(Err(_)) => Err(ServiceError::InferenceFailure(InferenceError::Dropped)),
            Ok(Ok(Ok(text))) => Ok(text),
            Ok(Ok(Err(e))) => Err(ServiceError::InferenceFailure(e)),
        }
    }
}

// ============================================================================
// Queue Module
// ============================================================================

pub mod queue {
    use super::*;
    use tokio::sync::mpsc::error::TrySendError;

    /// Bounded FIFO admission queue.
    ///
    /// Cheap to clone: every clone feeds the same worker.
    #[derive(Clone)]
    pub struct AdmissionQueue {
        tx: mpsc::Sender<WorkItem>,
        metrics: Arc<ServiceMetrics>,
    }

    impl AdmissionQueue {
        /// Create a queue holding at most `capacity` items, plus the receiver
        /// to hand to the worker.
        ///
        /// # Panics
        /// If `capacity` is zero.
        pub fn new(
            capacity: usize,
            metrics: Arc<ServiceMetrics>,
        ) -> (Self, mpsc::Receiver<WorkItem>) {
            let (tx, rx) = mpsc::channel(capacity);
            (Self { tx, metrics }, rx)
        }

        pub fn capacity(&self) -> usize {
            self.tx.max_capacity()
        }

        /// Number of items currently waiting.
        pub fn len(&self) -> usize {
            self.tx.max_capacity() - self.tx.capacity()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        pub fn is_full(&self) -> bool {
            self.tx.capacity() == 0
        }

        /// Whether the worker has gone away.
        pub fn is_closed(&self) -> bool {
            self.tx.is_closed()
        }

        /// Enqueue without waiting. A full queue is refused immediately.
        pub fn try_enqueue(&self, item: WorkItem) -> Result<(), ServiceError> {
            let id = item.id;
            match self.tx.try_send(item) {
                Ok(()) => {
                    self.metrics.queue_depth.set(self.len() as i64);
                    debug!(request_id = %id, depth = self.len(), "Work item queued");
                    Ok(())
                }
                Err(TrySendError::Full(_)) => {
                    warn!(request_id = %id, capacity = self.capacity(), "Admission queue full, rejecting");
                    Err(ServiceError::AdmissionRejected)
                }
                Err(TrySendError::Closed(_)) => {
                    error!(request_id = %id, "Inference worker is gone, rejecting");
                    Err(ServiceError::WorkerStopped)
                }
            }
        }

        /// Wrap `tensor` in a work item and enqueue it.
        pub fn submit(&self, tensor: Array4<f32>) -> Result<CompletionHandle, ServiceError> {
            let (item, handle) = WorkItem::new(tensor);
            self.try_enqueue(item)?;
            Ok(handle)
        }
    }
}

// ============================================================================
// Worker Module
// ============================================================================

pub mod worker {
    use super::*;
    use crate::decoder::CtcDecoder;
    use crate::engine::InferenceEngine;
    use std::any::Any;
    use std::panic::{self, AssertUnwindSafe};
    use tokio::task::JoinHandle;

    /// Single consumer of the admission queue.
    ///
    /// Owns the engine outright; items are processed strictly one after
    /// another in queue order. A failing or panicking item is reported to
    /// its caller and the loop carries on.
    pub struct InferenceWorker {
        /// `None` only while a model run is in flight on the blocking pool
        engine: Option<Box<dyn InferenceEngine>>,
        decoder: CtcDecoder,
        metrics: Arc<ServiceMetrics>,
        skip_abandoned: bool,
    }

    impl InferenceWorker {
        pub fn new(
            engine: Box<dyn InferenceEngine>,
            decoder: CtcDecoder,
            metrics: Arc<ServiceMetrics>,
        ) -> Self {
            Self {
                engine: Some(engine),
                decoder,
                metrics,
                skip_abandoned: false,
            }
        }

        /// Drop queued items whose caller already gave up instead of running
        /// them. Off by default.
        pub fn skip_abandoned(mut self, enabled: bool) -> Self {
            self.skip_abandoned = enabled;
            self
        }

        /// Start the worker loop on the runtime.
        pub fn spawn(self, rx: mpsc::Receiver<WorkItem>) -> JoinHandle<()> {
            tokio::spawn(self.run(rx))
        }

        /// Run the worker loop
        ///
        /// Returns once every `AdmissionQueue` clone has been dropped and the
        /// queue is drained.
        pub async fn run(mut self, mut rx: mpsc::Receiver<WorkItem>) {
            let engine_name = self
                .engine
                .as_ref()
                .map(|e| e.name().to_string())
                .unwrap_or_default();
            info!(engine = %engine_name, skip_abandoned = self.skip_abandoned, "🧠 Inference worker started");

            while let Some(item) = rx.recv().await {
                self.metrics.queue_depth.set(rx.len() as i64);
                self.process(item).await;
            }

            info!("🧠 Inference worker stopped");
        }

        async fn process(&mut self, item: WorkItem) {
            let WorkItem {
                id,
                tensor,
                enqueued_at,
                completion,
            } = item;

            Timer::from_instant(enqueued_at).observe_duration_seconds(&self.metrics.queue_wait);

            if self.skip_abandoned && completion.is_closed() {
                debug!(request_id = %id, "Caller gone before dequeue, skipping");
                self.metrics.abandoned_skipped.inc();
                return;
            }

            let timer = Timer::new();
            let outcome = self.infer(tensor).await;
            timer.observe_duration_seconds(&self.metrics.inference_latency);

            let result = match outcome {
                Ok((columns, text)) => {
                    info!(
                        request_id = %id,
                        columns = columns,
                        solved = %text,
                        latency_ms = timer.elapsed_ms(),
                        "Captcha solved"
                    );
                    Ok(text)
                }
                Err(e) => {
                    error!(request_id = %id, error = %e, "Inference failed");
                    self.metrics.inference_failures.inc();
                    Err(e)
                }
            };

            if completion.send(result).is_err() {
                warn!(request_id = %id, "Caller no longer waiting, result discarded");
                self.metrics.orphaned_results.inc();
            }
        }

        /// Run the model and decoder on the blocking pool.
        ///
        /// The engine moves into the blocking task and comes back with the
        /// result, so it is never touched from two places at once.
        async fn infer(&mut self, tensor: Array4<f32>) -> Result<(usize, String), InferenceError> {
            let Some(mut engine) = self.engine.take() else {
                return Err(InferenceError::EngineUnavailable);
            };
            let decoder = self.decoder.clone();

            let joined = tokio::task::spawn_blocking(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_and_decode(engine.as_mut(), &decoder, &tensor)
                }));
                (engine, outcome)
            })
            .await;

            match joined {
                Ok((engine, outcome)) => {
                    self.engine = Some(engine);
                    outcome.unwrap_or_else(|payload| {
                        Err(InferenceError::Panicked(panic_message(payload.as_ref())))
                    })
                }
                Err(e) => {
                    // Only reachable if the runtime is shutting down
                    error!(error = %e, "Inference task aborted, engine lost");
                    Err(InferenceError::ExecutionFailed(e.to_string()))
                }
            }
        }
    }

    fn run_and_decode(
        engine: &mut dyn InferenceEngine,
        decoder: &CtcDecoder,
        tensor: &Array4<f32>,
    ) -> Result<(usize, String), InferenceError> {
        let logits = engine.run(tensor)?;
        let columns = logits.dim().0;
        let text = decoder
            .decode(logits.view())?
            .into_iter()
            .next()
            .ok_or(crate::error::DecodeError::EmptyBatch)?;
        Ok((columns, text))
    }

    fn panic_message(payload: &(dyn Any + Send)) -> String {
        if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Arc<ServiceMetrics> {
        Arc::new(ServiceMetrics::new().unwrap())
    }

    fn tensor() -> Array4<f32> {
        Array4::zeros((1, 1, 32, 120))
    }

    #[test]
    fn test_work_item_ids_match_handles() {
        let (item, handle) = WorkItem::new(tensor());
        assert_eq!(item.id, handle.id());
        assert!(!item.is_abandoned());
        drop(handle);
        assert!(item.is_abandoned());
    }

    #[tokio::test]
    async fn test_queue_rejects_when_full() {
        let (queue, _rx) = AdmissionQueue::new(2, metrics());
        assert!(queue.is_empty());

        queue.submit(tensor()).unwrap();
        queue.submit(tensor()).unwrap();
        assert!(queue.is_full());
        assert_eq!(queue.len(), 2);

        let err = queue.submit(tensor()).err().unwrap();
        assert!(matches!(err, ServiceError::AdmissionRejected));
    }

    #[tokio::test]
    async fn test_queue_reports_stopped_worker() {
        let (queue, rx) = AdmissionQueue::new(1, metrics());
        drop(rx);
        assert!(queue.is_closed());
        let err = queue.submit(tensor()).err().unwrap();
        assert!(matches!(err, ServiceError::WorkerStopped));
    }

    #[tokio::test]
    async fn test_handle_times_out_without_result() {
        let (queue, _rx) = AdmissionQueue::new(1, metrics());
        let handle = queue.submit(tensor()).unwrap();
        let err = handle.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout));
    }

    #[tokio::test]
    async fn test_handle_reports_dropped_item() {
        let (queue, mut rx) = AdmissionQueue::new(1, metrics());
        let handle = queue.submit(tensor()).unwrap();
        drop(rx.recv().await.unwrap());
        let err = handle.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InferenceFailure(InferenceError::Dropped)
        ));
    }
}
