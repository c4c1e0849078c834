//! Shared fixtures for the integration tests: scripted engines, logits
//! builders and a wired-up service.
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use captcha_solver_node::{
    AdmissionQueue, CtcDecoder, InferenceEngine, InferenceError, InferenceWorker,
    PreprocessConfig, Preprocessor, RequestHandler, ServiceMetrics, Vocabulary,
};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use ndarray::{Array3, Array4};
use tokio::task::JoinHandle;

pub const TIMESTEPS: usize = 30;

type RunFn = Box<dyn FnMut(&Array4<f32>) -> Result<Array3<f32>, InferenceError> + Send>;

/// Engine driven by a closure. Counts calls and tracks how many runs
/// overlap, so tests can check the worker never runs two at once.
pub struct ScriptedEngine {
    run_fn: RunFn,
    stats: Arc<EngineStats>,
}

#[derive(Default)]
pub struct EngineStats {
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// First pixel of every input, in call order
    pub seen: Mutex<Vec<f32>>,
}

impl EngineStats {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<f32> {
        self.seen.lock().unwrap().clone()
    }
}

impl ScriptedEngine {
    pub fn new<F>(run_fn: F) -> (Self, Arc<EngineStats>)
    where
        F: FnMut(&Array4<f32>) -> Result<Array3<f32>, InferenceError> + Send + 'static,
    {
        let stats = Arc::new(EngineStats::default());
        (
            Self {
                run_fn: Box::new(run_fn),
                stats: stats.clone(),
            },
            stats,
        )
    }
}

impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn run(&mut self, input: &Array4<f32>) -> Result<Array3<f32>, InferenceError> {
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        self.stats.seen.lock().unwrap().push(input[[0, 0, 0, 0]]);

        let result = (self.run_fn)(input);

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// One-hot logits `(T, 1, classes)` that greedy-decode to `text`.
///
/// Each character is held for two timesteps and followed by a blank, so
/// both the repeat-collapse and the blank-separation paths are exercised.
pub fn logits_for(text: &str, vocab: &Vocabulary) -> Array3<f32> {
    let mut classes = vec![0usize];
    for c in text.chars() {
        let class = vocab.class_of(c).expect("character in alphabet");
        classes.extend([class, class, 0]);
    }
    assert!(classes.len() <= TIMESTEPS, "text too long for fixture");
    classes.resize(TIMESTEPS, 0);

    let mut logits = Array3::<f32>::from_elem((TIMESTEPS, 1, vocab.num_classes()), -4.0);
    for (t, &c) in classes.iter().enumerate() {
        logits[[t, 0, c]] = 4.0;
    }
    logits
}

/// Input tensor whose first pixel carries a tag, for ordering checks.
pub fn tagged_tensor(tag: f32) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, 1, 32, 120));
    tensor[[0, 0, 0, 0]] = tag;
    tensor
}

pub fn png_bytes(width: u32, height: u32, value: u8) -> Vec<u8> {
    let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([value])));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub struct Service {
    pub handler: RequestHandler,
    pub queue: AdmissionQueue,
    pub metrics: Arc<ServiceMetrics>,
    pub worker: JoinHandle<()>,
}

/// Queue + worker + handler around `engine`.
pub fn start_service(
    engine: ScriptedEngine,
    capacity: usize,
    timeout: Duration,
    skip_abandoned: bool,
) -> Service {
    let metrics = Arc::new(ServiceMetrics::new().unwrap());
    let (queue, rx) = AdmissionQueue::new(capacity, metrics.clone());
    let worker = InferenceWorker::new(
        Box::new(engine),
        CtcDecoder::new(Vocabulary::default()),
        metrics.clone(),
    )
    .skip_abandoned(skip_abandoned)
    .spawn(rx);

    let handler = RequestHandler::new(
        Preprocessor::new(PreprocessConfig::default()),
        queue.clone(),
        timeout,
        metrics.clone(),
    );

    Service {
        handler,
        queue,
        metrics,
        worker,
    }
}

/// Poll `cond` until it holds or `limit` passes.
pub async fn eventually<F: Fn() -> bool>(cond: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
