#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use codeslice::config::Config;
use codeslice_core::embedding::EmbeddingGateway;
use codeslice_core::error::EmbeddingError;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const DIMS: usize = 64;

/// Deterministic bag-of-tokens embedding with call counting and failure
/// injection. Texts sharing tokens get similar vectors.
pub struct FakeGateway {
    model: String,
    pub batch_calls: AtomicUsize,
    pub texts_embedded: AtomicUsize,
    transient_failures: AtomicUsize,
    poison: Mutex<Option<String>>,
    cancel_on_call: Mutex<Option<CancellationToken>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::with_model("fake-embed")
    }

    pub fn with_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            batch_calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
            transient_failures: AtomicUsize::new(0),
            poison: Mutex::new(None),
            cancel_on_call: Mutex::new(None),
            gate: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn embedded(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_transiently(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Reject, permanently, any batch containing `marker`.
    pub fn poison(&self, marker: Option<&str>) {
        *self.poison.lock() = marker.map(str::to_string);
    }

    /// Cancel `token` as soon as the next call completes.
    pub fn cancel_on_next_call(&self, token: CancellationToken) {
        *self.cancel_on_call.lock() = Some(token);
    }

    /// Block every call until the returned semaphore gets permits.
    pub fn gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }
}

pub fn embed_text(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for token in text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
    {
        let digest = Sha256::digest(token.to_lowercase().as_bytes());
        v[digest[0] as usize % DIMS] += 1.0;
    }
    if v.iter().all(|x| *x == 0.0) {
        v[0] = 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingGateway for FakeGateway {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| EmbeddingError::Transient("gate closed".to_string()))?;
        }

        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.cancel_on_call.lock().take() {
            token.cancel();
        }

        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(EmbeddingError::Transient("simulated timeout".to_string()));
        }
        if let Some(marker) = self.poison.lock().as_deref() {
            if texts.iter().any(|t| t.contains(marker)) {
                return Err(EmbeddingError::Permanent("input rejected".to_string()));
            }
        }

        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| embed_text(t)).collect())
    }
}

/// Default configuration with near-zero retry backoff.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 2;
    config
}

pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// `n` plain lines with no structural boundaries.
pub fn numbered_lines(label: &str, n: usize) -> String {
    (1..=n).map(|i| format!("{label} line {i}\n")).collect()
}
