//! Adaptive Backpressure & Socket Manager (spec §4.6). Admission control
//! for every network-facing operation, shared by the object-store adapter
//! and (indirectly, via the same API) any future non-local adapter.
//!
//! Grounded in `harborgrid-justin-caddy/src/enterprise/ratelimit/algorithm.rs`
//! (EWMA-driven decisions over atomics + a semaphore) and the teacher's
//! `tcp_server.rs` connection bookkeeping.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// Hard ceiling on concurrent in-flight requests (default 500).
    pub max_concurrency: usize,
    /// Floor the adaptive concurrency never shrinks below.
    pub min_concurrency: usize,
    /// Batch size ceiling (paginated/bulk paths read this, spec §4.6).
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    /// EWMA smoothing factor in (0, 1]; higher reacts faster.
    pub ewma_alpha: f64,
    /// Sustained failure ratio that triggers a shrink.
    pub failure_threshold: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 500,
            min_concurrency: 10,
            max_batch_size: 500,
            min_batch_size: 10,
            ewma_alpha: 0.2,
            failure_threshold: 0.3,
        }
    }
}

/// A granted admission; releasing it (explicitly via [`Permit::release`]
/// or implicitly on drop as a success=false fallback) is mandatory —
/// every network operation must bracket its call in one (spec §4.6).
pub struct Permit {
    manager: Arc<BackpressureInner>,
    released: bool,
}

impl Permit {
    pub fn release(mut self, success: bool) {
        self.manager.release(success);
        self.released = true;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.released {
            self.manager.release(false);
        }
    }
}

struct BackpressureInner {
    semaphore: Semaphore,
    config: BackpressureConfig,
    effective_concurrency: AtomicUsize,
    batch_size: AtomicUsize,
    in_flight: AtomicUsize,
    // EWMA of success rate, fixed-point as parts-per-million for atomic storage.
    ewma_success_ppm: AtomicI64,
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Admission controller. Cheap to clone (wraps an `Arc`); adapters hold
/// one instance and share it across concurrently-running requests.
#[derive(Clone)]
pub struct BackpressureManager {
    inner: Arc<BackpressureInner>,
}

impl BackpressureManager {
    pub fn new(config: BackpressureConfig) -> Self {
        let max = config.max_concurrency;
        let batch = config.max_batch_size.min(config.min_batch_size.max(10));
        Self {
            inner: Arc::new(BackpressureInner {
                semaphore: Semaphore::new(max),
                effective_concurrency: AtomicUsize::new(max),
                batch_size: AtomicUsize::new(batch),
                in_flight: AtomicUsize::new(0),
                ewma_success_ppm: AtomicI64::new(1_000_000),
                successes: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Current adaptive batch size, read by paginated/bulk paths.
    pub fn batch_size(&self) -> usize {
        self.inner.batch_size.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    /// `request_permission` (spec §4.6). Waits if above the high-water
    /// mark; only rejects with `Overloaded` once the hard ceiling of
    /// available permits is exhausted *and* the semaphore itself has no
    /// capacity — i.e. callers normally wait, never fail, matching the
    /// contract "Rejects acquisitions with Overloaded only when a hard
    /// ceiling is hit".
    pub async fn request_permission(&self, _req_id: &str, cost: u32) -> Result<Permit, StorageError> {
        let effective = self
            .inner
            .effective_concurrency
            .load(Ordering::Relaxed)
            .max(self.inner.config.min_concurrency);
        if self.inner.in_flight.load(Ordering::Relaxed) >= self.inner.config.max_concurrency
            && effective <= self.inner.config.min_concurrency
        {
            return Err(StorageError::Overloaded);
        }
        for _ in 0..cost.max(1) {
            self.inner
                .semaphore
                .acquire()
                .await
                .map_err(|_| StorageError::Overloaded)?
                .forget();
        }
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(Permit {
            manager: self.inner.clone(),
            released: false,
        })
    }
}

impl BackpressureInner {
    fn release(&self, success: bool) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.semaphore.add_permits(1);

        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }

        let sample_ppm: i64 = if success { 1_000_000 } else { 0 };
        let alpha_ppm = (self.config.ewma_alpha * 1_000_000.0) as i64;
        let prev = self.ewma_success_ppm.load(Ordering::Relaxed);
        let next = prev + (alpha_ppm * (sample_ppm - prev)) / 1_000_000;
        self.ewma_success_ppm.store(next, Ordering::Relaxed);

        let failure_ratio = 1.0 - (next as f64 / 1_000_000.0);
        if failure_ratio >= self.config.failure_threshold {
            self.shrink();
        } else {
            self.grow();
        }
    }

    fn shrink(&self) {
        let cur = self.effective_concurrency.load(Ordering::Relaxed);
        let next = (cur / 2).max(self.config.min_concurrency);
        self.effective_concurrency.store(next, Ordering::Relaxed);

        let cur_batch = self.batch_size.load(Ordering::Relaxed);
        let next_batch = (cur_batch / 2).max(self.config.min_batch_size);
        self.batch_size.store(next_batch, Ordering::Relaxed);
    }

    fn grow(&self) {
        let cur = self.effective_concurrency.load(Ordering::Relaxed);
        let next = (cur + cur / 10 + 1).min(self.config.max_concurrency);
        self.effective_concurrency.store(next, Ordering::Relaxed);

        let cur_batch = self.batch_size.load(Ordering::Relaxed);
        let next_batch = (cur_batch + 1).min(self.config.max_batch_size);
        self.batch_size.store(next_batch, Ordering::Relaxed);
    }
}
