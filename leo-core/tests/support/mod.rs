//! Shared helpers for the integration tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use leo_core::listener::{Indexer, IndexerError, IndexerFactory};
use leo_core::pipeline::{ChunkedEncryptor, Encryptor};
use leo_core::queue::memory::MemoryQueue;
use leo_core::queue::Queue;
use leo_core::secure_store::SecureStore;
use leo_core::store::memory::MemoryStore;
use leo_core::StoreDataDetails;

/// Initialize tracing for tests.
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_line_number(true)
        .with_target(false)
        .with_file(true)
        .try_init();
}

/// Memory-backed engine with a fast-redelivery index queue.
pub fn test_engine() -> (SecureStore, Arc<MemoryQueue>) {
    let queue = Arc::new(MemoryQueue::with_visibility(
        "index",
        Duration::from_millis(100),
    ));
    let store = SecureStore::new(
        Arc::new(MemoryStore::new()),
        queue.clone() as Arc<dyn Queue>,
    );
    (store, queue)
}

pub fn test_encryptor() -> Arc<dyn Encryptor> {
    Arc::new(ChunkedEncryptor::new(&[42u8; 32]))
}

/// Deterministic pseudo-random payload.
pub fn payload_of(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

/// Indexer that records invocations, tracks concurrent overlap, and can be
/// told to fail its first N invocations.
pub struct RecordingIndexer {
    pub invocations: Mutex<Vec<Vec<StoreDataDetails>>>,
    pub reindex_invocations: Mutex<Vec<Vec<StoreDataDetails>>>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    fail_remaining: AtomicI32,
    hold: Duration,
}

impl RecordingIndexer {
    pub fn new() -> Arc<Self> {
        Self::with_hold(Duration::ZERO)
    }

    pub fn with_hold(hold: Duration) -> Arc<Self> {
        Arc::new(RecordingIndexer {
            invocations: Mutex::new(Vec::new()),
            reindex_invocations: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            fail_remaining: AtomicI32::new(0),
            hold,
        })
    }

    pub fn fail_next(&self, count: i32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Factory handing the same recorder to every dispatch.
    pub fn factory(self: &Arc<Self>) -> IndexerFactory {
        let recorder = Arc::clone(self);
        Arc::new(move || Arc::clone(&recorder) as Arc<dyn Indexer>)
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    /// All indexed items in invocation order, flattened.
    pub fn flattened(&self) -> Vec<StoreDataDetails> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    async fn record(
        &self,
        items: Vec<StoreDataDetails>,
        reindex: bool,
    ) -> Result<(), IndexerError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if self.fail_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return Err("induced indexer failure".into());
        }
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        if reindex {
            self.reindex_invocations.lock().unwrap().push(items);
        } else {
            self.invocations.lock().unwrap().push(items);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Indexer for RecordingIndexer {
    async fn index(&self, items: Vec<StoreDataDetails>) -> Result<(), IndexerError> {
        self.record(items, false).await
    }

    async fn reindex(&self, items: Vec<StoreDataDetails>) -> Result<(), IndexerError> {
        self.record(items, true).await
    }
}

/// Wait until `check` passes or the deadline elapses.
pub async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
