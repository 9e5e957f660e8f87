//! In-process queue transport with visibility-timeout redelivery.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Queue, QueueMessage};
use crate::error::StoreError;

/// Default message lease.
pub const DEFAULT_VISIBILITY: Duration = Duration::from_secs(60);

struct Entry {
    id: u64,
    body: String,
    visible_at: Instant,
    delivery_count: u32,
}

#[derive(Default)]
struct QueueInner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Queue kept entirely in process memory. Fetched messages stay invisible
/// for the visibility timeout and reappear unless completed, which gives the
/// same at-least-once contract as a hosted queue.
#[derive(Clone)]
pub struct MemoryQueue {
    name: String,
    visibility: Duration,
    inner: Arc<Mutex<QueueInner>>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryQueue::with_visibility(name, DEFAULT_VISIBILITY)
    }

    pub fn with_visibility(name: impl Into<String>, visibility: Duration) -> Self {
        MemoryQueue {
            name: name.into(),
            visibility,
            inner: Arc::new(Mutex::new(QueueInner::default())),
        }
    }

    /// Messages currently stored, leased or not. For tests and diagnostics.
    pub fn depth(&self) -> usize {
        self.inner.lock().expect("queue lock").entries.len()
    }
}

struct MemoryQueueMessage {
    id: u64,
    body: String,
    inner: Arc<Mutex<QueueInner>>,
}

#[async_trait]
impl QueueMessage for MemoryQueueMessage {
    fn message(&self) -> &str {
        &self.body
    }

    async fn complete(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("queue lock");
        inner.entries.retain(|e| e.id != self.id);
        Ok(())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_message(&self, body: String) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("queue lock");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(Entry {
            id,
            body,
            visible_at: Instant::now(),
            delivery_count: 0,
        });
        Ok(())
    }

    async fn listen_for_next_message(
        &self,
        max: usize,
        ct: &CancellationToken,
    ) -> Result<Vec<Box<dyn QueueMessage>>, StoreError> {
        if ct.is_cancelled() || max == 0 {
            return Ok(Vec::new());
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("queue lock");
        let visibility = self.visibility;
        let mut leased: Vec<Box<dyn QueueMessage>> = Vec::new();
        for entry in inner.entries.iter_mut() {
            if leased.len() >= max {
                break;
            }
            if entry.visible_at <= now {
                entry.visible_at = now + visibility;
                entry.delivery_count += 1;
                if entry.delivery_count > 1 {
                    debug!(
                        "redelivering message {} from {} (attempt {})",
                        entry.id, self.name, entry.delivery_count
                    );
                }
                leased.push(Box::new(MemoryQueueMessage {
                    id: entry.id,
                    body: entry.body.clone(),
                    inner: Arc::clone(&self.inner),
                }));
            }
        }
        Ok(leased)
    }

    async fn create_queue_if_not_exists(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_queue_if_exists(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("queue lock");
        inner.entries.clear();
        Ok(())
    }
}
