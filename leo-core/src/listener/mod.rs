//! Index dispatch: consumes change events and routes them to registered
//! indexers.
//!
//! Two constraints shape the scheduler: at most one handler is in flight per
//! logical key (`container + "_" + first path segment`), so updates to one
//! logical entity serialize in queue order, and up to `parallelism` distinct
//! keys run concurrently. Per-key order is enforced by chaining each new
//! batch onto the previous task for that key; nothing holds a lock across an
//! await. Delivery is at-least-once: a failed batch is never acknowledged
//! and the queue redelivers it, so indexers must be idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::select_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ListenerError;
use crate::events::StoreDataDetails;
use crate::queue::{Queue, QueueMessage};

pub type IndexerError = Box<dyn std::error::Error + Send + Sync>;

/// Builds one indexer instance per dispatched batch.
pub type IndexerFactory = Arc<dyn Fn() -> Arc<dyn Indexer> + Send + Sync>;

/// Receives errors the listener survives: routing misses, indexer failures,
/// queue faults. The loop itself never dies on them.
pub type ErrorSink = Arc<dyn Fn(ListenerError) + Send + Sync>;

/// A registered indexer. Invocations for different logical keys may run
/// concurrently; invocations for one key never overlap.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index(&self, items: Vec<StoreDataDetails>) -> Result<(), IndexerError>;

    /// Batch re-emitted by a re-index walk. The default treats it like any
    /// other batch; indexers with a cheaper bulk path override this.
    async fn reindex(&self, items: Vec<StoreDataDetails>) -> Result<(), IndexerError> {
        self.index(items).await
    }
}

#[derive(Clone)]
pub struct ListenerConfig {
    /// Maximum number of distinct logical keys in flight.
    pub parallelism: usize,
    /// Sleep after an empty fetch.
    pub empty_fetch_delay: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            parallelism: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            empty_fetch_delay: Duration::from_secs(2),
        }
    }
}

struct Envelope {
    message: Box<dyn QueueMessage>,
    details: StoreDataDetails,
}

/// The dispatch listener. Register indexers, then `start` it; registries are
/// immutable once the scheduler runs.
pub struct IndexListener {
    type_indexers: HashMap<String, IndexerFactory>,
    path_indexers: HashMap<String, IndexerFactory>,
    config: ListenerConfig,
    error_sink: ErrorSink,
}

impl IndexListener {
    pub fn new(config: ListenerConfig) -> Self {
        IndexListener {
            type_indexers: HashMap::new(),
            path_indexers: HashMap::new(),
            config: ListenerConfig {
                parallelism: config.parallelism.max(1),
                ..config
            },
            error_sink: Arc::new(|e| error!("index listener error: {}", e)),
        }
    }

    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = sink;
        self
    }

    /// Route events whose `Type` metadata equals `type_name` to `factory`.
    pub fn register_type_indexer(
        &mut self,
        type_name: impl Into<String>,
        factory: IndexerFactory,
    ) -> Result<(), ListenerError> {
        let type_name = type_name.into();
        if self.type_indexers.contains_key(&type_name) {
            return Err(ListenerError::Config(format!(
                "type indexer already registered for {type_name}"
            )));
        }
        self.type_indexers.insert(type_name, factory);
        Ok(())
    }

    /// Route events whose base path starts with `prefix` to `factory`. The
    /// longest matching prefix wins.
    pub fn register_path_indexer(
        &mut self,
        prefix: impl Into<String>,
        factory: IndexerFactory,
    ) -> Result<(), ListenerError> {
        let prefix = prefix.into();
        if self.path_indexers.contains_key(&prefix) {
            return Err(ListenerError::Config(format!(
                "path indexer already registered for {prefix}"
            )));
        }
        self.path_indexers.insert(prefix, factory);
        Ok(())
    }

    /// Spawn the supervising scheduler. Cancelling the token stops the outer
    /// loop; in-flight batches are allowed to finish.
    pub fn start(self, queue: Arc<dyn Queue>, ct: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::new(self).run(queue, ct))
    }

    pub async fn run(self: Arc<Self>, queue: Arc<dyn Queue>, ct: CancellationToken) {
        info!(
            "index listener started (parallelism {})",
            self.config.parallelism
        );
        let mut in_flight: HashMap<String, JoinHandle<()>> = HashMap::new();
        while !ct.is_cancelled() {
            let this = Arc::clone(&self);
            if let Err(e) = this.cycle(&queue, &ct, &mut in_flight).await {
                (self.error_sink)(e);
            }
        }
        for (_, handle) in in_flight.drain() {
            let _ = handle.await;
        }
        info!("index listener stopped");
    }

    /// One scheduler cycle: reap, wait for capacity, fetch, group, dispatch.
    async fn cycle(
        self: Arc<Self>,
        queue: &Arc<dyn Queue>,
        ct: &CancellationToken,
        in_flight: &mut HashMap<String, JoinHandle<()>>,
    ) -> Result<(), ListenerError> {
        in_flight.retain(|_, handle| !handle.is_finished());

        if in_flight.len() >= self.config.parallelism {
            // Completion-driven wait: wake as soon as any batch finishes.
            let waiters: Vec<&mut JoinHandle<()>> = in_flight.values_mut().collect();
            tokio::select! {
                _ = ct.cancelled() => {}
                _ = select_all(waiters) => {}
            }
            in_flight.retain(|_, handle| !handle.is_finished());
            return Ok(());
        }

        let fetched = queue
            .listen_for_next_message(self.config.parallelism, ct)
            .await?;
        if fetched.is_empty() {
            tokio::select! {
                _ = ct.cancelled() => {}
                _ = tokio::time::sleep(self.config.empty_fetch_delay) => {}
            }
            return Ok(());
        }

        let mut groups: HashMap<String, Vec<Envelope>> = HashMap::new();
        for message in fetched {
            match serde_json::from_str::<StoreDataDetails>(message.message()) {
                Ok(details) => {
                    groups
                        .entry(details.logical_key())
                        .or_default()
                        .push(Envelope { message, details });
                }
                Err(e) => {
                    // Dropped without completing; the queue redelivers it.
                    (self.error_sink)(ListenerError::Parse(e));
                }
            }
        }

        for (key, batch) in groups {
            // Chaining onto the previous task for the key keeps per-key FIFO
            // without blocking the scheduler.
            let previous = in_flight.remove(&key);
            let handler = Arc::clone(&self);
            let task_key = key.clone();
            let handle = tokio::spawn(async move {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                if let Err(e) = handler.handle_batch(&task_key, batch).await {
                    (handler.error_sink)(e);
                }
            });
            in_flight.insert(key, handle);
        }
        Ok(())
    }

    /// Handle one per-key batch: partition on the reindex marker, route,
    /// deduplicate, invoke, and acknowledge only on full success.
    async fn handle_batch(&self, key: &str, batch: Vec<Envelope>) -> Result<(), ListenerError> {
        debug!("dispatching {} message(s) for {}", batch.len(), key);

        let mut fresh: Vec<StoreDataDetails> = Vec::new();
        let mut reemitted: Vec<StoreDataDetails> = Vec::new();
        for envelope in &batch {
            let mut details = envelope.details.clone();
            if details.metadata.is_reindex() {
                // Strip the transient marker so it cannot propagate through
                // downstream writes.
                details.metadata.set_reindex(false);
                reemitted.push(details);
            } else {
                fresh.push(details);
            }
        }

        self.dispatch_partition(key, fresh, false).await?;
        self.dispatch_partition(key, reemitted, true).await?;

        // Completion failures only risk redelivery, which indexers tolerate.
        for envelope in &batch {
            if let Err(e) = envelope.message.complete().await {
                warn!("failed to complete message for {}: {}", key, e);
            }
        }
        Ok(())
    }

    async fn dispatch_partition(
        &self,
        key: &str,
        items: Vec<StoreDataDetails>,
        is_reindex: bool,
    ) -> Result<(), ListenerError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut grouped: HashMap<Route, Vec<StoreDataDetails>> = HashMap::new();
        for item in items {
            let route = self.route(&item)?;
            grouped.entry(route).or_default().push(item);
        }

        for (route, group) in grouped {
            let (factory, deduped) = match &route {
                Route::Type(name) => (&self.type_indexers[name], dedup_by_id(group)),
                Route::Path(prefix) => (&self.path_indexers[prefix], dedup_by_base_path(group)),
            };
            let indexer = factory();
            let result = if is_reindex {
                indexer.reindex(deduped).await
            } else {
                indexer.index(deduped).await
            };
            result.map_err(|e| ListenerError::Indexer {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Type routing wins when the event carries a registered `Type`;
    /// otherwise the longest registered path prefix matches.
    fn route(&self, item: &StoreDataDetails) -> Result<Route, ListenerError> {
        if let Some(type_name) = item.metadata.type_name() {
            if self.type_indexers.contains_key(type_name) {
                return Ok(Route::Type(type_name.to_string()));
            }
        }
        let mut best: Option<&str> = None;
        for prefix in self.path_indexers.keys() {
            if item.base_path.starts_with(prefix.as_str())
                && best.map(|b| prefix.len() > b.len()).unwrap_or(true)
            {
                best = Some(prefix);
            }
        }
        match best {
            Some(prefix) => Ok(Route::Path(prefix.to_string())),
            None => Err(ListenerError::Dispatch(format!(
                "{}::{} (type {:?})",
                item.container,
                item.base_path,
                item.metadata.type_name()
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Route {
    Type(String),
    Path(String),
}

/// Keep the first event per record id. Events without an id fall back to
/// their base path, so distinct id-less records are not collapsed together.
fn dedup_by_id(items: Vec<StoreDataDetails>) -> Vec<StoreDataDetails> {
    let mut seen: HashSet<String> = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            let dedup_key = match item.id {
                Some(id) => id.to_string(),
                None => format!("path:{}", item.base_path),
            };
            seen.insert(dedup_key)
        })
        .collect()
}

/// Keep the first event per base path.
fn dedup_by_base_path(items: Vec<StoreDataDetails>) -> Vec<StoreDataDetails> {
    let mut seen: HashSet<String> = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.base_path.clone()))
        .collect()
}
