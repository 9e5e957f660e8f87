//! Change-event queue abstraction.
//!
//! The engine pushes one JSON message per write and the index listener pulls
//! them back with a server-side lease: a fetched message stays invisible for
//! the visibility timeout, `complete()` acknowledges and deletes it, and
//! dropping the handle abandons it for redelivery. Hosted transports plug in
//! behind [`Queue`]; [`memory::MemoryQueue`] is the in-process one.

pub mod memory;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

/// A leased message. Dropping the handle without completing abandons the
/// lease; the message becomes visible again after the visibility timeout.
#[async_trait]
pub trait QueueMessage: Send + Sync {
    /// Message body.
    fn message(&self) -> &str;

    /// Acknowledge and delete. Idempotent.
    async fn complete(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Queue name, used in error paths and logs.
    fn name(&self) -> &str;

    async fn send_message(&self, body: String) -> Result<(), StoreError>;

    /// Fetch up to `max` leased messages. May return fewer, or none; it does
    /// not wait for messages to arrive.
    async fn listen_for_next_message(
        &self,
        max: usize,
        ct: &CancellationToken,
    ) -> Result<Vec<Box<dyn QueueMessage>>, StoreError>;

    async fn create_queue_if_not_exists(&self) -> Result<(), StoreError>;

    async fn delete_queue_if_exists(&self) -> Result<(), StoreError>;
}
