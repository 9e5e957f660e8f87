//! Leo: an encrypted, versioned object-storage engine over cloud blob
//! backends.
//!
//! The engine gives application code one contract for writing, reading,
//! snapshotting, soft- and hard-deleting blobs plus a lease-backed per-key
//! lock, and dispatches change events through a queue to pluggable indexers.
//!
//! Layering, bottom up:
//! - [`store`]: the backend adapter contract and its implementations
//!   (Azure native snapshots, S3 version listings, in-memory for tests)
//! - [`pipeline`]: streaming gzip and authenticated-encryption stages
//! - [`secure_store`]: the facade orchestrating pipeline, versioning,
//!   soft-delete semantics, events and locking
//! - [`queue`] and [`listener`]: change-event transport and the per-key
//!   serialized indexer dispatch
//! - [`partition`]: application-facing sugar over `(partition, path)` and
//!   `(partition, id)` addressing

pub mod error;
pub mod events;
pub mod listener;
pub mod location;
pub mod metadata;
pub mod options;
pub mod partition;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod secure_store;
pub mod store;

pub use error::{ListenerError, StoreError};
pub use events::StoreDataDetails;
pub use listener::{IndexListener, Indexer, ListenerConfig};
pub use location::StoreLocation;
pub use metadata::Metadata;
pub use options::SecureStoreOptions;
pub use partition::{DocumentPartition, ItemConfiguration, RecordPartition};
pub use pipeline::{ChunkedEncryptor, Encryptor};
pub use secure_store::SecureStore;
pub use store::{DataWithMetadata, ObjectStore, OptimisticResult, Snapshot, StoreLock};
