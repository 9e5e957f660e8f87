//! The typed bag of named attributes carried with every blob.
//!
//! Metadata is a string-to-string map with a handful of reserved keys. All
//! non-reserved keys pass through the engine verbatim; keys reserved for
//! internal use are stripped on every outbound boundary.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved metadata key names.
pub mod keys {
    /// Decimal byte count of the logical (pre-encryption, pre-compression)
    /// payload.
    pub const CONTENT_LENGTH: &str = "ContentLength";
    /// Last-modified timestamp in epoch-millisecond ticks, monotonic within
    /// a key.
    pub const MODIFIED: &str = "Modified";
    /// Media type of the payload.
    pub const CONTENT_TYPE: &str = "ContentType";
    /// Opaque backend-assigned version id.
    pub const SNAPSHOT: &str = "Snapshot";
    /// Opaque backend-assigned concurrency tag.
    pub const ETAG: &str = "ETag";
    /// Presence marks the record soft-deleted; the value is the deletion tick.
    pub const DELETED: &str = "LeoDeleted";
    /// Application-type discriminator used by the index listener.
    pub const TYPE: &str = "Type";
    /// Transient marker on synthetic re-emission; never persisted downstream.
    pub const REINDEX: &str = "Reindex";
    /// Free-form audit stamp recorded with a write.
    pub const AUDIT: &str = "Audit";

    /// Adapter-private marker written by the native-versioning backend.
    /// Never visible through `get_metadata`/`load_data`.
    pub const STORE_VERSION: &str = "leo-store-version";
    /// Adapter-private marker recording that the stored bytes are
    /// gzip-compressed. Never visible to consumers.
    pub const COMPRESSED: &str = "LeoCompressed";
}

const INTERNAL_KEYS: &[&str] = &[keys::STORE_VERSION, keys::COMPRESSED];

/// Reserved keys in canonical casing. HTTP backends lowercase user-metadata
/// key names on the wire; reads map them back through this table.
const CANONICAL_KEYS: &[&str] = &[
    keys::CONTENT_LENGTH,
    keys::MODIFIED,
    keys::CONTENT_TYPE,
    keys::SNAPSHOT,
    keys::ETAG,
    keys::DELETED,
    keys::TYPE,
    keys::REINDEX,
    keys::AUDIT,
    keys::STORE_VERSION,
    keys::COMPRESSED,
];

/// Restore canonical casing for reserved keys that came back lowercased from
/// an HTTP backend. Non-reserved keys are returned unchanged.
pub fn canonicalize_key(key: &str) -> String {
    for canonical in CANONICAL_KEYS {
        if canonical.eq_ignore_ascii_case(key) {
            return (*canonical).to_string();
        }
    }
    key.to_string()
}

/// Current time in epoch-millisecond ticks.
pub fn now_ticks() -> i64 {
    Utc::now().timestamp_millis()
}

/// String-keyed metadata with typed accessors for the reserved keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    map: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Metadata::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get(keys::CONTENT_LENGTH)?.parse().ok()
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.insert(keys::CONTENT_LENGTH, length.to_string());
    }

    pub fn modified(&self) -> Option<i64> {
        self.get(keys::MODIFIED)?.parse().ok()
    }

    pub fn set_modified(&mut self, tick: i64) {
        self.insert(keys::MODIFIED, tick.to_string());
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(keys::CONTENT_TYPE)
    }

    pub fn snapshot(&self) -> Option<&str> {
        self.get(keys::SNAPSHOT)
    }

    pub fn set_snapshot(&mut self, id: impl Into<String>) {
        self.insert(keys::SNAPSHOT, id);
    }

    pub fn etag(&self) -> Option<&str> {
        self.get(keys::ETAG)
    }

    pub fn set_etag(&mut self, etag: impl Into<String>) {
        self.insert(keys::ETAG, etag);
    }

    /// Whether the record carries the soft-delete marker.
    pub fn is_deleted(&self) -> bool {
        self.contains_key(keys::DELETED)
    }

    /// Tick at which the record was soft-deleted, if it was.
    pub fn deleted_tick(&self) -> Option<i64> {
        self.get(keys::DELETED)?.parse().ok()
    }

    pub fn mark_deleted(&mut self, tick: i64) {
        self.insert(keys::DELETED, tick.to_string());
    }

    pub fn type_name(&self) -> Option<&str> {
        self.get(keys::TYPE)
    }

    pub fn is_reindex(&self) -> bool {
        self.get(keys::REINDEX)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn set_reindex(&mut self, reindex: bool) {
        if reindex {
            self.insert(keys::REINDEX, "true");
        } else {
            self.remove(keys::REINDEX);
        }
    }

    pub fn audit(&self) -> Option<&str> {
        self.get(keys::AUDIT)
    }

    /// Drop adapter-private keys. Every outbound boundary (`get_metadata`,
    /// `load_data`, listings, emitted events) goes through this.
    pub fn strip_internal(&mut self) {
        for key in INTERNAL_KEYS {
            self.map.remove(*key);
        }
    }

    /// Copy with the keys the engine computes per write removed
    /// (`ContentLength`, `Modified`, `Snapshot`, `ETag`). Internal pipeline
    /// markers stay; adapters persist them with the version.
    pub fn without_computed(&self) -> Metadata {
        let mut out = self.clone();
        out.remove(keys::CONTENT_LENGTH);
        out.remove(keys::MODIFIED);
        out.remove(keys::SNAPSHOT);
        out.remove(keys::ETAG);
        out
    }

    /// The caller-controlled subset: computed keys and internal keys
    /// removed. Used when a new version must preserve prior user metadata.
    pub fn user_only(&self) -> Metadata {
        let mut out = self.without_computed();
        out.strip_internal();
        out
    }
}

impl From<BTreeMap<String, String>> for Metadata {
    fn from(map: BTreeMap<String, String>) -> Self {
        Metadata { map }
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Metadata {
            map: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Metadata {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.into_iter()
    }
}
