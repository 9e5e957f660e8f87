//! Blob addressing.

use serde::{Deserialize, Serialize};

/// Identifies one logical blob: a container (namespace, typically the
/// partition id rendered as text) plus a forward-slash-delimited base path.
///
/// Equality is byte-wise and case-sensitive on both parts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreLocation {
    pub container: String,
    pub base_path: String,
}

impl StoreLocation {
    pub fn new(container: impl Into<String>, base_path: impl Into<String>) -> Self {
        StoreLocation {
            container: container.into(),
            base_path: base_path.into(),
        }
    }

    /// First non-empty path segment, splitting on `/` and `\`.
    ///
    /// This is the unit of per-key serialization in the index listener:
    /// everything under one top-level segment belongs to one logical entity.
    pub fn first_path_segment(&self) -> &str {
        first_path_segment(&self.base_path)
    }
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.container, self.base_path)
    }
}

/// First non-empty token of `path` split on `/` or `\`, or `""` when the
/// path has no segments at all.
pub fn first_path_segment(path: &str) -> &str {
    path.split(['/', '\\'])
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
}
