//! Change-event wire format.
//!
//! One event is emitted per successful write (and one per item during a
//! re-index walk). The body is UTF-8 JSON with the field names below; unknown
//! fields are ignored by the listener.

use serde::{Deserialize, Serialize};

use crate::location::first_path_segment;
use crate::metadata::Metadata;

/// A change event describing one written record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDataDetails {
    #[serde(rename = "Container")]
    pub container: String,

    #[serde(rename = "BasePath")]
    pub base_path: String,

    /// Numeric record id, present for record partitions.
    #[serde(rename = "Id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    #[serde(rename = "Metadata", default)]
    pub metadata: Metadata,
}

impl StoreDataDetails {
    /// The unit of per-key serialization in the index listener:
    /// `container + "_" + first path segment`. Events with an empty base
    /// path all land in the common key `"{container}_"`.
    pub fn logical_key(&self) -> String {
        format!(
            "{}_{}",
            self.container,
            first_path_segment(&self.base_path)
        )
    }
}
