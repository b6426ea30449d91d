//! Item metadata model and on-disk naming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata for a single credential item.
///
/// Persisted as JSON with a trailing HMAC-SHA256 tag; the value itself lives
/// in a separate age-encrypted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Stable identifier; also the stem of the on-disk file names.
    pub id: Uuid,
    /// Human description.
    pub description: String,
    /// Pinned peer identifier, set on the first peer-bound read.
    pub peer: Option<String>,
    /// Hex SHA-256 of the plaintext value; empty while the item has no value.
    pub checksum: String,
    /// Last modification time.
    pub modified_at: DateTime<Utc>,
}

impl Item {
    /// Create fresh metadata with no value.
    pub fn new(description: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            description,
            peer: None,
            checksum: String::new(),
            modified_at: Utc::now(),
        }
    }

    /// Whether a value has been set for this item.
    pub fn has_value(&self) -> bool {
        !self.checksum.is_empty()
    }

    /// Name of the metadata file.
    pub fn metadata_name(&self) -> String {
        format!("{}.json", self.id)
    }

    /// Name of the encrypted value file.
    pub fn value_name(&self) -> String {
        format!("{}.age", self.id)
    }

    /// Name of a value snapshot taken before an overwrite.
    pub fn backup_name(&self, at: DateTime<Utc>) -> String {
        format!(".bak/{}.{}.json", self.id, at.timestamp_millis())
    }
}
