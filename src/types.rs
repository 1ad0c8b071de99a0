//! Core data types used throughout the Fileson library
//!
//! ## Overview
//!
//! - **Catalog values**: [`Entry`] is what a catalog maps each key to. Path
//!   keys hold [`FileMeta`] or [`DirMeta`]; reserved keys (see [`keys`]) hold
//!   plain JSON metadata. The shape is resolved once when a record is parsed.
//! - **Backup log values**: [`BackupValue`] maps a blob name to the
//!   [`BlobRecord`] describing the stored copy.
//! - **Reporting**: [`FileError`] for per-file failures collected by long
//!   running operations, [`ProgressInfo`] for progress callbacks.
//!
//! ## Examples
//!
//! ```rust
//! use fileson::types::{Entry, FileMeta};
//!
//! let entry: Entry = serde_json::from_str(
//!     r#"{"size": 5, "modified_gmt": "2024-01-01 00:00:00", "sha1": "abc"}"#,
//! ).unwrap();
//! assert!(entry.as_file().is_some());
//! ```

use crate::checksum::ChecksumAlgorithm;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Reserved catalog and backup log keys
///
/// Every reserved key starts with [`keys::RESERVED_PREFIX`] so it can never
/// collide with a relative path.
pub mod keys {
    /// Prefix shared by all reserved keys
    pub const RESERVED_PREFIX: char = ':';
    /// Scan counter, incremented at the start of every scan
    pub const SCAN: &str = ":scan:";
    /// Root directory of the latest scan
    pub const DIRECTORY: &str = ":directory:";
    /// Checksum algorithm of the latest scan (`null` for none)
    pub const CHECKSUM: &str = ":checksum:";
    /// GMT timestamp of the latest scan or backup run
    pub const DATE_GMT: &str = ":date_gmt:";
    /// Backup run counter
    pub const BACKUP: &str = ":backup:";
    /// Catalog file a backup run was made from
    pub const DBFILE: &str = ":dbfile:";
    /// Destination of the latest backup run
    pub const DESTINATION: &str = ":destination:";
    /// SHA-1 of the encryption key used by backup runs
    pub const KEYHASH: &str = ":keyhash:";

    /// Check whether a key is reserved metadata rather than a path
    pub fn is_reserved(key: &str) -> bool {
        key.starts_with(RESERVED_PREFIX)
    }
}

/// Metadata recorded for a regular file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// File size in bytes
    pub size: u64,
    /// Modification time as a GMT timestamp
    pub modified_gmt: String,
    /// Full SHA-1 of the content, when scanned with `sha1`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    /// Sampled SHA-1 plus size suffix, when scanned with `sha1fast`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1fast: Option<String>,
}

impl FileMeta {
    /// Create metadata without a checksum
    pub fn new(size: u64, modified_gmt: impl Into<String>) -> Self {
        Self {
            size,
            modified_gmt: modified_gmt.into(),
            sha1: None,
            sha1fast: None,
        }
    }

    /// Attach a checksum computed with `algorithm`
    pub fn with_checksum(mut self, algorithm: ChecksumAlgorithm, checksum: String) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha1 => self.sha1 = Some(checksum),
            ChecksumAlgorithm::Sha1Fast => self.sha1fast = Some(checksum),
        }
        self
    }

    /// Checksum computed with `algorithm`, if recorded
    pub fn checksum(&self, algorithm: ChecksumAlgorithm) -> Option<&str> {
        match algorithm {
            ChecksumAlgorithm::Sha1 => self.sha1.as_deref(),
            ChecksumAlgorithm::Sha1Fast => self.sha1fast.as_deref(),
        }
    }
}

/// Metadata recorded for a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirMeta {
    /// Modification time as a GMT timestamp
    pub modified_gmt: String,
}

/// A catalog value
///
/// Files are told apart from directories by the presence of `size`. Anything
/// that is neither (counters, strings, `null`) is reserved metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Entry {
    /// A regular file
    File(FileMeta),
    /// A directory
    Dir(DirMeta),
    /// Reserved-key metadata
    Meta(serde_json::Value),
}

impl Entry {
    /// Wrap any JSON-representable value as reserved metadata
    pub fn meta(value: impl Into<serde_json::Value>) -> Self {
        Entry::Meta(value.into())
    }

    /// File metadata, if this entry is a file
    pub fn as_file(&self) -> Option<&FileMeta> {
        match self {
            Entry::File(meta) => Some(meta),
            _ => None,
        }
    }

    /// Directory metadata, if this entry is a directory
    pub fn as_dir(&self) -> Option<&DirMeta> {
        match self {
            Entry::Dir(meta) => Some(meta),
            _ => None,
        }
    }

    /// Raw metadata value, if this entry is reserved metadata
    pub fn as_meta(&self) -> Option<&serde_json::Value> {
        match self {
            Entry::Meta(value) => Some(value),
            _ => None,
        }
    }

    /// Modification time of a file or directory
    pub fn modified_gmt(&self) -> Option<&str> {
        match self {
            Entry::File(meta) => Some(&meta.modified_gmt),
            Entry::Dir(meta) => Some(&meta.modified_gmt),
            Entry::Meta(_) => None,
        }
    }
}

impl From<FileMeta> for Entry {
    fn from(meta: FileMeta) -> Self {
        Entry::File(meta)
    }
}

impl From<DirMeta> for Entry {
    fn from(meta: DirMeta) -> Self {
        Entry::Dir(meta)
    }
}

/// One stored copy of a file's content, keyed by blob name in the backup log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    /// SHA-1 of the plaintext content
    pub sha1: String,
    /// Plaintext size in bytes
    pub size: u64,
    /// Hex IV the blob was encrypted with (first 32 hex chars of the blob name)
    pub iv: String,
    /// Integrity tag of the bytes that landed at the destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// A backup log value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackupValue {
    /// A stored blob
    Blob(BlobRecord),
    /// Reserved-key metadata
    Meta(serde_json::Value),
}

impl BackupValue {
    /// Wrap any JSON-representable value as reserved metadata
    pub fn meta(value: impl Into<serde_json::Value>) -> Self {
        BackupValue::Meta(value.into())
    }

    /// Blob record, if this value describes a stored blob
    pub fn as_blob(&self) -> Option<&BlobRecord> {
        match self {
            BackupValue::Blob(record) => Some(record),
            BackupValue::Meta(_) => None,
        }
    }

    /// Raw metadata value, if this is reserved metadata
    pub fn as_meta(&self) -> Option<&serde_json::Value> {
        match self {
            BackupValue::Meta(value) => Some(value),
            BackupValue::Blob(_) => None,
        }
    }
}

impl From<BlobRecord> for BackupValue {
    fn from(record: BlobRecord) -> Self {
        BackupValue::Blob(record)
    }
}

/// A per-file failure collected during a scan, backup, restore or audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    /// Catalog key or path of the file
    pub path: String,
    /// Human-readable cause
    pub message: String,
}

impl FileError {
    /// Create a file error from anything displayable
    pub fn new(path: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            path: path.into(),
            message: error.to_string(),
        }
    }
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: usize,
    /// Total items to process (if known)
    pub total: Option<usize>,
    /// Bytes processed so far
    pub bytes_processed: u64,
    /// Total bytes to process (if known)
    pub total_bytes: Option<u64>,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100), by bytes when known, else by items
    pub fn percentage(&self) -> Option<f32> {
        match (self.total_bytes, self.total) {
            (Some(total), _) if total > 0 => Some((self.bytes_processed as f32 / total as f32) * 100.0),
            (_, Some(total)) if total > 0 => Some((self.processed as f32 / total as f32) * 100.0),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_shape_resolution() {
        let file: Entry = serde_json::from_value(json!({"size": 3, "modified_gmt": "2024-01-01 00:00:00"})).unwrap();
        let dir: Entry = serde_json::from_value(json!({"modified_gmt": "2024-01-01 00:00:00"})).unwrap();
        let counter: Entry = serde_json::from_value(json!(4)).unwrap();
        let none: Entry = serde_json::from_value(json!(null)).unwrap();

        assert!(file.as_file().is_some());
        assert!(dir.as_dir().is_some());
        assert_eq!(counter, Entry::meta(4));
        assert_eq!(none, Entry::Meta(serde_json::Value::Null));
    }

    #[test]
    fn test_checksum_field_names() {
        let meta = FileMeta::new(10, "2024-01-01 00:00:00")
            .with_checksum(ChecksumAlgorithm::Sha1, "abc".to_string());
        let json = serde_json::to_value(Entry::File(meta.clone())).unwrap();

        assert_eq!(json, json!({"size": 10, "modified_gmt": "2024-01-01 00:00:00", "sha1": "abc"}));
        assert_eq!(meta.checksum(ChecksumAlgorithm::Sha1), Some("abc"));
        assert_eq!(meta.checksum(ChecksumAlgorithm::Sha1Fast), None);
    }

    #[test]
    fn test_backup_value_shapes() {
        let blob: BackupValue =
            serde_json::from_value(json!({"sha1": "aa", "size": 1, "iv": "00"})).unwrap();
        assert_eq!(blob.as_blob().map(|b| b.etag.clone()), Some(None));

        let seed: BackupValue = serde_json::from_value(json!("2024-01-01 00:00:00")).unwrap();
        assert!(seed.as_meta().is_some());
    }

    #[test]
    fn test_reserved_keys() {
        assert!(keys::is_reserved(keys::SCAN));
        assert!(!keys::is_reserved("photos/a.jpg"));
    }

    #[test]
    fn test_progress_percentage() {
        let info = ProgressInfo {
            operation: "backup".to_string(),
            current_item: None,
            processed: 1,
            total: Some(4),
            bytes_processed: 50,
            total_bytes: Some(200),
        };
        assert_eq!(info.percentage(), Some(25.0));
    }
}
