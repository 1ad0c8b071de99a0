//! # Fileson - Incremental directory catalogs and deduplicated backups
//!
//! Fileson records the state of a directory tree over time in an append-only
//! catalog and uses that history to drive incremental, deduplicated and
//! optionally encrypted backups to a local directory or an object-store
//! bucket, with verifiable restore.
//!
//! ## Overview
//!
//! - Scan a directory into a catalog, re-hashing only files whose name, size
//!   or modification time changed since the last scan
//! - Reconstruct the catalog as it was any number of scans ago (`name~N`)
//! - Diff two catalogs, detecting moves through content hashes
//! - Back up only content the backup log has not seen, encrypted with
//!   AES-256-CTR, resuming interrupted runs without re-transferring
//! - Restore with per-file verification, and audit sources for bit rot
//!
//! ## Architecture
//!
//! - **Versioned log**: a line-per-record JSON log (`[key, value]` sets,
//!   `[key]` deletes) replayed into a map. Live logging flushes every
//!   mutation before returning, so a crash loses at most the record being
//!   written.
//! - **Catalog**: a versioned log of file and directory metadata plus
//!   reserved `:scan:`, `:directory:`, `:checksum:` and `:date_gmt:` keys.
//! - **Backup log**: a versioned log of stored blobs keyed by blob name,
//!   each carrying the content hash, size, IV and integrity tag.
//! - **Crypto stream**: `IV || ciphertext` readers and writers that plug into
//!   any `Read`/`Write` based transfer.
//! - **Integrity tag**: the multipart ETag convention of object stores,
//!   computed locally over the exact bytes sent.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fileson::{BackupBuilder, BackupLog, Catalog, ChecksumAlgorithm, LocalDirectory, ScannerBuilder};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog_path = Path::new("photos.fson");
//! let mut catalog = Catalog::load(catalog_path).unwrap_or_default();
//!
//! let scanner = ScannerBuilder::new("/home/me/Pictures")
//!     .checksum(Some(ChecksumAlgorithm::Sha1))
//!     .skip_patterns(vec![".DS_Store".to_string()])
//!     .build()?;
//! {
//!     let mut session = catalog.live_session(catalog_path)?;
//!     let report = scanner.scan(&mut session)?;
//!     println!("{} files, {} hashed", report.files, report.hashed);
//! }
//!
//! let log_path = Path::new("photos.log");
//! let mut log = BackupLog::load(log_path).unwrap_or_default();
//! let destination = LocalDirectory::create("/mnt/backup/photos")?;
//! let report = BackupBuilder::new().build().run(&catalog, catalog_path, &mut log, log_path, &destination)?;
//! println!("{} blobs stored", report.uploaded);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, FilesonError>`. Format and key errors are
//! fatal; per-file failures during scans, backups and restores are collected
//! on the returned report and the operation continues. An interrupted backup
//! reports [`FilesonError::TransferInterrupted`] and can simply be rerun.
//!
//! ## Module Organization
//!
//! - [`versioned_log`]: append-only log and live logging
//! - [`catalog`]: catalog accessors, versions, diff, duplicates, statistics
//! - [`scanner`]: incremental directory scanning
//! - [`backup`] / [`restore`]: the backup engine and its inverse
//! - [`crypto`]: keys and the encrypting/decrypting streams
//! - [`integrity`]: multipart-compatible integrity tags
//! - [`destination`]: local and object-store destinations
//! - [`s3`]: the S3 transport for bucket destinations
//! - [`verification`]: audits and tag checks
//! - [`config`]: `fileson.toml` entries

pub mod backup;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod crypto;
pub mod destination;
pub mod error;
pub mod integrity;
pub mod progress;
pub mod restore;
pub mod s3;
pub mod scanner;
pub mod types;
pub mod utils;
pub mod verification;
pub mod versioned_log;

pub use backup::{BackupBuilder, BackupEngine, BackupLog, BackupPlan, BackupReport};
pub use catalog::{Catalog, CatalogDiff, ChangeKind, Comparison, DeltaRecord};
pub use checksum::ChecksumAlgorithm;
pub use config::FilesonConfig;
pub use crypto::{CryptoKey, DecryptWriter, EncryptReader};
pub use destination::{Bucket, Destination, DestinationSpec, LocalDirectory, MemoryObjectClient, ObjectClient};
pub use error::{FilesonError, Result};
pub use integrity::IntegrityTag;
pub use progress::{CancelFlag, TransferProgress};
pub use restore::{fetch_catalogs, RestoreBuilder, RestoreReport, Restorer};
pub use s3::S3ObjectClient;
pub use scanner::{load_or_scan, ScanReport, Scanner, ScannerBuilder};
pub use types::*;
pub use verification::{audit, check_etags, AuditReport, TagReport};
pub use versioned_log::{LiveSession, Record, VersionedLog};
