//! Backup verification
//!
//! Two independent checks, neither of which ever repairs anything:
//!
//! 1. **Audit**: re-hash a random sample of the catalog's files and compare
//!    against the recorded checksum, catching bit rot and external edits.
//! 2. **Tag check**: compare the integrity tags recorded in the backup log
//!    with a destination listing, catching blobs that are missing or were
//!    stored with different bytes than were sent.
//!
//! ```rust,no_run
//! use fileson::verification::audit;
//! use fileson::{BackupLog, Catalog};
//! use std::path::Path;
//!
//! # fn main() -> fileson::Result<()> {
//! let catalog = Catalog::load(Path::new("photos.fson"))?;
//! let log = BackupLog::load(Path::new("photos.log"))?;
//! let report = audit(&catalog, &log, 0.05)?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

use crate::backup::BackupLog;
use crate::catalog::Catalog;
use crate::crypto::IV_LEN;
use crate::destination::{Destination, ObjectInfo};
use crate::error::{FilesonError, Result};
use crate::integrity::tags_match;
use crate::types::FileError;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A sampled file whose content no longer matches the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditMismatch {
    /// Catalog key
    pub path: String,
    /// Checksum in the catalog
    pub recorded: String,
    /// Checksum of the file now
    pub actual: String,
}

/// Result of [`audit`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditReport {
    /// Files sampled
    pub sampled: usize,
    /// Sampled files whose checksum still matches
    pub verified: usize,
    /// Sampled files whose checksum changed
    pub mismatches: Vec<AuditMismatch>,
    /// Sampled files that could not be read
    pub errors: Vec<FileError>,
    /// Sampled files whose content has no blob in the backup log
    pub not_backed_up: Vec<String>,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
}

impl AuditReport {
    /// Check if every sampled file matched and is backed up
    pub fn is_valid(&self) -> bool {
        self.mismatches.is_empty() && self.errors.is_empty() && self.not_backed_up.is_empty()
    }

    /// One-line description
    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!(
                "{} sampled files verified in {}ms",
                self.sampled, self.verification_time_ms
            )
        } else {
            format!(
                "{}/{} sampled files verified: {} changed, {} unreadable, {} not backed up",
                self.verified,
                self.sampled,
                self.mismatches.len(),
                self.errors.len(),
                self.not_backed_up.len()
            )
        }
    }
}

/// Re-hash a random `fraction` of the catalog's files
///
/// At least one file is sampled when the catalog has any and `fraction` is
/// positive. Files are read under the catalog's `:directory:` with the
/// catalog's checksum algorithm.
///
/// # Errors
///
/// - [`FilesonError::ChecksumRequired`] if the catalog has no checksums
/// - [`FilesonError::Format`] if the catalog has no `:directory:`
pub fn audit(catalog: &Catalog, log: &BackupLog, fraction: f64) -> Result<AuditReport> {
    let started = Instant::now();
    let algorithm = catalog
        .checksum_algorithm()?
        .ok_or_else(|| FilesonError::ChecksumRequired {
            expected: "sha1 or sha1fast".to_string(),
            found: None,
        })?;
    let root = catalog
        .directory()
        .map(PathBuf::from)
        .ok_or_else(|| FilesonError::format("catalog", 0, "catalog has no :directory: record"))?;

    let files: Vec<_> = catalog.files().collect();
    let count = sample_size(files.len(), fraction);
    let stored = log.stored_hashes();
    let mut report = AuditReport::default();

    for (path, meta) in files.choose_multiple(&mut rand::rng(), count) {
        report.sampled += 1;
        let Some(recorded) = meta.checksum(algorithm) else {
            report.errors.push(FileError::new(*path, "no checksum recorded"));
            continue;
        };

        if !stored.contains(recorded) {
            report.not_backed_up.push(path.to_string());
        }

        match algorithm.checksum_file(&root.join(path)) {
            Ok(actual) if actual == recorded => report.verified += 1,
            Ok(actual) => {
                warn!("{} changed: catalog {}, now {}", path, recorded, actual);
                report.mismatches.push(AuditMismatch {
                    path: path.to_string(),
                    recorded: recorded.to_string(),
                    actual,
                });
            }
            Err(e) => {
                warn!("Cannot audit {}: {}", path, e);
                report.errors.push(FileError::new(*path, e));
            }
        }
    }

    report.verification_time_ms = started.elapsed().as_millis() as u64;
    info!("Audit: {}", report.summary());
    Ok(report)
}

fn sample_size(total: usize, fraction: f64) -> usize {
    if total == 0 || fraction <= 0.0 {
        return 0;
    }
    ((total as f64 * fraction).ceil() as usize).clamp(1, total)
}

/// A blob whose stored tag differs from the recorded one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMismatch {
    /// Blob name
    pub name: String,
    /// Tag in the backup log
    pub recorded: String,
    /// Tag the destination reports
    pub reported: String,
}

/// Result of [`check_etags`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagReport {
    /// Blobs in the backup log
    pub checked: usize,
    /// Blobs present with a matching tag, or matching size where no tag is
    /// available
    pub ok: usize,
    /// Blobs absent from the listing
    pub missing: Vec<String>,
    /// Blobs present with a different tag
    pub mismatched: Vec<TagMismatch>,
    /// Blobs present with a size that cannot be right
    pub wrong_size: Vec<String>,
}

impl TagReport {
    /// Check if every blob is present and matches
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty() && self.wrong_size.is_empty()
    }

    /// One-line description
    pub fn summary(&self) -> String {
        format!(
            "{}/{} blobs ok, {} missing, {} tag mismatches, {} wrong size",
            self.ok,
            self.checked,
            self.missing.len(),
            self.mismatched.len(),
            self.wrong_size.len()
        )
    }
}

/// Compare recorded tags with a destination listing
///
/// When either side has no tag (local directories report none), the stored
/// size is checked instead: plaintext size, plus the IV for encrypted logs.
pub fn check_etags(log: &BackupLog, listing: &[ObjectInfo]) -> TagReport {
    let listed: HashMap<&str, &ObjectInfo> = listing.iter().map(|o| (o.name.as_str(), o)).collect();
    let overhead = if log.key_hash().is_some() { IV_LEN as u64 } else { 0 };
    let mut report = TagReport::default();

    for (name, blob) in log.blobs() {
        report.checked += 1;
        let Some(object) = listed.get(name) else {
            report.missing.push(name.to_string());
            continue;
        };

        match (&blob.etag, &object.etag) {
            (Some(recorded), Some(reported)) if !tags_match(recorded, reported) => {
                report.mismatched.push(TagMismatch {
                    name: name.to_string(),
                    recorded: recorded.clone(),
                    reported: reported.clone(),
                });
            }
            (Some(_), Some(_)) => report.ok += 1,
            _ if object.size != blob.size + overhead => report.wrong_size.push(name.to_string()),
            _ => report.ok += 1,
        }
    }

    debug!("Tag check: {}", report.summary());
    report
}

/// List a destination and run [`check_etags`] against it
pub fn verify_destination(log: &BackupLog, destination: &dyn Destination) -> Result<TagReport> {
    let listing = destination.list()?;
    Ok(check_etags(log, &listing))
}
