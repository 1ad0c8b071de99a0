//! Deduplicated, resumable backup
//!
//! A backup run compares the content hashes of a [`Catalog`] with the hashes
//! already recorded in the backup log and transfers only unseen content. Each
//! stored copy is a blob named by `sha1(seed + contentHash)`, where the seed is
//! the run's start timestamp, and encrypted with an IV taken from the first 32
//! hex characters of that name.
//!
//! The backup log is live-logged during the run: a blob record is appended
//! only after the destination has durably accepted the blob, so an
//! interrupted run restarted later transfers only what is still missing.
//!
//! ```rust,no_run
//! use fileson::{BackupBuilder, BackupLog, Catalog, LocalDirectory};
//! use std::path::Path;
//!
//! # fn main() -> fileson::Result<()> {
//! let catalog = Catalog::load(Path::new("photos.fson"))?;
//! let mut log = BackupLog::load(Path::new("photos.log")).unwrap_or_default();
//! let destination = LocalDirectory::create("/mnt/backup/photos")?;
//!
//! let engine = BackupBuilder::new().build();
//! let report = engine.run(&catalog, Path::new("photos.fson"), &mut log, Path::new("photos.log"), &destination)?;
//! println!("{} files uploaded", report.uploaded);
//! # Ok(())
//! # }
//! ```

use crate::catalog::Catalog;
use crate::checksum::{sha1_hex, ChecksumAlgorithm};
use crate::crypto::{parse_iv, CryptoKey, EncryptReader};
use crate::destination::{Destination, BACKUP_LOG_OBJECT, CATALOG_OBJECT};
use crate::error::{FilesonError, Result};
use crate::integrity::{tags_match, IntegrityTag};
use crate::progress::{CancelFlag, ProgressReader, TransferProgress};
use crate::types::{keys, BackupValue, BlobRecord, FileError, ProgressCallback};
use crate::utils;
use crate::versioned_log::VersionedLog;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Log of stored blobs, keyed by blob name
pub type BackupLog = VersionedLog<BackupValue>;

impl VersionedLog<BackupValue> {
    /// Stored blobs
    pub fn blobs(&self) -> impl Iterator<Item = (&str, &BlobRecord)> {
        self.iter()
            .filter(|(k, _)| !keys::is_reserved(k))
            .filter_map(|(k, v)| v.as_blob().map(|b| (k, b)))
    }

    /// Content hashes with a stored blob
    pub fn stored_hashes(&self) -> HashSet<&str> {
        self.blobs().map(|(_, b)| b.sha1.as_str()).collect()
    }

    /// Blob name and record per content hash
    ///
    /// When a hash was stored more than once, the last blob in key order wins.
    pub fn blob_index(&self) -> HashMap<&str, (&str, &BlobRecord)> {
        self.blobs().map(|(name, b)| (b.sha1.as_str(), (name, b))).collect()
    }

    /// Number of backup runs started against this log
    pub fn backup_count(&self) -> u64 {
        self.meta_value(keys::BACKUP).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    /// Hash of the key the blobs were encrypted with, if any
    pub fn key_hash(&self) -> Option<&str> {
        self.meta_value(keys::KEYHASH).and_then(|v| v.as_str())
    }

    /// Destination recorded by the last run
    pub fn destination(&self) -> Option<&str> {
        self.meta_value(keys::DESTINATION).and_then(|v| v.as_str())
    }

    fn meta_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.get(key).and_then(BackupValue::as_meta)
    }
}

/// Blob name of `sha1` within the session seeded by `seed`
pub fn blob_name(seed: &str, sha1: &str) -> String {
    sha1_hex(format!("{}{}", seed, sha1))
}

/// IV derived from a blob name
pub fn blob_iv(name: &str) -> Result<[u8; 16]> {
    let prefix = name
        .get(..32)
        .ok_or_else(|| FilesonError::InvalidKey(format!("blob name {:?} is too short for an IV", name)))?;
    parse_iv(prefix)
}

/// Check a key against the hash recorded in a backup log
///
/// # Errors
///
/// - [`FilesonError::KeyRequired`] if the log is encrypted and no key is given
/// - [`FilesonError::KeyMismatch`] if the hashes differ, or a key is given for
///   an unencrypted log that already holds blobs
pub fn check_key(log: &BackupLog, key: Option<&CryptoKey>) -> Result<()> {
    match (log.key_hash(), key) {
        (Some(recorded), Some(key)) if recorded != key.hash() => Err(FilesonError::KeyMismatch {
            recorded: recorded.to_string(),
            provided: key.hash(),
        }),
        (Some(_), None) => Err(FilesonError::KeyRequired),
        (None, Some(key)) if log.blobs().next().is_some() => Err(FilesonError::KeyMismatch {
            recorded: "none".to_string(),
            provided: key.hash(),
        }),
        _ => Ok(()),
    }
}

/// Content that needs a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    /// SHA-1 of the content
    pub sha1: String,
    /// Size in bytes
    pub size: u64,
    /// Catalog paths with this content, in key order; the first is read
    /// unless it fails to open
    pub paths: Vec<String>,
}

/// What a run would transfer
#[derive(Debug, Clone, Default)]
pub struct BackupPlan {
    /// One entry per unseen content hash
    pub pending: Vec<PendingFile>,
    /// Bytes to transfer
    pub total_bytes: u64,
    /// Files whose content is already stored
    pub already_stored: usize,
    /// Files sharing content with another pending file
    pub duplicates: usize,
}

impl BackupPlan {
    /// Nothing to transfer
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    /// Value of `:backup:` for this run
    pub run: u64,
    /// Blobs stored
    pub uploaded: usize,
    /// Plaintext bytes stored
    pub bytes: u64,
    /// Files whose content was already stored
    pub already_stored: usize,
    /// Files sharing content with a file stored in this run
    pub duplicates: usize,
    /// Blobs whose tag reported by the destination differs from the local one
    pub tag_mismatches: Vec<String>,
    /// Files that could not be read
    pub errors: Vec<FileError>,
    /// Wall time
    pub duration: Duration,
}

impl BackupReport {
    /// Check if every pending file was stored without tag disagreement
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.tag_mismatches.is_empty()
    }
}

/// Backup runner
pub struct BackupEngine {
    key: Option<CryptoKey>,
    tagger: IntegrityTag,
    cancel: CancelFlag,
    progress_callback: Option<ProgressCallback>,
    upload_catalogs: bool,
}

impl std::fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupEngine")
            .field("encrypted", &self.key.is_some())
            .field("part_size", &self.tagger.part_size())
            .field("upload_catalogs", &self.upload_catalogs)
            .finish()
    }
}

impl BackupEngine {
    /// List the content a run would transfer
    ///
    /// Pure: neither the catalog nor the log is modified.
    ///
    /// # Errors
    ///
    /// - [`FilesonError::ChecksumRequired`] unless the catalog uses full SHA-1
    pub fn plan(&self, catalog: &Catalog, log: &BackupLog) -> Result<BackupPlan> {
        catalog.require_checksum(ChecksumAlgorithm::Sha1)?;

        let stored = log.stored_hashes();
        let mut plan = BackupPlan::default();
        let mut by_hash: BTreeMap<&str, usize> = BTreeMap::new();

        for (path, meta) in catalog.files() {
            let Some(sha1) = meta.checksum(ChecksumAlgorithm::Sha1) else {
                return Err(FilesonError::format(
                    PathBuf::from(path),
                    0,
                    "file entry has no sha1 in a sha1 catalog",
                ));
            };

            if stored.contains(sha1) {
                plan.already_stored += 1;
                continue;
            }

            match by_hash.get(sha1) {
                Some(&index) => {
                    plan.pending[index].paths.push(path.to_string());
                    plan.duplicates += 1;
                }
                None => {
                    by_hash.insert(sha1, plan.pending.len());
                    plan.total_bytes += meta.size;
                    plan.pending.push(PendingFile {
                        sha1: sha1.to_string(),
                        size: meta.size,
                        paths: vec![path.to_string()],
                    });
                }
            }
        }

        debug!(
            "Plan: {} pending ({} bytes), {} stored, {} duplicates",
            plan.pending.len(),
            plan.total_bytes,
            plan.already_stored,
            plan.duplicates
        );
        Ok(plan)
    }

    /// Back up every unseen file of `catalog` to `destination`
    ///
    /// The log is live-logged to `log_path` for the duration of the run. When
    /// every pending file has been attempted, the catalog and the log are
    /// stored at the destination as well (encrypted with a random IV when a
    /// key is set).
    ///
    /// # Errors
    ///
    /// - [`FilesonError::ChecksumRequired`] unless the catalog uses full SHA-1
    /// - [`FilesonError::Format`] if the catalog has no `:directory:`
    /// - [`FilesonError::KeyMismatch`] / [`FilesonError::KeyRequired`] if the
    ///   key disagrees with the one recorded in the log
    /// - [`FilesonError::TransferInterrupted`] if the destination failed or the
    ///   run was cancelled; blobs recorded so far stay valid
    #[instrument(skip_all, fields(destination = %destination.describe()))]
    pub fn run(
        &self,
        catalog: &Catalog,
        catalog_path: &Path,
        log: &mut BackupLog,
        log_path: &Path,
        destination: &dyn Destination,
    ) -> Result<BackupReport> {
        let started = Instant::now();
        let plan = self.plan(catalog, log)?;
        let root = catalog
            .directory()
            .map(PathBuf::from)
            .ok_or_else(|| FilesonError::format(catalog_path, 0, "catalog has no :directory: record"))?;
        check_key(log, self.key.as_ref())?;

        info!(
            "{} files to back up, total {}",
            plan.pending.len(),
            utils::format_bytes(plan.total_bytes)
        );

        let mut report = BackupReport {
            already_stored: plan.already_stored,
            duplicates: plan.duplicates,
            ..Default::default()
        };

        {
            let mut session = log.live_session(log_path)?;
            report.run = session.backup_count() + 1;
            let seed = utils::gmt_now();
            session.set(keys::BACKUP, BackupValue::meta(report.run))?;
            session.set(keys::DBFILE, BackupValue::meta(catalog_path.to_string_lossy().into_owned()))?;
            session.set(keys::DATE_GMT, BackupValue::meta(seed.clone()))?;
            session.set(keys::DESTINATION, BackupValue::meta(destination.describe()))?;
            if let Some(key) = &self.key {
                session.set(keys::KEYHASH, BackupValue::meta(key.hash()))?;
            }

            let progress = TransferProgress::new("backup", Some(plan.pending.len()), Some(plan.total_bytes))
                .with_callback(self.progress_callback.clone());

            for (index, pending) in plan.pending.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return Err(interrupted(&report, &plan, index, "cancelled".to_string()));
                }

                let name = blob_name(&seed, &pending.sha1);
                match self.store(&root, pending, &name, destination, &progress) {
                    Ok(Some(stored)) => {
                        if let Some(reported) = &stored.reported_tag {
                            if !tags_match(&stored.tag, reported) {
                                warn!(
                                    "Destination reported tag {} for {}, expected {}",
                                    reported, name, stored.tag
                                );
                                report.tag_mismatches.push(name.clone());
                            }
                        }

                        session.set(
                            name.clone(),
                            BlobRecord {
                                sha1: pending.sha1.clone(),
                                size: pending.size,
                                iv: name[..32].to_string(),
                                etag: Some(stored.tag),
                            }
                            .into(),
                        )?;
                        report.uploaded += 1;
                        report.bytes += pending.size;
                        progress.finish_item();
                        debug!("Stored {} as {}", pending.paths[0], name);
                    }
                    Ok(None) => {
                        for path in &pending.paths {
                            report
                                .errors
                                .push(FileError::new(path.clone(), "could not read source file"));
                        }
                    }
                    Err(e) => {
                        let reason = if self.cancel.is_cancelled() {
                            "cancelled".to_string()
                        } else {
                            e.to_string()
                        };
                        return Err(interrupted(&report, &plan, index, reason));
                    }
                }
            }
        }

        if self.upload_catalogs {
            self.put_metadata(destination, CATALOG_OBJECT, catalog.to_bytes()?)?;
            self.put_metadata(destination, BACKUP_LOG_OBJECT, log.to_bytes()?)?;
        }

        report.duration = started.elapsed();
        info!(
            "Backup {} done: {} blobs, {} in {}",
            report.run,
            report.uploaded,
            utils::format_bytes(report.bytes),
            humantime::format_duration(Duration::from_secs(report.duration.as_secs()))
        );
        Ok(report)
    }

    /// Store one content hash, trying each of its paths until one opens
    ///
    /// `Ok(None)` means no path could be read; errors are destination failures.
    fn store(
        &self,
        root: &Path,
        pending: &PendingFile,
        name: &str,
        destination: &dyn Destination,
        progress: &TransferProgress,
    ) -> Result<Option<StoredBlob>> {
        let iv = blob_iv(name)?;

        for path in &pending.paths {
            let source = root.join(path);
            progress.start_item(path);

            let file = match File::open(&source) {
                Ok(file) => file,
                Err(e) => {
                    warn!("Cannot open {:?}: {}", source, e);
                    continue;
                }
            };
            let prepared = match &self.key {
                Some(key) => self.prepare(EncryptReader::new(file, key, Some(iv))),
                None => self.prepare(file),
            };
            let (tag, mut body) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    warn!("Cannot read {:?}: {}", source, e);
                    continue;
                }
            };

            trace!("Tag of {} is {}", name, tag);
            let mut reader = ProgressReader::new(&mut *body, progress.clone(), self.cancel.clone());
            let outcome = destination.put(name, &mut reader)?;
            return Ok(Some(StoredBlob {
                tag,
                reported_tag: outcome.reported_tag,
            }));
        }

        Ok(None)
    }

    /// Compute the tag of the bytes the destination will receive, then rewind
    fn prepare<R: Read + Seek + Send + 'static>(&self, mut reader: R) -> Result<(String, Box<dyn Read + Send>)> {
        let tag = self.tagger.compute(&mut reader)?;
        reader.seek(SeekFrom::Start(0))?;
        Ok((tag, Box::new(reader)))
    }

    fn put_metadata(&self, destination: &dyn Destination, name: &str, bytes: Vec<u8>) -> Result<()> {
        let size = bytes.len();
        let mut body: Box<dyn Read> = match &self.key {
            Some(key) => Box::new(EncryptReader::new(Cursor::new(bytes), key, None)),
            None => Box::new(Cursor::new(bytes)),
        };
        destination.put(name, &mut body)?;
        debug!("Stored {} ({} bytes)", name, size);
        Ok(())
    }
}

struct StoredBlob {
    tag: String,
    reported_tag: Option<String>,
}

fn interrupted(report: &BackupReport, plan: &BackupPlan, index: usize, reason: String) -> FilesonError {
    let remaining = plan.pending.len() - index;
    warn!("Backup interrupted with {} files remaining: {}", remaining, reason);
    FilesonError::TransferInterrupted {
        completed: report.uploaded,
        remaining,
        reason,
    }
}

/// Builder for [`BackupEngine`]
#[derive(Clone)]
pub struct BackupBuilder {
    key: Option<CryptoKey>,
    part_size: u64,
    cancel: CancelFlag,
    progress_callback: Option<ProgressCallback>,
    upload_catalogs: bool,
}

impl Default for BackupBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupBuilder {
    /// Unencrypted backups with the default part size
    pub fn new() -> Self {
        Self {
            key: None,
            part_size: IntegrityTag::default().part_size(),
            cancel: CancelFlag::new(),
            progress_callback: None,
            upload_catalogs: true,
        }
    }

    /// Encrypt blobs with `key`
    pub fn key(mut self, key: Option<CryptoKey>) -> Self {
        self.key = key;
        self
    }

    /// Part size used for integrity tags; must match the destination's
    pub fn part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Cancellation flag checked between files and chunks
    pub fn cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Transfer progress callback
    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Whether a completed run stores the catalog and log at the destination
    pub fn upload_catalogs(mut self, upload: bool) -> Self {
        self.upload_catalogs = upload;
        self
    }

    /// Build the engine
    pub fn build(self) -> BackupEngine {
        BackupEngine {
            key: self.key,
            tagger: IntegrityTag::new(self.part_size),
            cancel: self.cancel,
            progress_callback: self.progress_callback,
            upload_catalogs: self.upload_catalogs,
        }
    }
}
