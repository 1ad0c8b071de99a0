//! Restore from a backup
//!
//! Restoring recreates the catalog's directory tree under a target directory,
//! then fetches each file's blob by content hash through the backup log. Blobs
//! are decrypted while streaming and the plaintext is SHA-1 hashed on the way
//! to disk so that a restored file can be checked against the catalog.
//!
//! Files without a blob are reported and skipped; a key that does not match
//! the one recorded in the backup log aborts before anything is written.

use crate::backup::{check_key, BackupLog};
use crate::catalog::Catalog;
use crate::checksum::{ChecksumAlgorithm, HashingWriter};
use crate::crypto::{CryptoKey, DecryptWriter};
use crate::destination::{Destination, BACKUP_LOG_OBJECT, CATALOG_OBJECT};
use crate::error::{FilesonError, Result};
use crate::progress::{CancelFlag, ProgressWriter, TransferProgress};
use crate::types::{FileError, ProgressCallback};
use crate::utils;
use std::fs;
use std::io::{BufWriter, Cursor};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Outcome of a restore
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Directories created
    pub dirs: usize,
    /// Files written
    pub restored: usize,
    /// Bytes received from the source
    pub bytes: u64,
    /// Files with no blob in the backup log or at the source
    pub missing: Vec<String>,
    /// Files whose restored content does not hash to the catalog value
    pub verify_failures: Vec<FileError>,
    /// Files that failed for other reasons
    pub errors: Vec<FileError>,
    /// Wall time
    pub duration: Duration,
}

impl RestoreReport {
    /// Check if every file was restored and verified
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.verify_failures.is_empty() && self.errors.is_empty()
    }
}

/// Restore runner
pub struct Restorer {
    key: Option<CryptoKey>,
    verify: bool,
    cancel: CancelFlag,
    progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for Restorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Restorer")
            .field("encrypted", &self.key.is_some())
            .field("verify", &self.verify)
            .finish()
    }
}

impl Restorer {
    /// Restore every file of `catalog` under `target`
    ///
    /// # Errors
    ///
    /// - [`FilesonError::ChecksumRequired`] unless the catalog uses full SHA-1
    /// - [`FilesonError::KeyMismatch`] / [`FilesonError::KeyRequired`] if the
    ///   key disagrees with the log, before any file is touched
    /// - [`FilesonError::TransferInterrupted`] if the run was cancelled
    #[instrument(skip_all, fields(source = %source.describe(), target = ?target))]
    pub fn restore(
        &self,
        catalog: &Catalog,
        log: &BackupLog,
        source: &dyn Destination,
        target: &Path,
    ) -> Result<RestoreReport> {
        let started = Instant::now();
        catalog.require_checksum(ChecksumAlgorithm::Sha1)?;
        check_key(log, self.key.as_ref())?;

        let blobs = log.blob_index();
        let mut report = RestoreReport::default();

        fs::create_dir_all(target)?;
        let mut dirs: Vec<(&str, &str)> = catalog.dirs().map(|(k, d)| (k, d.modified_gmt.as_str())).collect();
        for (key, _) in &dirs {
            fs::create_dir_all(target.join(key))?;
            report.dirs += 1;
        }

        let files: Vec<_> = catalog.files().collect();
        let total_bytes: u64 = files.iter().map(|(_, m)| m.size).sum();
        let progress = TransferProgress::new("restore", Some(files.len()), Some(total_bytes))
            .with_callback(self.progress_callback.clone());

        for (index, (path, meta)) in files.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(FilesonError::TransferInterrupted {
                    completed: report.restored,
                    remaining: files.len() - index,
                    reason: "cancelled".to_string(),
                });
            }

            let Some(sha1) = meta.checksum(ChecksumAlgorithm::Sha1) else {
                report.errors.push(FileError::new(*path, "no sha1 recorded"));
                continue;
            };
            let Some((name, _)) = blobs.get(sha1) else {
                warn!("Missing blob for {}", path);
                report.missing.push(path.to_string());
                continue;
            };

            let destination = target.join(path);
            progress.start_item(path);
            match self.fetch_file(source, name, &destination, &progress) {
                Ok((bytes, actual)) => {
                    report.bytes += bytes;
                    if self.verify && actual != sha1 {
                        warn!("Restored {} hashes to {}, catalog has {}", path, actual, sha1);
                        report
                            .verify_failures
                            .push(FileError::new(*path, format!("expected {}, got {}", sha1, actual)));
                    }
                    if let Err(e) = utils::set_mtime(&destination, &meta.modified_gmt) {
                        report.errors.push(FileError::new(*path, e));
                    }
                    report.restored += 1;
                    progress.finish_item();
                    debug!("Restored {} from {}", path, name);
                }
                Err(_) if self.cancel.is_cancelled() => {
                    return Err(FilesonError::TransferInterrupted {
                        completed: report.restored,
                        remaining: files.len() - index,
                        reason: "cancelled".to_string(),
                    });
                }
                Err(FilesonError::ObjectNotFound(_)) => {
                    warn!("Blob {} for {} is not at the source", name, path);
                    report.missing.push(path.to_string());
                }
                Err(e) => {
                    warn!("Cannot restore {}: {}", path, e);
                    report.errors.push(FileError::new(*path, e));
                }
            }
        }

        // Deepest first, after all files are in place.
        dirs.sort_by_key(|(key, _)| std::cmp::Reverse(utils::key_depth(key)));
        for (key, modified_gmt) in dirs {
            if let Err(e) = utils::set_mtime(&target.join(key), modified_gmt) {
                report.errors.push(FileError::new(key, e));
            }
        }

        report.duration = started.elapsed();
        info!(
            "Restored {} files ({}), {} missing, {} failed verification",
            report.restored,
            utils::format_bytes(report.bytes),
            report.missing.len(),
            report.verify_failures.len()
        );
        Ok(report)
    }

    /// Stream one blob into place, returning received bytes and plaintext SHA-1
    fn fetch_file(
        &self,
        source: &dyn Destination,
        name: &str,
        destination: &Path,
        progress: &TransferProgress,
    ) -> Result<(u64, String)> {
        let parent = destination.parent().unwrap_or(Path::new("."));
        let temp = tempfile::NamedTempFile::new_in(parent)?;
        let hashing = HashingWriter::new(BufWriter::new(temp));

        let (bytes, (writer, sha1)) = match &self.key {
            Some(key) => {
                let mut sink = ProgressWriter::new(DecryptWriter::new(hashing, key), progress.clone(), self.cancel.clone());
                let bytes = source.get(name, &mut sink)?;
                (bytes, sink.into_inner().finish()?.finish())
            }
            None => {
                let mut sink = ProgressWriter::new(hashing, progress.clone(), self.cancel.clone());
                let bytes = source.get(name, &mut sink)?;
                (bytes, sink.into_inner().finish())
            }
        };

        let temp = writer.into_inner().map_err(|e| FilesonError::Io(e.into_error()))?;
        temp.persist(destination).map_err(|e| FilesonError::Io(e.error))?;
        Ok((bytes, sha1))
    }
}

/// Builder for [`Restorer`]
pub struct RestoreBuilder {
    key: Option<CryptoKey>,
    verify: bool,
    cancel: CancelFlag,
    progress_callback: Option<ProgressCallback>,
}

impl Default for RestoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RestoreBuilder {
    /// Unencrypted restore with verification on
    pub fn new() -> Self {
        Self {
            key: None,
            verify: true,
            cancel: CancelFlag::new(),
            progress_callback: None,
        }
    }

    /// Decrypt blobs with `key`
    pub fn key(mut self, key: Option<CryptoKey>) -> Self {
        self.key = key;
        self
    }

    /// Compare restored content with the catalog checksum
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
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

    /// Build the restorer
    pub fn build(self) -> Restorer {
        Restorer {
            key: self.key,
            verify: self.verify,
            cancel: self.cancel,
            progress_callback: self.progress_callback,
        }
    }
}

/// Download the catalog and backup log stored by a completed backup
///
/// # Errors
///
/// - [`FilesonError::ObjectNotFound`] if either object is absent
/// - [`FilesonError::Format`] if an object does not parse, which is also what
///   a wrong key produces
/// - [`FilesonError::KeyMismatch`] / [`FilesonError::KeyRequired`] if the
///   downloaded log records a different key
pub fn fetch_catalogs(source: &dyn Destination, key: Option<&CryptoKey>) -> Result<(Catalog, BackupLog)> {
    let catalog = Catalog::read_from(Cursor::new(fetch_object(source, CATALOG_OBJECT, key)?), Path::new(CATALOG_OBJECT))?;
    let log = BackupLog::read_from(
        Cursor::new(fetch_object(source, BACKUP_LOG_OBJECT, key)?),
        Path::new(BACKUP_LOG_OBJECT),
    )?;
    if catalog.scan_count() == 0 {
        return Err(FilesonError::format(CATALOG_OBJECT, 0, "no :scan: record, wrong key?"));
    }
    check_key(&log, key)?;

    info!(
        "Fetched catalog ({} records) and backup log ({} records) from {}",
        catalog.records().len(),
        log.records().len(),
        source.describe()
    );
    Ok((catalog, log))
}

fn fetch_object(source: &dyn Destination, name: &str, key: Option<&CryptoKey>) -> Result<Vec<u8>> {
    match key {
        Some(key) => {
            let mut sink = DecryptWriter::new(Vec::new(), key);
            source.get(name, &mut sink)?;
            sink.finish()
        }
        None => {
            let mut buf = Vec::new();
            source.get(name, &mut buf)?;
            Ok(buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupBuilder;
    use crate::destination::LocalDirectory;
    use crate::scanner::ScannerBuilder;
    use filetime::FileTime;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        catalog: Catalog,
        log: BackupLog,
        dest: LocalDirectory,
    }

    fn backed_up(key: Option<CryptoKey>) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        fs::create_dir_all(src.join("docs/old")).unwrap();
        fs::write(src.join("docs/a.txt"), b"first file").unwrap();
        fs::write(src.join("docs/old/b.txt"), vec![7u8; 70_000]).unwrap();
        fs::write(src.join("c.txt"), b"first file").unwrap();
        let pinned = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(src.join("docs/a.txt"), pinned).unwrap();
        filetime::set_file_mtime(src.join("docs/old"), pinned).unwrap();

        let mut catalog = Catalog::new();
        ScannerBuilder::new(&src)
            .checksum(Some(ChecksumAlgorithm::Sha1))
            .build()
            .unwrap()
            .scan(&mut catalog)
            .unwrap();

        let dest = LocalDirectory::create(temp_dir.path().join("dest")).unwrap();
        let mut log = BackupLog::new();
        BackupBuilder::new()
            .key(key)
            .build()
            .run(
                &catalog,
                &temp_dir.path().join("src.fson"),
                &mut log,
                &temp_dir.path().join("src.log"),
                &dest,
            )
            .unwrap();

        Fixture {
            temp_dir,
            catalog,
            log,
            dest,
        }
    }

    fn restored_path(fixture: &Fixture) -> PathBuf {
        fixture.temp_dir.path().join("restored")
    }

    #[test]
    fn test_restore_tree_and_mtimes() {
        let fixture = backed_up(None);
        let target = restored_path(&fixture);

        let report = RestoreBuilder::new()
            .build()
            .restore(&fixture.catalog, &fixture.log, &fixture.dest, &target)
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.restored, 3);
        assert_eq!(fs::read(target.join("c.txt")).unwrap(), b"first file");
        assert_eq!(fs::read(target.join("docs/old/b.txt")).unwrap().len(), 70_000);

        let mtime = |p: &str| FileTime::from_last_modification_time(&fs::metadata(target.join(p)).unwrap());
        assert_eq!(mtime("docs/a.txt").unix_seconds(), 1_600_000_000);
        assert_eq!(mtime("docs/old").unix_seconds(), 1_600_000_000);
    }

    #[test]
    fn test_encrypted_restore() {
        let key = CryptoKey::generate();
        let fixture = backed_up(Some(key.clone()));
        let target = restored_path(&fixture);

        let stored = fs::read_dir(fixture.temp_dir.path().join("dest")).unwrap().count();
        assert_eq!(stored, 4);

        let report = RestoreBuilder::new()
            .key(Some(key))
            .build()
            .restore(&fixture.catalog, &fixture.log, &fixture.dest, &target)
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(fs::read(target.join("docs/a.txt")).unwrap(), b"first file");
    }

    #[test]
    fn test_wrong_key_aborts_before_writing() {
        let fixture = backed_up(Some(CryptoKey::generate()));
        let target = restored_path(&fixture);

        let err = RestoreBuilder::new()
            .key(Some(CryptoKey::generate()))
            .build()
            .restore(&fixture.catalog, &fixture.log, &fixture.dest, &target)
            .unwrap_err();
        assert!(matches!(err, FilesonError::KeyMismatch { .. }));
        assert!(!target.exists());
    }

    #[test]
    fn test_missing_blob_is_reported() {
        let fixture = backed_up(None);
        let target = restored_path(&fixture);
        let (name, _) = fixture
            .log
            .blobs()
            .find(|(_, b)| b.size == 70_000)
            .unwrap();
        fs::remove_file(fixture.temp_dir.path().join("dest").join(name)).unwrap();

        let report = RestoreBuilder::new()
            .build()
            .restore(&fixture.catalog, &fixture.log, &fixture.dest, &target)
            .unwrap();

        assert_eq!(report.missing, vec!["docs/old/b.txt".to_string()]);
        assert_eq!(report.restored, 2);
        assert!(!target.join("docs/old/b.txt").exists());
    }

    #[test]
    fn test_tampered_blob_fails_verification() {
        let fixture = backed_up(None);
        let target = restored_path(&fixture);
        let (name, _) = fixture.log.blobs().find(|(_, b)| b.size == 70_000).unwrap();
        fs::write(fixture.temp_dir.path().join("dest").join(name), b"bit rot").unwrap();

        let report = RestoreBuilder::new()
            .build()
            .restore(&fixture.catalog, &fixture.log, &fixture.dest, &target)
            .unwrap();
        assert_eq!(report.verify_failures.len(), 1);
        assert_eq!(report.verify_failures[0].path, "docs/old/b.txt");
    }

    #[test]
    fn test_fetch_catalogs_bootstraps() {
        let key = CryptoKey::generate();
        let fixture = backed_up(Some(key.clone()));

        let (catalog, log) = fetch_catalogs(&fixture.dest, Some(&key)).unwrap();
        assert_eq!(catalog.records(), fixture.catalog.records());
        assert_eq!(log.records(), fixture.log.records());

        assert!(fetch_catalogs(&fixture.dest, None).is_err());
    }
}
