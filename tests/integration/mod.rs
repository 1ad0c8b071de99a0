//! Backup and restore scenarios
//!
//! Each test builds a small source tree, scans it, backs it up to a local
//! directory or an in-memory bucket and checks what lands where.

use ::fileson::*;
use filetime::{set_file_mtime, FileTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Source tree, catalog and backup log for one scenario
pub struct BackupHarness {
    pub source: TempDir,
    pub work: TempDir,
    pub catalog: Catalog,
    pub log: BackupLog,
    rng: StdRng,
}

impl BackupHarness {
    pub fn new() -> Self {
        Self {
            source: TempDir::new().unwrap(),
            work: TempDir::new().unwrap(),
            catalog: Catalog::new(),
            log: BackupLog::new(),
            rng: StdRng::seed_from_u64(42),
        }
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.work.path().join("tree.fson")
    }

    pub fn log_path(&self) -> PathBuf {
        self.work.path().join("tree.log")
    }

    /// Write a file with a fixed modification time
    pub fn write(&self, rel: &str, data: &[u8]) {
        let path = self.source.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, data).unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(1_650_000_000, 0)).unwrap();
    }

    /// Write a file of random bytes
    pub fn write_random(&mut self, rel: &str, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        self.rng.fill(&mut data[..]);
        self.write(rel, &data);
        data
    }

    pub fn scan(&mut self) -> ScanReport {
        let path = self.catalog_path();
        let scanner = ScannerBuilder::new(self.source.path())
            .checksum(Some(ChecksumAlgorithm::Sha1))
            .build()
            .unwrap();
        let mut session = self.catalog.live_session(&path).unwrap();
        scanner.scan(&mut session).unwrap()
    }

    pub fn backup(&mut self, builder: BackupBuilder, destination: &dyn Destination) -> Result<BackupReport> {
        let (catalog_path, log_path) = (self.catalog_path(), self.log_path());
        builder
            .build()
            .run(&self.catalog, &catalog_path, &mut self.log, &log_path, destination)
    }

    /// Contents of every regular file under `root`, keyed by relative path
    pub fn tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        walkdir::WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
                (rel, fs::read(e.path()).unwrap())
            })
            .collect()
    }
}

impl Default for BackupHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_then_restore_round_trip() {
        let mut harness = BackupHarness::new();
        harness.write_random("photos/2023/a.jpg", 70_000);
        harness.write_random("photos/2024/b.jpg", 12_345);
        harness.write("notes.txt", b"remember the milk");
        harness.write("empty.txt", b"");
        fs::create_dir(harness.source.path().join("empty_dir")).unwrap();
        harness.scan();

        let dest = LocalDirectory::create(harness.work.path().join("dest")).unwrap();
        let report = harness.backup(BackupBuilder::new(), &dest).unwrap();
        assert_eq!(report.run, 1);
        assert_eq!(report.uploaded, 4);
        assert!(report.is_clean());

        let target = harness.work.path().join("restored");
        let restored = RestoreBuilder::new()
            .build()
            .restore(&harness.catalog, &harness.log, &dest, &target)
            .unwrap();
        assert!(restored.is_complete());
        assert_eq!(restored.restored, 4);

        assert_eq!(BackupHarness::tree(harness.source.path()), BackupHarness::tree(&target));
        assert!(target.join("empty_dir").is_dir());
        let mtime = FileTime::from_last_modification_time(&fs::metadata(target.join("notes.txt")).unwrap());
        assert_eq!(mtime.unix_seconds(), 1_650_000_000);
    }

    #[test]
    fn test_second_run_transfers_nothing_new() {
        let mut harness = BackupHarness::new();
        harness.write_random("a.bin", 5000);
        harness.write_random("b.bin", 6000);
        harness.scan();

        let dest = LocalDirectory::create(harness.work.path().join("dest")).unwrap();
        harness.backup(BackupBuilder::new(), &dest).unwrap();

        let again = harness.backup(BackupBuilder::new(), &dest).unwrap();
        assert_eq!(again.run, 2);
        assert_eq!(again.uploaded, 0);
        assert_eq!(again.already_stored, 2);

        // Change one file, rescan, and only that content moves
        harness.write_random("b.bin", 6001);
        harness.scan();
        let third = harness.backup(BackupBuilder::new(), &dest).unwrap();
        assert_eq!(third.uploaded, 1);
        assert_eq!(third.bytes, 6001);
        assert_eq!(harness.log.blobs().count(), 3);
    }

    #[test]
    fn test_identical_content_stored_once() {
        let mut harness = BackupHarness::new();
        let data = harness.write_random("one/copy.bin", 10_000);
        harness.write("two/copy.bin", &data);
        harness.write("three/copy.bin", &data);
        harness.scan();

        let dest = LocalDirectory::create(harness.work.path().join("dest")).unwrap();
        let plan = BackupBuilder::new().build().plan(&harness.catalog, &harness.log).unwrap();
        assert_eq!(plan.pending.len(), 1);
        assert_eq!(plan.duplicates, 2);
        assert_eq!(plan.total_bytes, 10_000);

        let report = harness.backup(BackupBuilder::new(), &dest).unwrap();
        assert_eq!(report.uploaded, 1);

        let target = harness.work.path().join("restored");
        let restored = RestoreBuilder::new()
            .build()
            .restore(&harness.catalog, &harness.log, &dest, &target)
            .unwrap();
        assert_eq!(restored.restored, 3);
        assert_eq!(fs::read(target.join("three/copy.bin")).unwrap(), data);
    }

    #[test]
    fn test_interrupted_backup_resumes() {
        let mut harness = BackupHarness::new();
        for i in 0..5 {
            harness.write_random(&format!("file{}.bin", i), 2000 + i * 100);
        }
        harness.scan();

        let client = Arc::new(MemoryObjectClient::new());
        let bucket = Bucket::new(client.clone(), "backups", "tree");
        client.fail_after(Some(2));

        let err = harness.backup(BackupBuilder::new(), &bucket).unwrap_err();
        match err {
            FilesonError::TransferInterrupted { completed, remaining, .. } => {
                assert_eq!(completed, 2);
                assert_eq!(remaining, 3);
            }
            other => panic!("unexpected error: {}", other),
        }

        // The log on disk holds exactly what was stored before the failure
        let mut log = BackupLog::load(&harness.log_path()).unwrap();
        assert_eq!(log.blobs().count(), 2);

        client.fail_after(None);
        let report = BackupBuilder::new()
            .build()
            .run(&harness.catalog, &harness.catalog_path(), &mut log, &harness.log_path(), &bucket)
            .unwrap();
        assert_eq!(report.run, 2);
        assert_eq!(report.uploaded, 3);
        assert_eq!(report.already_stored, 2);
        assert_eq!(log.stored_hashes().len(), 5);

        // five blobs plus the catalog and log objects
        assert_eq!(client.object_count("backups"), 7);
    }

    #[test]
    fn test_multipart_bucket_round_trip() {
        let mut harness = BackupHarness::new();
        let big = harness.write_random("big.bin", 5000);
        harness.write_random("small.bin", 100);
        harness.scan();

        let client = Arc::new(MemoryObjectClient::new());
        let bucket = Bucket::new(client.clone(), "backups", "mp").with_part_size(1024);
        let key = CryptoKey::generate();
        let report = harness
            .backup(BackupBuilder::new().key(Some(key.clone())).part_size(1024), &bucket)
            .unwrap();
        assert!(report.tag_mismatches.is_empty());

        let (catalog, log) = fetch_catalogs(&bucket, Some(&key)).unwrap();
        assert_eq!(catalog.files().count(), 2);

        let target = harness.work.path().join("restored");
        let restored = RestoreBuilder::new()
            .key(Some(key))
            .build()
            .restore(&catalog, &log, &bucket, &target)
            .unwrap();
        assert!(restored.is_complete());
        assert_eq!(fs::read(target.join("big.bin")).unwrap(), big);
    }

    #[test]
    fn test_encrypted_blobs_hide_content() {
        let mut harness = BackupHarness::new();
        harness.write("secret.txt", b"the combination is 12345");
        harness.scan();

        let dest_dir = harness.work.path().join("dest");
        let dest = LocalDirectory::create(&dest_dir).unwrap();
        let key = CryptoKey::derive("hunter2", "salt", 1000);
        harness.backup(BackupBuilder::new().key(Some(key.clone())), &dest).unwrap();

        assert_eq!(harness.log.key_hash(), Some(key.hash().as_str()));
        for (_, bytes) in BackupHarness::tree(&dest_dir) {
            assert!(!bytes.windows(11).any(|w| w == b"combination"));
        }

        // A wrong key is rejected before anything is written
        let target = harness.work.path().join("restored");
        let err = RestoreBuilder::new()
            .key(Some(CryptoKey::generate()))
            .build()
            .restore(&harness.catalog, &harness.log, &dest, &target)
            .unwrap_err();
        assert!(matches!(err, FilesonError::KeyMismatch { .. }));
        assert!(!target.exists());

        let err = RestoreBuilder::new()
            .build()
            .restore(&harness.catalog, &harness.log, &dest, &target)
            .unwrap_err();
        assert!(matches!(err, FilesonError::KeyRequired));

        // Backing up to the same log with another key is refused too
        let err = harness
            .backup(BackupBuilder::new().key(Some(CryptoKey::generate())), &dest)
            .unwrap_err();
        assert!(matches!(err, FilesonError::KeyMismatch { .. }));
    }

    #[test]
    fn test_missing_blob_is_reported_not_fatal() {
        let mut harness = BackupHarness::new();
        harness.write("keep.txt", b"keep me");
        harness.write("lose.txt", b"lose me");
        harness.scan();

        let dest_dir = harness.work.path().join("dest");
        let dest = LocalDirectory::create(&dest_dir).unwrap();
        harness.backup(BackupBuilder::new().upload_catalogs(false), &dest).unwrap();

        let lose_sha1 = harness.catalog.get("lose.txt").and_then(Entry::as_file).unwrap().sha1.clone().unwrap();
        let (name, _) = harness.log.blobs().find(|(_, b)| b.sha1 == lose_sha1).unwrap();
        fs::remove_file(dest_dir.join(name)).unwrap();

        let target = harness.work.path().join("restored");
        let report = RestoreBuilder::new()
            .build()
            .restore(&harness.catalog, &harness.log, &dest, &target)
            .unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.missing, vec!["lose.txt".to_string()]);
        assert!(!report.is_complete());
        assert_eq!(fs::read(target.join("keep.txt")).unwrap(), b"keep me");
        assert!(!target.join("lose.txt").exists());
    }

    #[test]
    fn test_historic_catalog_restores_old_content() {
        let mut harness = BackupHarness::new();
        harness.write("doc.txt", b"first draft");
        harness.scan();
        let dest = LocalDirectory::create(harness.work.path().join("dest")).unwrap();
        harness.backup(BackupBuilder::new(), &dest).unwrap();

        harness.write("doc.txt", b"final version, much longer");
        harness.scan();
        harness.backup(BackupBuilder::new(), &dest).unwrap();

        let spec = format!("{}~1", harness.catalog_path().display());
        let old = Catalog::load_version(&spec).unwrap();
        let target = harness.work.path().join("old");
        RestoreBuilder::new()
            .build()
            .restore(&old, &harness.log, &dest, &target)
            .unwrap();
        assert_eq!(fs::read(target.join("doc.txt")).unwrap(), b"first draft");
    }
}
