//! Test suites for Fileson
//!
//! - Integration tests chaining scan, backup, resume and restore
//! - Property-based tests for the log and crypto invariants

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::fileson::*;
    use std::fs;
    use tempfile::TempDir;

    fn sha1_catalog(root: &std::path::Path) -> Catalog {
        let mut catalog = Catalog::new();
        ScannerBuilder::new(root)
            .checksum(Some(ChecksumAlgorithm::Sha1))
            .build()
            .unwrap()
            .scan(&mut catalog)
            .unwrap();
        catalog
    }

    #[test]
    fn test_empty_directory() {
        let source = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let catalog = sha1_catalog(source.path());
        assert_eq!(catalog.files().count(), 0);
        assert_eq!(catalog.scan_count(), 1);

        let destination = LocalDirectory::create(work.path().join("dest")).unwrap();
        let mut log = BackupLog::new();
        let report = BackupBuilder::new()
            .build()
            .run(
                &catalog,
                &work.path().join("c.fson"),
                &mut log,
                &work.path().join("c.log"),
                &destination,
            )
            .unwrap();
        assert_eq!(report.uploaded, 0);
        assert!(report.is_clean());
    }

    #[test]
    fn test_unicode_filenames() {
        let source = TempDir::new().unwrap();
        let names = ["файл.txt", "文件.txt", "αρχείο.txt", "🚀.txt", "file with spaces.txt"];

        let mut created = Vec::new();
        for name in names {
            if fs::write(source.path().join(name), format!("content of {}", name)).is_ok() {
                created.push(name);
            }
        }
        if created.is_empty() {
            return;
        }

        let catalog = sha1_catalog(source.path());
        for name in &created {
            let meta = catalog.get(name).and_then(Entry::as_file).unwrap();
            assert_eq!(meta.size, format!("content of {}", name).len() as u64);
        }

        // Keys survive a save and reload through the JSON log
        let work = TempDir::new().unwrap();
        let db = work.path().join("u.fson");
        catalog.save(&db).unwrap();
        let reloaded = Catalog::load(&db).unwrap();
        assert_eq!(reloaded.files().count(), created.len());
    }

    #[test]
    fn test_skip_patterns_and_nested_dirs() {
        let source = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("a/b/c")).unwrap();
        fs::write(source.path().join("a/b/c/deep.txt"), b"deep").unwrap();
        fs::write(source.path().join("a/.DS_Store"), b"junk").unwrap();
        fs::write(source.path().join("a/b/tmp.tmp"), b"junk").unwrap();

        let mut catalog = Catalog::new();
        ScannerBuilder::new(source.path())
            .checksum(Some(ChecksumAlgorithm::Sha1))
            .skip_patterns(vec![".DS_Store".to_string(), "*.tmp".to_string()])
            .build()
            .unwrap()
            .scan(&mut catalog)
            .unwrap();

        let files: Vec<&str> = catalog.files().map(|(k, _)| k).collect();
        assert_eq!(files, vec!["a/b/c/deep.txt"]);
        assert_eq!(catalog.dirs().count(), 3);
        assert_eq!(catalog.stats().max_depth, 4);
    }
}
