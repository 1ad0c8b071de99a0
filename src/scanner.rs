//! Incremental directory scanning
//!
//! A [`Scanner`] walks a directory tree and brings a [`Catalog`] up to date
//! with it. Only actual changes become log records: unchanged entries hit the
//! no-op path of [`VersionedLog::set`](crate::versioned_log::VersionedLog::set),
//! and files whose name, size and modification time match the previous scan
//! reuse their recorded checksum instead of being hashed again.
//!
//! ## Scan steps
//!
//! 1. Bump `:scan:` and record `:directory:`, `:checksum:`, `:date_gmt:`.
//! 2. Build the checksum reuse cache from the catalog's current files, keyed by
//!    (file name or relative path, mtime, size). Keying by name alone lets a
//!    moved file keep its checksum but also lets two different files with the
//!    same name, size and mtime share one; [`ScannerBuilder::strict`] keys by
//!    relative path instead.
//! 3. Walk the tree in file-name order, pruning skipped subtrees. Cache misses
//!    are hashed in parallel, a batch at a time, and records are emitted in
//!    walk order.
//! 4. Delete every path that was in the catalog but not seen during the walk.
//!
//! ## Example
//!
//! ```rust,ignore
//! use fileson::catalog::Catalog;
//! use fileson::checksum::ChecksumAlgorithm;
//! use fileson::scanner::ScannerBuilder;
//!
//! let scanner = ScannerBuilder::new("/home/me/photos")
//!     .checksum(Some(ChecksumAlgorithm::Sha1))
//!     .skip_patterns(vec![".cache".to_string(), "*.tmp".to_string()])
//!     .build()?;
//!
//! let mut catalog = Catalog::new();
//! let report = scanner.scan(&mut catalog)?;
//! println!("{} files, {} hashed", report.files, report.hashed);
//! ```

use crate::catalog::{parse_version_suffix, Catalog};
use crate::checksum::ChecksumAlgorithm;
use crate::error::{FilesonError, Result};
use crate::progress::CancelFlag;
use crate::types::{keys, DirMeta, Entry, FileError, FileMeta, ProgressCallback, ProgressInfo};
use crate::utils::{self, gmt_string};
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

/// Entries handed to the hashing pool at once
const BATCH_SIZE: usize = 64;

/// Hashed bytes between two progress log lines
const PROGRESS_LOG_BYTES: u64 = 1 << 30;

/// Skip rules for a scan
///
/// A pattern containing `*`, `?` or `[` is a glob matched against the path
/// relative to the scan root. Any other pattern skips every entry whose full
/// path contains it as a substring.
#[derive(Debug, Clone, Default)]
pub struct SkipFilter {
    substrings: Vec<String>,
    globs: Option<GlobSet>,
}

impl SkipFilter {
    /// Compile skip patterns
    ///
    /// # Errors
    ///
    /// - [`FilesonError::InvalidPattern`] if a glob pattern does not compile
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut substrings = Vec::new();
        let mut builder = GlobSetBuilder::new();
        let mut has_globs = false;

        for pattern in patterns.iter().filter(|p| !p.is_empty()) {
            if pattern.contains(['*', '?', '[']) {
                let glob = Glob::new(pattern)
                    .map_err(|e| FilesonError::InvalidPattern(format!("{}: {}", pattern, e)))?;
                builder.add(glob);
                has_globs = true;
            } else {
                substrings.push(pattern.clone());
            }
        }

        let globs = if has_globs {
            Some(builder.build().map_err(|e| FilesonError::InvalidPattern(e.to_string()))?)
        } else {
            None
        };

        Ok(Self { substrings, globs })
    }

    /// Check whether an entry (and everything below it) is skipped
    pub fn is_skipped(&self, full: &Path, relative: &Path) -> bool {
        if !self.substrings.is_empty() {
            let full = full.to_string_lossy();
            if self.substrings.iter().any(|s| full.contains(s.as_str())) {
                return true;
            }
        }
        self.globs.as_ref().is_some_and(|set| set.is_match(relative))
    }
}

/// Outcome of one scan
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Value of `:scan:` after this scan
    pub scan: u64,
    /// Files seen
    pub files: usize,
    /// Directories seen
    pub dirs: usize,
    /// Total size of files seen
    pub total_bytes: u64,
    /// Files hashed during this scan
    pub hashed: usize,
    /// Bytes hashed during this scan
    pub bytes_hashed: u64,
    /// Files whose checksum came from the reuse cache
    pub reused: usize,
    /// Paths deleted because they were not seen
    pub removed: usize,
    /// Records appended to the catalog
    pub records_written: usize,
    /// Entries that could not be read
    pub errors: Vec<FileError>,
    /// Wall time of the scan
    pub duration_ms: u64,
}

enum Observed {
    Dir {
        key: String,
        meta: DirMeta,
    },
    File {
        key: String,
        path: PathBuf,
        meta: FileMeta,
        cached: Option<String>,
    },
}

type CacheKey = (String, String, u64);

/// Directory scanner bound to one root
pub struct Scanner {
    root: PathBuf,
    checksum: Option<ChecksumAlgorithm>,
    skip: SkipFilter,
    strict: bool,
    pool: rayon::ThreadPool,
    cancel: CancelFlag,
    progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("root", &self.root)
            .field("checksum", &self.checksum)
            .field("strict", &self.strict)
            .field("workers", &self.pool.current_num_threads())
            .finish()
    }
}

impl std::fmt::Debug for ScannerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScannerBuilder")
            .field("root", &self.root)
            .field("checksum", &self.checksum)
            .field("skip_patterns", &self.skip_patterns)
            .field("strict", &self.strict)
            .finish()
    }
}

impl Scanner {
    /// Scan root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bring `catalog` up to date with the directory tree
    ///
    /// Per-entry failures are collected in [`ScanReport::errors`] and leave the
    /// entry's previous value untouched. Paths that vanished are only deleted
    /// once the walk completes, so a cancelled scan never records removals.
    ///
    /// # Errors
    ///
    /// - [`FilesonError::InvalidConfiguration`] if the root is not a directory
    /// - [`FilesonError::Cancelled`] if the cancel flag was raised
    /// - [`FilesonError::Io`] if a record cannot be written to a live log
    #[instrument(skip(self, catalog), fields(root = ?self.root))]
    pub fn scan(&self, catalog: &mut Catalog) -> Result<ScanReport> {
        let started = Instant::now();
        if !self.root.is_dir() {
            return Err(FilesonError::InvalidConfiguration(format!(
                "{:?} is not a directory",
                self.root
            )));
        }

        let records_before = catalog.records().len();
        let mut report = ScanReport {
            scan: catalog.scan_count() + 1,
            ..Default::default()
        };

        catalog.set(keys::SCAN, Entry::meta(report.scan))?;
        catalog.set(keys::DIRECTORY, Entry::meta(self.root.to_string_lossy().into_owned()))?;
        catalog.set(
            keys::CHECKSUM,
            Entry::Meta(self.checksum.map(|a| a.name().into()).unwrap_or(serde_json::Value::Null)),
        )?;
        catalog.set(keys::DATE_GMT, Entry::meta(utils::gmt_now()))?;

        let cache = self.build_cache(catalog);
        let mut missing: HashSet<String> = catalog
            .files()
            .map(|(k, _)| k.to_string())
            .chain(catalog.dirs().map(|(k, _)| k.to_string()))
            .collect();
        debug!("Scan {} of {:?}: {} cached checksums", report.scan, self.root, cache.len());

        let root = self.root.as_path();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let relative = e.path().strip_prefix(root).unwrap_or(e.path());
                let skipped = self.skip.is_skipped(e.path(), relative);
                if skipped {
                    trace!("Skipping {:?}", e.path());
                }
                !skipped
            });

        let mut batch = Vec::with_capacity(BATCH_SIZE);
        let mut next_log = PROGRESS_LOG_BYTES;

        for entry in walker {
            self.cancel.check()?;

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                    warn!("Cannot read {}: {}", path, e);
                    report.errors.push(FileError::new(path, e));
                    continue;
                }
            };

            let key = utils::path_key(entry.path(), root)?;
            missing.remove(&key);

            // Symlinks count as whatever they point at, but are never descended into.
            let (metadata, modified_gmt) = match stat(entry.path()) {
                Ok(stat) => stat,
                Err(e) => {
                    warn!("Cannot stat {:?}: {}", entry.path(), e);
                    report.errors.push(FileError::new(key, e));
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                report.dirs += 1;
                batch.push(Observed::Dir {
                    key,
                    meta: DirMeta { modified_gmt },
                });
            } else if metadata.is_file() {
                report.files += 1;
                report.total_bytes += metadata.len();
                let cached = cache
                    .get(&(self.cache_name(&key), modified_gmt.clone(), metadata.len()))
                    .cloned();
                batch.push(Observed::File {
                    key,
                    path: entry.into_path(),
                    meta: FileMeta::new(metadata.len(), modified_gmt),
                    cached,
                });
            } else {
                debug!("Ignoring special file {:?}", entry.path());
                continue;
            }

            if batch.len() >= BATCH_SIZE {
                self.flush_batch(catalog, &mut batch, &mut report)?;
                if report.bytes_hashed >= next_log {
                    info!(
                        "Scanned {} files, hashed {}",
                        report.files,
                        utils::format_bytes(report.bytes_hashed)
                    );
                    next_log = (report.bytes_hashed / PROGRESS_LOG_BYTES + 1) * PROGRESS_LOG_BYTES;
                }
            }
        }
        self.flush_batch(catalog, &mut batch, &mut report)?;

        let mut missing: Vec<String> = missing.into_iter().collect();
        missing.sort_unstable();
        for key in missing {
            trace!("Removed: {}", key);
            if catalog.delete(&key)? {
                report.removed += 1;
            }
        }

        report.records_written = catalog.records().len() - records_before;
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Scan {} complete: {} files, {} dirs, {} hashed, {} reused, {} removed, {} records",
            report.scan,
            report.files,
            report.dirs,
            report.hashed,
            report.reused,
            report.removed,
            report.records_written
        );

        Ok(report)
    }

    fn cache_name(&self, key: &str) -> String {
        if self.strict {
            key.to_string()
        } else {
            Path::new(key)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| key.to_string())
        }
    }

    fn build_cache(&self, catalog: &Catalog) -> HashMap<CacheKey, String> {
        let Some(algorithm) = self.checksum else {
            return HashMap::new();
        };

        catalog
            .files()
            .filter_map(|(path, meta)| {
                meta.checksum(algorithm).map(|sum| {
                    (
                        (self.cache_name(path), meta.modified_gmt.clone(), meta.size),
                        sum.to_string(),
                    )
                })
            })
            .collect()
    }

    fn flush_batch(&self, catalog: &mut Catalog, batch: &mut Vec<Observed>, report: &mut ScanReport) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let algorithm = self.checksum;
        let hashed: Vec<Option<Result<String>>> = self.pool.install(|| {
            batch
                .par_iter()
                .map(|observed| match (algorithm, observed) {
                    (Some(alg), Observed::File { path, cached: None, .. }) => Some(alg.checksum_file(path)),
                    _ => None,
                })
                .collect()
        });

        for (observed, result) in batch.drain(..).zip(hashed) {
            match observed {
                Observed::Dir { key, meta } => {
                    catalog.set(key, Entry::Dir(meta))?;
                }
                Observed::File { key, meta, cached, .. } => {
                    let size = meta.size;
                    let checksum = match (cached, result) {
                        (Some(sum), _) => {
                            report.reused += 1;
                            Some(sum)
                        }
                        (None, Some(Ok(sum))) => {
                            report.hashed += 1;
                            report.bytes_hashed += size;
                            Some(sum)
                        }
                        (None, Some(Err(e))) => {
                            warn!("Cannot checksum {}: {}", key, e);
                            report.errors.push(FileError::new(key, e));
                            continue;
                        }
                        (None, None) => None,
                    };

                    let meta = match (algorithm, checksum) {
                        (Some(alg), Some(sum)) => meta.with_checksum(alg, sum),
                        _ => meta,
                    };
                    catalog.set(key, Entry::File(meta))?;
                }
            }
        }

        if let Some(callback) = &self.progress_callback {
            callback(ProgressInfo {
                operation: "scan".to_string(),
                current_item: None,
                processed: report.files + report.dirs,
                total: None,
                bytes_processed: report.bytes_hashed,
                total_bytes: None,
            });
        }

        Ok(())
    }
}

/// Builder for [`Scanner`]
pub struct ScannerBuilder {
    root: PathBuf,
    checksum: Option<ChecksumAlgorithm>,
    skip_patterns: Vec<String>,
    strict: bool,
    parallel_workers: usize,
    cancel: CancelFlag,
    progress_callback: Option<ProgressCallback>,
}

impl ScannerBuilder {
    /// Start building a scanner for `root`
    ///
    /// Defaults: no checksum, no skip patterns, name-keyed cache, one hashing
    /// worker per CPU.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            checksum: None,
            skip_patterns: Vec::new(),
            strict: false,
            parallel_workers: num_cpus::get(),
            cancel: CancelFlag::new(),
            progress_callback: None,
        }
    }

    /// Set the checksum algorithm (`None` records size and mtime only)
    pub fn checksum(mut self, algorithm: Option<ChecksumAlgorithm>) -> Self {
        self.checksum = algorithm;
        self
    }

    /// Set skip patterns
    pub fn skip_patterns(mut self, patterns: Vec<String>) -> Self {
        self.skip_patterns = patterns;
        self
    }

    /// Key the checksum cache by relative path instead of file name
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set the number of hashing threads (minimum 1)
    pub fn parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers.max(1);
        self
    }

    /// Share a cancellation flag
    pub fn cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set a progress callback, invoked after every batch
    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Build the scanner
    ///
    /// # Errors
    ///
    /// - [`FilesonError::InvalidPattern`] for a malformed glob
    /// - [`FilesonError::ThreadPool`] if the hashing pool cannot start
    pub fn build(self) -> Result<Scanner> {
        let skip = SkipFilter::new(&self.skip_patterns)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallel_workers)
            .build()
            .map_err(|e| FilesonError::ThreadPool(e.to_string()))?;

        Ok(Scanner {
            root: self.root,
            checksum: self.checksum,
            skip,
            strict: self.strict,
            pool,
            cancel: self.cancel,
            progress_callback: self.progress_callback,
        })
    }
}

/// Load a catalog file, or scan a directory into a fresh in-memory catalog
///
/// A catalog argument may use the `name~N` notation.
pub fn load_or_scan(arg: &str, checksum: Option<ChecksumAlgorithm>) -> Result<Catalog> {
    let (name, back) = parse_version_suffix(arg);
    if back == 0 && Path::new(name).is_dir() {
        let mut catalog = Catalog::new();
        ScannerBuilder::new(name).checksum(checksum).build()?.scan(&mut catalog)?;
        Ok(catalog)
    } else {
        Catalog::load_version(arg)
    }
}

/// Metadata of whatever `path` points at, with its GMT modification time
fn stat(path: &Path) -> std::io::Result<(fs::Metadata, String)> {
    let metadata = fs::metadata(path)?;
    let modified_gmt = gmt_string(metadata.modified()?);
    Ok((metadata, modified_gmt))
}
