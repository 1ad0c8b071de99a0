//! Directory-tree catalogs
//!
//! A [`Catalog`] is a [`VersionedLog`] of [`Entry`] values: relative paths map
//! to [`FileMeta`] or [`DirMeta`], and reserved keys (see [`keys`]) carry scan
//! metadata. Because every scan bumps the `:scan:` counter, any earlier state
//! can be rebuilt by slicing the log at that counter, which is what the
//! `name~N` notation of [`Catalog::load_version`] does.
//!
//! This module holds the read side: enumeration, versioned loading,
//! [`diff`](VersionedLog::diff), duplicate detection and statistics. Scans
//! live in [`crate::scanner`].

use crate::checksum::{self, ChecksumAlgorithm};
use crate::error::{FilesonError, Result};
use crate::types::{keys, DirMeta, Entry, FileMeta};
use crate::utils::key_depth;
use crate::versioned_log::{Record, VersionedLog};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, warn};

/// Directory-tree snapshot history
pub type Catalog = VersionedLog<Entry>;

/// Split `name~N` into the file name and the number of scans to go back
///
/// Anything that doesn't end in `~` followed by digits is a plain file name.
pub fn parse_version_suffix(arg: &str) -> (&str, u64) {
    if let Some((name, back)) = arg.rsplit_once('~') {
        if !name.is_empty() && !back.is_empty() && back.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = back.parse() {
                return (name, n);
            }
        }
    }
    (arg, 0)
}

impl VersionedLog<Entry> {
    /// Load a catalog, honoring the `name~N` notation
    ///
    /// `name~N` yields the catalog as it was N scans before the latest one.
    ///
    /// # Errors
    ///
    /// - [`FilesonError::VersionNotAvailable`] if the catalog has N or fewer scans
    /// - anything [`VersionedLog::load`] returns
    pub fn load_version(arg: &str) -> Result<Catalog> {
        let (name, back) = parse_version_suffix(arg);
        let catalog = Catalog::load(Path::new(name))?;
        if back == 0 {
            return Ok(catalog);
        }

        let latest = catalog.scan_count();
        if back >= latest {
            return Err(FilesonError::VersionNotAvailable {
                requested: back,
                available: latest,
            });
        }

        let end = Record::set(keys::SCAN, Entry::meta(latest - back + 1));
        debug!("Loading {} as of scan {}", name, latest - back);
        catalog.slice(None, Some(&end))
    }

    /// Number of scans recorded (`:scan:`), zero for a fresh catalog
    pub fn scan_count(&self) -> u64 {
        self.meta_value(keys::SCAN).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    /// Root directory of the latest scan
    pub fn directory(&self) -> Option<&str> {
        self.meta_value(keys::DIRECTORY).and_then(|v| v.as_str())
    }

    /// GMT timestamp of the latest scan
    pub fn date_gmt(&self) -> Option<&str> {
        self.meta_value(keys::DATE_GMT).and_then(|v| v.as_str())
    }

    /// Checksum algorithm of the latest scan
    ///
    /// # Errors
    ///
    /// - [`FilesonError::InvalidConfiguration`] if `:checksum:` names an unknown algorithm
    pub fn checksum_algorithm(&self) -> Result<Option<ChecksumAlgorithm>> {
        checksum::parse_optional(self.meta_value(keys::CHECKSUM).and_then(|v| v.as_str()))
    }

    /// Fail unless the latest scan recorded `algorithm` checksums
    pub fn require_checksum(&self, algorithm: ChecksumAlgorithm) -> Result<()> {
        let found = self.checksum_algorithm()?;
        if found == Some(algorithm) {
            Ok(())
        } else {
            Err(FilesonError::ChecksumRequired {
                expected: algorithm.name().to_string(),
                found: found.map(|a| a.name().to_string()),
            })
        }
    }

    fn meta_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.get(key).and_then(Entry::as_meta)
    }

    /// Files in key order
    pub fn files(&self) -> impl Iterator<Item = (&str, &FileMeta)> {
        self.iter()
            .filter(|(k, _)| !keys::is_reserved(k))
            .filter_map(|(k, v)| v.as_file().map(|meta| (k, meta)))
    }

    /// Directories in key order
    pub fn dirs(&self) -> impl Iterator<Item = (&str, &DirMeta)> {
        self.iter()
            .filter(|(k, _)| !keys::is_reserved(k))
            .filter_map(|(k, v)| v.as_dir().map(|meta| (k, meta)))
    }

    /// Compare this catalog (source) against `other` (destination)
    ///
    /// Every non-reserved key whose value differs yields a [`DeltaRecord`].
    /// When both catalogs carry the same checksum algorithm, added and
    /// removed files are annotated with the path holding the same content on
    /// the other side. When the algorithms differ, files are compared by size
    /// and modification time only and [`CatalogDiff::comparison`] says so.
    pub fn diff(&self, other: &Catalog) -> Result<CatalogDiff> {
        let src_alg = self.checksum_algorithm()?;
        let dest_alg = other.checksum_algorithm()?;

        let comparison = if src_alg == dest_alg {
            Comparison::Exact(src_alg)
        } else {
            warn!(
                "Catalogs use different checksums ({:?} vs {:?}), comparing by size and mtime",
                src_alg.map(|a| a.name()),
                dest_alg.map(|a| a.name())
            );
            Comparison::Heuristic {
                src: src_alg,
                dest: dest_alg,
            }
        };

        let (src_index, dest_index) = match comparison {
            Comparison::Exact(Some(alg)) => (self.content_index(alg), other.content_index(alg)),
            _ => (HashMap::new(), HashMap::new()),
        };

        let mut paths: Vec<&str> = self.keys().chain(other.keys()).filter(|k| !keys::is_reserved(k)).collect();
        paths.sort_unstable();
        paths.dedup();

        let mut deltas = Vec::new();
        for path in paths {
            let src = self.get(path);
            let dest = other.get(path);
            if comparison.same(src, dest) {
                continue;
            }

            let counterpart = match (src, dest) {
                (Some(s), None) => lookup(&dest_index, s, comparison),
                (None, Some(d)) => lookup(&src_index, d, comparison),
                _ => None,
            };

            deltas.push(DeltaRecord {
                path: path.to_string(),
                src: src.cloned(),
                dest: dest.cloned(),
                counterpart,
            });
        }

        debug!("Diff found {} changes", deltas.len());
        Ok(CatalogDiff { deltas, comparison })
    }

    /// Content checksum -> first path holding it
    fn content_index(&self, algorithm: ChecksumAlgorithm) -> HashMap<&str, String> {
        let mut index = HashMap::new();
        for (path, meta) in self.files() {
            if let Some(sum) = meta.checksum(algorithm) {
                index.entry(sum).or_insert_with(|| path.to_string());
            }
        }
        index
    }

    /// Groups of files sharing content, largest first
    ///
    /// Content is the checksum when the catalog has one, otherwise just the
    /// size. Files smaller than `min_size` are ignored.
    pub fn duplicates(&self, min_size: u64) -> Result<Vec<DuplicateGroup>> {
        let algorithm = self.checksum_algorithm()?;
        let mut groups: BTreeMap<String, DuplicateGroup> = BTreeMap::new();

        for (path, meta) in self.files().filter(|(_, m)| m.size >= min_size) {
            let content = match algorithm.and_then(|alg| meta.checksum(alg)) {
                Some(sum) => sum.to_string(),
                None => meta.size.to_string(),
            };
            groups
                .entry(content.clone())
                .or_insert_with(|| DuplicateGroup {
                    content,
                    size: meta.size,
                    paths: Vec::new(),
                })
                .paths
                .push(path.to_string());
        }

        let mut result: Vec<DuplicateGroup> = groups.into_values().filter(|g| g.paths.len() > 1).collect();
        result.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.content.cmp(&b.content)));
        Ok(result)
    }

    /// Summary statistics and metadata history
    pub fn stats(&self) -> CatalogStats {
        let mut stats = CatalogStats::default();

        for (path, meta) in self.files() {
            stats.files += 1;
            stats.total_size += meta.size;
            stats.max_size = stats.max_size.max(meta.size);
            stats.max_depth = stats.max_depth.max(key_depth(path));
        }
        for (path, _) in self.dirs() {
            stats.dirs += 1;
            stats.max_depth = stats.max_depth.max(key_depth(path));
        }

        stats.records = self.records().len();
        stats.history = self
            .records()
            .iter()
            .enumerate()
            .filter(|(_, r)| keys::is_reserved(&r.key))
            .map(|(position, r)| MetadataEvent {
                position,
                key: r.key.clone(),
                value: r.value.as_ref().and_then(|v| v.as_meta().cloned()),
            })
            .collect();

        stats
    }
}

fn lookup(index: &HashMap<&str, String>, entry: &Entry, comparison: Comparison) -> Option<String> {
    let Comparison::Exact(Some(alg)) = comparison else {
        return None;
    };
    entry
        .as_file()
        .and_then(|meta| meta.checksum(alg))
        .and_then(|sum| index.get(sum).cloned())
}

/// How two catalogs were compared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Same checksum algorithm (or none on both sides): values compared in full
    Exact(Option<ChecksumAlgorithm>),
    /// Different algorithms: files compared by size and mtime only
    Heuristic {
        /// Source catalog algorithm
        src: Option<ChecksumAlgorithm>,
        /// Destination catalog algorithm
        dest: Option<ChecksumAlgorithm>,
    },
}

impl Comparison {
    fn same(self, src: Option<&Entry>, dest: Option<&Entry>) -> bool {
        match (self, src, dest) {
            (_, None, None) => true,
            (Comparison::Heuristic { .. }, Some(Entry::File(a)), Some(Entry::File(b))) => {
                a.size == b.size && a.modified_gmt == b.modified_gmt
            }
            (_, a, b) => a == b,
        }
    }
}

/// Kind of change a delta represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Only in the destination catalog
    Added,
    /// Only in the source catalog
    Removed,
    /// In both, with different values
    Modified,
}

/// One differing path between two catalogs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaRecord {
    /// Catalog key
    pub path: String,
    /// Value in the source catalog
    pub src: Option<Entry>,
    /// Value in the destination catalog
    pub dest: Option<Entry>,
    /// Path with the same content on the other side, for moves and renames
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterpart: Option<String>,
}

impl DeltaRecord {
    /// Classify the delta
    pub fn kind(&self) -> ChangeKind {
        match (&self.src, &self.dest) {
            (None, _) => ChangeKind::Added,
            (_, None) => ChangeKind::Removed,
            _ => ChangeKind::Modified,
        }
    }
}

/// Result of [`VersionedLog::diff`]
#[derive(Debug, Clone)]
pub struct CatalogDiff {
    /// Differing paths in key order
    pub deltas: Vec<DeltaRecord>,
    /// How values were compared
    pub comparison: Comparison,
}

impl CatalogDiff {
    /// Check whether the comparison fell back to size and mtime
    pub fn is_degraded(&self) -> bool {
        matches!(self.comparison, Comparison::Heuristic { .. })
    }

    /// Number of deltas of a given kind
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.deltas.iter().filter(|d| d.kind() == kind).count()
    }
}

/// Files sharing the same content
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    /// Checksum, or size when the catalog has no checksums
    pub content: String,
    /// Size of each copy
    pub size: u64,
    /// Paths holding the content
    pub paths: Vec<String>,
}

impl DuplicateGroup {
    /// Bytes that would be freed by keeping a single copy
    pub fn wasted_bytes(&self) -> u64 {
        self.size * (self.paths.len() as u64 - 1)
    }
}

/// A reserved-key record and its position in the log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataEvent {
    /// Index in the record sequence
    pub position: usize,
    /// Reserved key
    pub key: String,
    /// Value, or `None` for a delete
    pub value: Option<serde_json::Value>,
}

/// Catalog summary from [`VersionedLog::stats`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogStats {
    /// Number of files
    pub files: usize,
    /// Number of directories
    pub dirs: usize,
    /// Sum of file sizes
    pub total_size: u64,
    /// Largest file size
    pub max_size: u64,
    /// Deepest path, in components
    pub max_depth: usize,
    /// Length of the record sequence
    pub records: usize,
    /// Every reserved-key record in log order
    pub history: Vec<MetadataEvent>,
}
