//! Content checksums
//!
//! Catalogs record one of two SHA-1 based checksums per file:
//!
//! - [`ChecksumAlgorithm::Sha1`] hashes the whole file. Backups require it,
//!   since it doubles as the deduplication key.
//! - [`ChecksumAlgorithm::Sha1Fast`] hashes only the first
//!   [`FAST_SAMPLE_BYTES`] and appends the decimal file size, which is enough
//!   to spot most changes on large trees at a fraction of the I/O.

use crate::error::{FilesonError, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;

/// Bytes hashed by [`ChecksumAlgorithm::Sha1Fast`]
pub const FAST_SAMPLE_BYTES: u64 = 64 * 1024;

const BUFFER_SIZE: usize = 64 * 1024;

/// Checksum algorithm used by a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-1 of the full content
    Sha1,
    /// SHA-1 of a bounded prefix with the file size appended
    Sha1Fast,
}

impl ChecksumAlgorithm {
    /// Name recorded under `:checksum:` and used as the file field name
    pub fn name(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha1Fast => "sha1fast",
        }
    }

    /// Checksum a file on disk
    pub fn checksum_file(self, path: &Path) -> Result<String> {
        let file = File::open(path)?;
        match self {
            ChecksumAlgorithm::Sha1 => sha1_reader(file),
            ChecksumAlgorithm::Sha1Fast => {
                let size = file.metadata()?.len();
                let prefix = sha1_reader(file.take(FAST_SAMPLE_BYTES))?;
                Ok(format!("{}{}", prefix, size))
            }
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = FilesonError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha1" => Ok(ChecksumAlgorithm::Sha1),
            "sha1fast" => Ok(ChecksumAlgorithm::Sha1Fast),
            other => Err(FilesonError::InvalidConfiguration(format!(
                "Unknown checksum algorithm {:?} (expected sha1 or sha1fast)",
                other
            ))),
        }
    }
}

/// Parse the `:checksum:` value of a catalog
///
/// `None` and `"none"` mean the catalog carries no checksums.
pub fn parse_optional(value: Option<&str>) -> Result<Option<ChecksumAlgorithm>> {
    match value {
        None | Some("none") => Ok(None),
        Some(name) => name.parse().map(Some),
    }
}

/// Hex SHA-1 of everything a reader yields
pub fn sha1_reader<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-1 of in-memory data
pub fn sha1_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha1::digest(data.as_ref()))
}

/// Writer adapter that SHA-1 hashes everything passing through it
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha1,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
            written: 0,
        }
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Return the inner writer and the hex SHA-1 of the bytes written
    pub fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
