//! Utility functions for Fileson
//!
//! Small helpers shared by the catalog, scanner and backup engine:
//!
//! ### Timestamps
//! Catalogs store modification times as GMT strings in the
//! `%Y-%m-%d %H:%M:%S` format. [`gmt_string`] renders a [`SystemTime`] that
//! way and [`parse_gmt`] turns it back into a [`FileTime`] suitable for
//! [`set_mtime`].
//!
//! ### Paths
//! Catalog keys are paths relative to the scanned root ([`path_key`]).
//!
//! ### Formatting and parsing
//! Human-readable byte sizes ([`format_bytes`]) and the `k`/`M`/`G`
//! suffixed quantities accepted on the command line ([`parse_quantity`]).
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use fileson::utils::{format_bytes, gmt_string, parse_quantity};
//! use std::time::SystemTime;
//!
//! println!("{}", gmt_string(SystemTime::now()));  // "2024-03-01 12:00:00"
//! println!("{}", format_bytes(1536));             // "1.50 KB"
//! assert_eq!(parse_quantity("1M").unwrap(), 1_000_000);
//! ```

use crate::error::{FilesonError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use filetime::FileTime;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::trace;

/// Timestamp format used for every `*_gmt` value in catalogs and backup logs
pub const GMT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Render a point in time as a GMT catalog timestamp (second resolution)
pub fn gmt_string(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format(GMT_FORMAT).to_string()
}

/// Current time as a GMT catalog timestamp
pub fn gmt_now() -> String {
    gmt_string(SystemTime::now())
}

/// Parse a GMT catalog timestamp into a file time
///
/// # Errors
///
/// - [`FilesonError::Timestamp`] if `value` is not in [`GMT_FORMAT`]
pub fn parse_gmt(value: &str) -> Result<FileTime> {
    let parsed = NaiveDateTime::parse_from_str(value, GMT_FORMAT)?;
    Ok(FileTime::from_unix_time(parsed.and_utc().timestamp(), 0))
}

/// Set both access and modification time of `path` to a GMT catalog timestamp
pub fn set_mtime(path: &Path, modified_gmt: &str) -> Result<()> {
    let time = parse_gmt(modified_gmt)?;
    filetime::set_file_times(path, time, time)?;
    trace!("Set mtime of {:?} to {}", path, modified_gmt);
    Ok(())
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first so symbolic links keep their own path, and
/// falls back to canonicalising both sides.
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            FilesonError::internal(format!(
                "Path {:?} is not relative to {:?}",
                path_canon, base_canon
            ))
        })
}

/// Catalog key for `path` under the scan root `base`
pub fn path_key(path: &Path, base: &Path) -> Result<String> {
    Ok(make_relative(path, base)?.to_string_lossy().into_owned())
}

/// Number of `/`-separated components in a catalog key
pub fn key_depth(key: &str) -> usize {
    Path::new(key).components().count()
}

/// Format bytes as human-readable string
///
/// ```rust,ignore
/// assert_eq!(format_bytes(0), "0 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Parse a decimal quantity with an optional `k`, `M` or `G` suffix
///
/// Used for minimum sizes (`duplicates -m 1M`) and iteration counts
/// (`keygen -i 100k`). Suffixes are powers of 1000.
pub fn parse_quantity(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1_000),
        Some('M') => (&value[..value.len() - 1], 1_000_000),
        Some('G') => (&value[..value.len() - 1], 1_000_000_000),
        _ => (value, 1),
    };

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| FilesonError::InvalidConfiguration(format!("Invalid quantity: {:?}", value)))
}

/// Atomically write content to a file
///
/// Content goes to a temporary file in the same directory which is synced
/// and then renamed over `path`.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| FilesonError::Io(e.error))?;

    Ok(())
}
