//! `fileson.toml` backup entries
//!
//! Each `[entries.NAME]` table describes one folder to scan and back up. The
//! entry's catalog is `NAME.fson` and its backup log `NAME.log`, both next to
//! the configuration file.
//!
//! ```toml
//! [entries.photos]
//! folder = "/home/me/Pictures"
//! destination = "/mnt/backup/$ENTRY$-$DATE$"
//! key = "photos.key"
//! skip = [".DS_Store", "*.tmp"]
//! checksum = "sha1"
//! ```

use crate::checksum::{self, ChecksumAlgorithm};
use crate::error::{FilesonError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default configuration file name
pub const CONFIG_FILE: &str = "fileson.toml";

/// Storage class used for `deep_archive` entries
pub const DEEP_ARCHIVE: &str = "DEEP_ARCHIVE";

fn default_checksum() -> String {
    ChecksumAlgorithm::Sha1.name().to_string()
}

/// One configured backup entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryConfig {
    /// Folder to scan
    pub folder: PathBuf,
    /// Backup destination; `$ENTRY$` and `$DATE$` are substituted
    #[serde(default)]
    pub destination: Option<String>,
    /// Hex key or key file
    #[serde(default)]
    pub key: Option<String>,
    /// Scan skip patterns
    #[serde(default)]
    pub skip: Vec<String>,
    /// Key the checksum cache by full path instead of file name
    #[serde(default)]
    pub strict: bool,
    /// Checksum algorithm name, or `none`
    #[serde(default = "default_checksum")]
    pub checksum: String,
    /// Store blobs in the deep archive storage class
    #[serde(default)]
    pub deep_archive: bool,
}

impl EntryConfig {
    /// Parsed checksum algorithm
    pub fn checksum_algorithm(&self) -> Result<Option<ChecksumAlgorithm>> {
        checksum::parse_optional(Some(self.checksum.as_str()))
    }

    /// Destination with `$ENTRY$` and `$DATE$` (`YYYY-MM-DD`) substituted
    ///
    /// # Errors
    ///
    /// - [`FilesonError::InvalidConfiguration`] if the entry has no destination
    pub fn destination_for(&self, entry: &str, date: &str) -> Result<String> {
        let destination = self
            .destination
            .as_deref()
            .ok_or_else(|| FilesonError::InvalidConfiguration(format!("entry {} has no destination", entry)))?;
        Ok(destination.replace("$ENTRY$", entry).replace("$DATE$", date))
    }

    /// Destination substituted with today's local date
    pub fn resolved_destination(&self, entry: &str) -> Result<String> {
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        self.destination_for(entry, &today)
    }

    /// Storage class for object-store destinations
    pub fn storage_class(&self) -> Option<String> {
        self.deep_archive.then(|| DEEP_ARCHIVE.to_string())
    }
}

/// Parsed `fileson.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesonConfig {
    /// Entries by name
    #[serde(default)]
    pub entries: BTreeMap<String, EntryConfig>,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl FilesonConfig {
    /// Load a configuration file; entry files live in its directory
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            FilesonError::InvalidConfiguration(format!("cannot read {:?}: {}", path, e))
        })?;
        let mut config = Self::parse(&text)?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        debug!("Loaded {} entries from {:?}", config.entries.len(), path);
        Ok(config)
    }

    /// Parse configuration text; entry files resolve against the working directory
    ///
    /// # Errors
    ///
    /// - [`FilesonError::Toml`] for syntax errors and unknown fields
    /// - [`FilesonError::InvalidConfiguration`] for entry names that cannot
    ///   be file names, or unknown checksum names
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        for (name, entry) in &config.entries {
            if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
                return Err(FilesonError::InvalidConfiguration(format!("bad entry name {:?}", name)));
            }
            entry.checksum_algorithm()?;
        }
        Ok(config)
    }

    /// Entries to act on: the named ones, or all when `names` is empty
    ///
    /// # Errors
    ///
    /// - [`FilesonError::InvalidConfiguration`] if a name is not configured
    pub fn select(&self, names: &[String]) -> Result<Vec<(&str, &EntryConfig)>> {
        if names.is_empty() {
            return Ok(self.entries.iter().map(|(k, v)| (k.as_str(), v)).collect());
        }
        names
            .iter()
            .map(|name| {
                self.entries
                    .get_key_value(name)
                    .map(|(k, v)| (k.as_str(), v))
                    .ok_or_else(|| FilesonError::InvalidConfiguration(format!("no entry named {}", name)))
            })
            .collect()
    }

    /// Catalog file of an entry
    pub fn catalog_path(&self, entry: &str) -> PathBuf {
        self.base_dir.join(format!("{}.fson", entry))
    }

    /// Backup log file of an entry
    pub fn log_path(&self, entry: &str) -> PathBuf {
        self.base_dir.join(format!("{}.log", entry))
    }

    /// Report which of an entry's paths exist
    pub fn check(&self, entry: &str) -> Result<EntryStatus> {
        let config = self
            .entries
            .get(entry)
            .ok_or_else(|| FilesonError::InvalidConfiguration(format!("no entry named {}", entry)))?;
        Ok(EntryStatus {
            folder_exists: config.folder.is_dir(),
            catalog_exists: self.catalog_path(entry).is_file(),
            log_exists: self.log_path(entry).is_file(),
        })
    }
}

/// Presence of an entry's folder and files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStatus {
    /// Folder to scan exists
    pub folder_exists: bool,
    /// Catalog exists
    pub catalog_exists: bool,
    /// Backup log exists
    pub log_exists: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[entries.photos]
folder = "/data/photos"
destination = "s3://bucket/$ENTRY$/$DATE$"
key = "photos.key"
skip = [".DS_Store", "*.tmp"]
deep_archive = true

[entries.docs]
folder = "/data/docs"
checksum = "sha1fast"
strict = true
"#;

    #[test]
    fn test_parse_defaults() {
        let config = FilesonConfig::parse(SAMPLE).unwrap();
        let photos = &config.entries["photos"];
        assert_eq!(photos.checksum_algorithm().unwrap(), Some(ChecksumAlgorithm::Sha1));
        assert!(!photos.strict);
        assert_eq!(photos.storage_class().as_deref(), Some(DEEP_ARCHIVE));

        let docs = &config.entries["docs"];
        assert_eq!(docs.checksum_algorithm().unwrap(), Some(ChecksumAlgorithm::Sha1Fast));
        assert!(docs.strict);
        assert!(docs.skip.is_empty());
        assert!(docs.storage_class().is_none());
    }

    #[test]
    fn test_destination_substitution() {
        let config = FilesonConfig::parse(SAMPLE).unwrap();
        assert_eq!(
            config.entries["photos"].destination_for("photos", "2024-05-01").unwrap(),
            "s3://bucket/photos/2024-05-01"
        );
        assert!(config.entries["docs"].destination_for("docs", "2024-05-01").is_err());
    }

    #[test]
    fn test_select_entries() {
        let config = FilesonConfig::parse(SAMPLE).unwrap();
        let all: Vec<&str> = config.select(&[]).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(all, vec!["docs", "photos"]);
        assert_eq!(config.select(&["photos".to_string()]).unwrap().len(), 1);
        assert!(config.select(&["music".to_string()]).is_err());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(FilesonConfig::parse("[entries.a]\nfolder = \"x\"\nchecksum = \"md5\"\n").is_err());
        assert!(FilesonConfig::parse("[entries.a]\nfolder = \"x\"\ncolour = 1\n").is_err());
        assert!(FilesonConfig::parse("[entries.\"../a\"]\nfolder = \"x\"\n").is_err());
    }

    #[test]
    fn test_entry_files_next_to_config() {
        let temp_dir = TempDir::new().unwrap();
        let folder = temp_dir.path().join("data");
        fs::create_dir(&folder).unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&path, format!("[entries.data]\nfolder = {:?}\n", folder.to_str().unwrap())).unwrap();
        fs::write(temp_dir.path().join("data.fson"), b"").unwrap();

        let config = FilesonConfig::load(&path).unwrap();
        assert_eq!(config.catalog_path("data"), temp_dir.path().join("data.fson"));
        let status = config.check("data").unwrap();
        assert!(status.folder_exists);
        assert!(status.catalog_exists);
        assert!(!status.log_exists);
    }
}
