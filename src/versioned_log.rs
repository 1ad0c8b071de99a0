//! Append-only versioned key-value log
//!
//! A [`VersionedLog`] is an ordered sequence of [`Record`]s, each either an
//! upsert (`[key, value]`) or a delete (`[key]`). Replaying the sequence in
//! order, last write wins, gives the materialized mapping that callers read
//! through [`VersionedLog::get`] and [`VersionedLog::iter`].
//!
//! ## Persistence
//!
//! On disk a log is one JSON array per line, in append order. [`VersionedLog::save`]
//! rewrites the whole file atomically. For crash-resumable runs,
//! [`VersionedLog::live_session`] opens the file in append mode and every
//! subsequent mutation writes and flushes its own line before returning, so an
//! interrupted run loses at most the record being written. A torn final line
//! left by such a crash is dropped with a warning on the next load.
//!
//! ## Time travel
//!
//! [`VersionedLog::slice`] replays only the records between two marker
//! records, which is how catalogs reconstruct the state as of an earlier scan.
//!
//! ## Example
//!
//! ```rust
//! use fileson::versioned_log::{Record, VersionedLog};
//!
//! let mut log: VersionedLog<u32> = VersionedLog::new();
//! log.set("a", 1).unwrap();
//! log.set("marker", 1).unwrap();
//! log.set("a", 2).unwrap();
//!
//! let before = log.slice(None, Some(&Record::set("marker", 1))).unwrap();
//! assert_eq!(before.get("a"), Some(&1));
//! assert_eq!(log.get("a"), Some(&2));
//! ```

use crate::error::{FilesonError, Result};
use crate::utils::atomic_write;
use serde::de::{self, DeserializeOwned, IgnoredAny, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// One entry of the log: an upsert when `value` is present, a delete otherwise
#[derive(Debug, Clone, PartialEq)]
pub struct Record<V> {
    /// Key the record applies to
    pub key: String,
    /// New value, or `None` for a delete
    pub value: Option<V>,
}

impl<V> Record<V> {
    /// Upsert record
    pub fn set(key: impl Into<String>, value: V) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
        }
    }

    /// Delete record
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// Check whether this record deletes its key
    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

impl<V: Serialize> Serialize for Record<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = if self.value.is_some() { 2 } else { 1 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.key)?;
        if let Some(value) = &self.value {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for Record<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RecordVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for RecordVisitor<V> {
            type Value = Record<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a [key] or [key, value] array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Record<V>, A::Error> {
                let key: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let value: Option<V> = seq.next_element()?;
                if seq.next_element::<IgnoredAny>()?.is_some() {
                    return Err(de::Error::invalid_length(3, &self));
                }
                Ok(Record { key, value })
            }
        }

        deserializer.deserialize_seq(RecordVisitor(PhantomData))
    }
}

#[derive(Debug)]
struct LiveFile {
    path: PathBuf,
    file: File,
}

/// Ordered record sequence plus its materialized mapping
///
/// Not safe for concurrent writers: a single owner mutates a log for the
/// duration of a run.
#[derive(Debug)]
pub struct VersionedLog<V> {
    state: BTreeMap<String, V>,
    records: Vec<Record<V>>,
    live: Option<LiveFile>,
}

impl<V> Default for VersionedLog<V> {
    fn default() -> Self {
        Self {
            state: BTreeMap::new(),
            records: Vec::new(),
            live: None,
        }
    }
}

impl<V> VersionedLog<V> {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`
    pub fn get(&self, key: &str) -> Option<&V> {
        self.state.get(key)
    }

    /// Check whether `key` is present in the materialized mapping
    pub fn contains_key(&self, key: &str) -> bool {
        self.state.contains_key(key)
    }

    /// Number of keys in the materialized mapping
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// Check whether the materialized mapping is empty
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Iterate the materialized mapping in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.state.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate current keys in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.state.keys().map(String::as_str)
    }

    /// Full record sequence in append order
    pub fn records(&self) -> &[Record<V>] {
        &self.records
    }

    /// Check whether live logging is active
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Stop live logging and close the append handle
    ///
    /// Calling this when live logging is not active does nothing.
    pub fn end_live_logging(&mut self) {
        if let Some(live) = self.live.take() {
            debug!("Closed live log {:?}", live.path);
        }
    }

    fn apply(&mut self, record: Record<V>) -> Option<V>
    where
        V: Clone,
    {
        let previous = match &record.value {
            Some(value) => self.state.insert(record.key.clone(), value.clone()),
            None => self.state.remove(&record.key),
        };
        self.records.push(record);
        previous
    }
}

impl<V> VersionedLog<V>
where
    V: Serialize + DeserializeOwned + PartialEq + Clone,
{
    /// Build a log by replaying records in order
    ///
    /// Deletes of absent keys are kept in the sequence and otherwise ignored.
    pub fn from_records(records: impl IntoIterator<Item = Record<V>>) -> Self {
        let mut log = Self::new();
        for record in records {
            log.apply(record);
        }
        log
    }

    /// Load a log from disk
    ///
    /// # Errors
    ///
    /// - [`FilesonError::Io`] if the file cannot be read
    /// - [`FilesonError::Format`] if a line is not a `[key]` / `[key, value]`
    ///   record. A final line without a newline that fails to parse is treated
    ///   as a torn write and dropped.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::read_from(BufReader::new(file), path)
    }

    /// Read a log from any buffered reader; `origin` names it in errors
    pub fn read_from<R: BufRead>(mut reader: R, origin: &Path) -> Result<Self> {
        let mut log = Self::new();
        let mut line = String::new();
        let mut line_no = 0;

        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            line_no += 1;

            let text = line.trim();
            if text.is_empty() {
                continue;
            }

            match serde_json::from_str::<Record<V>>(text) {
                Ok(record) => {
                    log.apply(record);
                }
                Err(e) if !line.ends_with('\n') => {
                    warn!("Dropping torn final record in {:?} (line {}): {}", origin, line_no, e);
                }
                Err(e) => return Err(FilesonError::format(origin, line_no, e.to_string())),
            }
        }

        debug!("Loaded {} records ({} keys) from {:?}", log.records.len(), log.state.len(), origin);
        Ok(log)
    }

    /// Write the full record sequence, one record per line
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        for record in &self.records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Serialized record sequence
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Atomically replace `path` with the full record sequence
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write(path, &self.to_bytes()?)?;
        debug!("Saved {} records to {:?}", self.records.len(), path);
        Ok(())
    }

    /// Set `key` to `value`
    ///
    /// Returns `false` without emitting a record when the current value is
    /// already equal to `value`.
    pub fn set(&mut self, key: impl Into<String>, value: V) -> Result<bool> {
        let key = key.into();
        if self.state.get(&key) == Some(&value) {
            return Ok(false);
        }
        self.push(Record::set(key, value))?;
        Ok(true)
    }

    /// Delete `key`
    ///
    /// Returns `false` without emitting a record when the key is absent.
    pub fn delete(&mut self, key: &str) -> Result<bool> {
        if !self.state.contains_key(key) {
            return Ok(false);
        }
        self.push(Record::delete(key))?;
        Ok(true)
    }

    fn push(&mut self, record: Record<V>) -> Result<()> {
        if let Some(live) = self.live.as_mut() {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            let before = live.file.metadata()?.len();
            if let Err(e) = live.file.write_all(&line).and_then(|()| live.file.flush()) {
                // A partial line left mid-file would make the log unloadable.
                if let Err(rewind) = live.file.set_len(before) {
                    warn!("Cannot rewind {:?} after failed append: {}", live.path, rewind);
                    self.end_live_logging();
                }
                return Err(e.into());
            }
            trace!("Logged record for {:?} to {:?}", record.key, live.path);
        }
        self.apply(record);
        Ok(())
    }

    /// Start appending every mutation to `path` as it happens
    ///
    /// `path` must either be the file this log was loaded from or be absent or
    /// empty, in which case the current record sequence is written first. A
    /// torn final line is cut off before appending, and a complete one missing
    /// its newline is terminated. Calling this while already live switches to
    /// the new path.
    pub fn start_live_logging(&mut self, path: &Path) -> Result<()> {
        self.end_live_logging();

        let mut file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
        let len = file.metadata()?.len();

        if len == 0 {
            for record in &self.records {
                let mut line = serde_json::to_vec(record)?;
                line.push(b'\n');
                file.write_all(&line)?;
            }
            file.flush()?;
        } else {
            seal_tail::<V>(&mut file, len, path)?;
        }

        debug!("Live logging to {:?}", path);
        self.live = Some(LiveFile {
            path: path.to_path_buf(),
            file,
        });
        Ok(())
    }

    /// Start live logging and return a guard that ends it when dropped
    pub fn live_session(&mut self, path: &Path) -> Result<LiveSession<'_, V>> {
        self.start_live_logging(path)?;
        Ok(LiveSession { log: self })
    }

    /// Replay the records between two markers into a new log
    ///
    /// The sub-sequence runs from the first occurrence of `start` (inclusive,
    /// or the beginning) to the first occurrence of `end` (exclusive, or the
    /// end of the log).
    ///
    /// # Errors
    ///
    /// - [`FilesonError::MarkerNotFound`] if a given marker never occurs
    pub fn slice(&self, start: Option<&Record<V>>, end: Option<&Record<V>>) -> Result<Self> {
        let from = match start {
            Some(marker) => self.position(marker)?,
            None => 0,
        };
        let to = match end {
            Some(marker) => self.position(marker)?,
            None => self.records.len(),
        };

        Ok(Self::from_records(self.records[from..to.max(from)].iter().cloned()))
    }

    fn position(&self, marker: &Record<V>) -> Result<usize> {
        self.records
            .iter()
            .position(|r| r == marker)
            .ok_or_else(|| FilesonError::MarkerNotFound(marker_description(marker)))
    }
}

fn marker_description<V: Serialize>(marker: &Record<V>) -> String {
    serde_json::to_string(marker).unwrap_or_else(|_| marker.key.clone())
}

/// Make the file end on a line boundary before appending
///
/// A final line without a newline is kept and terminated when it parses as a
/// record, the same rule loading applies, and cut off otherwise.
fn seal_tail<V: DeserializeOwned>(file: &mut File, len: u64, path: &Path) -> Result<()> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    file.seek(SeekFrom::Start(0))?;
    let mut contents = Vec::with_capacity(len as usize);
    file.read_to_end(&mut contents)?;
    let keep = contents
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);

    let tail = String::from_utf8_lossy(&contents[keep..]);
    let tail = tail.trim();
    if tail.is_empty() || serde_json::from_str::<Record<V>>(tail).is_ok() {
        debug!("Terminating final record of {:?}", path);
        file.write_all(b"\n")?;
        file.flush()?;
        return Ok(());
    }

    warn!("Truncating torn record at end of {:?} ({} bytes)", path, len - keep as u64);
    file.set_len(keep as u64)?;
    Ok(())
}

/// Scoped live logging
///
/// Derefs to the log; dropping the session closes the append handle on every
/// exit path, including early returns and unwinding.
pub struct LiveSession<'a, V> {
    log: &'a mut VersionedLog<V>,
}

impl<V> Deref for LiveSession<'_, V> {
    type Target = VersionedLog<V>;

    fn deref(&self) -> &Self::Target {
        &*self.log
    }
}

impl<V> DerefMut for LiveSession<'_, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.log
    }
}

impl<V> Drop for LiveSession<'_, V> {
    fn drop(&mut self) {
        self.log.end_live_logging();
    }
}
