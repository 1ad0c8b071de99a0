//! Backup destinations
//!
//! A [`Destination`] stores named blobs. Two layouts exist:
//!
//! - [`LocalDirectory`]: one file per blob name in a directory. Writes go to a
//!   temporary file that is synced and renamed, so a blob name only appears
//!   once its bytes are durable.
//! - [`Bucket`]: objects named `prefix/blobName` in an object-store bucket,
//!   reached through an [`ObjectClient`]. Bodies up to one part are sent with a
//!   single put, larger ones as a multipart upload that is aborted on failure.
//!
//! The catalog and backup log of a completed run are stored next to the blobs
//! under [`CATALOG_OBJECT`] and [`BACKUP_LOG_OBJECT`].
//!
//! [`DestinationSpec::open`] picks the layout from a destination argument and
//! connects bucket destinations through [`S3ObjectClient`].
//! [`MemoryObjectClient`] is an in-process [`ObjectClient`] that computes
//! ETags the way S3 does.

use crate::error::{FilesonError, Result};
use crate::integrity::{IntegrityTag, DEFAULT_PART_SIZE};
use crate::s3::S3ObjectClient;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, trace, warn};

/// Object name of the catalog stored with a completed backup
pub const CATALOG_OBJECT: &str = "fileson.fson";

/// Object name of the backup log stored with a completed backup
pub const BACKUP_LOG_OBJECT: &str = "fileson.log";

/// Outcome of storing one blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    /// Bytes stored
    pub bytes: u64,
    /// Tag the destination reported for the stored object, if any
    pub reported_tag: Option<String>,
}

/// An object as listed by a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Blob name, relative to the destination root or prefix
    pub name: String,
    /// Stored size in bytes
    pub size: u64,
    /// Tag reported by the store
    pub etag: Option<String>,
}

/// Where blobs are stored
pub trait Destination: Send + Sync {
    /// Human-readable location, recorded as `:destination:`
    fn describe(&self) -> String;

    /// Store everything `body` yields under `name`
    fn put(&self, name: &str, body: &mut dyn Read) -> Result<PutOutcome>;

    /// Stream the blob `name` into `sink`, returning the bytes written
    ///
    /// # Errors
    ///
    /// - [`FilesonError::ObjectNotFound`] if there is no such blob
    fn get(&self, name: &str, sink: &mut dyn Write) -> Result<u64>;

    /// Check whether a blob exists
    fn exists(&self, name: &str) -> Result<bool>;

    /// List stored blobs
    fn list(&self) -> Result<Vec<ObjectInfo>>;
}

/// Blobs as files in a local directory
#[derive(Debug, Clone)]
pub struct LocalDirectory {
    root: PathBuf,
}

impl LocalDirectory {
    /// Use `root`, creating it if needed
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Use an existing directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(FilesonError::InvalidDestination(format!("{:?} is not a directory", root)));
        }
        Ok(Self { root })
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Destination for LocalDirectory {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn put(&self, name: &str, body: &mut dyn Read) -> Result<PutOutcome> {
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
        let bytes = io::copy(body, &mut temp)?;
        temp.as_file().sync_all()?;
        temp.persist(self.blob_path(name)).map_err(|e| FilesonError::Io(e.error))?;
        trace!("Stored {} ({} bytes) in {:?}", name, bytes, self.root);

        Ok(PutOutcome {
            bytes,
            reported_tag: None,
        })
    }

    fn get(&self, name: &str, sink: &mut dyn Write) -> Result<u64> {
        let mut file = match File::open(self.blob_path(name)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FilesonError::ObjectNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(io::copy(&mut file, sink)?)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.blob_path(name).is_file())
    }

    fn list(&self) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_file() {
                objects.push(ObjectInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: metadata.len(),
                    etag: None,
                });
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }
}

/// Target of one object-store request
#[derive(Debug, Clone, Copy)]
pub struct ObjectRequest<'a> {
    /// Bucket name
    pub bucket: &'a str,
    /// Full object key
    pub key: &'a str,
    /// Storage class for new objects
    pub storage_class: Option<&'a str>,
}

/// A finished part of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number
    pub part_number: u32,
    /// Tag returned for the part
    pub etag: String,
}

/// Object-store transport
///
/// Timeouts and retries are the client's business; errors it returns are
/// propagated unchanged.
pub trait ObjectClient: Send + Sync {
    /// Store a whole object, returning its tag
    fn put_object(&self, request: &ObjectRequest<'_>, body: &[u8]) -> Result<String>;

    /// Start a multipart upload, returning its id
    fn create_multipart_upload(&self, request: &ObjectRequest<'_>) -> Result<String>;

    /// Upload one part, returning its tag
    fn upload_part(&self, request: &ObjectRequest<'_>, upload_id: &str, part_number: u32, body: &[u8]) -> Result<String>;

    /// Assemble uploaded parts, returning the object tag
    fn complete_multipart_upload(&self, request: &ObjectRequest<'_>, upload_id: &str, parts: &[CompletedPart]) -> Result<String>;

    /// Discard an unfinished multipart upload
    fn abort_multipart_upload(&self, request: &ObjectRequest<'_>, upload_id: &str) -> Result<()>;

    /// Stream an object into `sink`
    fn get_object(&self, bucket: &str, key: &str, sink: &mut dyn Write) -> Result<u64>;

    /// List objects whose key starts with `prefix`, with full keys as names
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>>;
}

/// Blobs as objects under a bucket prefix
pub struct Bucket<C> {
    client: C,
    bucket: String,
    prefix: String,
    part_size: u64,
    storage_class: Option<String>,
}

impl<C> fmt::Debug for Bucket<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("part_size", &self.part_size)
            .field("storage_class", &self.storage_class)
            .finish()
    }
}

impl<C: ObjectClient> Bucket<C> {
    /// Objects under `bucket/prefix`, with the default part size
    pub fn new(client: C, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
            part_size: DEFAULT_PART_SIZE,
            storage_class: None,
        }
    }

    /// Set the multipart part size
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    /// Set the storage class for stored objects (e.g. `DEEP_ARCHIVE`)
    pub fn with_storage_class(mut self, storage_class: Option<String>) -> Self {
        self.storage_class = storage_class;
        self
    }

    /// Integrity tag calculator matching this destination's part size
    pub fn integrity_tag(&self) -> IntegrityTag {
        IntegrityTag::new(self.part_size)
    }

    /// The transport
    pub fn client(&self) -> &C {
        &self.client
    }

    fn object_key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    fn request<'a>(&'a self, key: &'a str) -> ObjectRequest<'a> {
        ObjectRequest {
            bucket: &self.bucket,
            key,
            storage_class: self.storage_class.as_deref(),
        }
    }

    fn multipart(&self, request: &ObjectRequest<'_>, first: Vec<u8>, body: &mut dyn Read) -> Result<PutOutcome> {
        let upload_id = self.client.create_multipart_upload(request)?;
        debug!("Multipart upload {} for {}", upload_id, request.key);

        let result = (|| {
            let mut parts = Vec::new();
            let mut bytes = 0u64;
            let mut chunk = first;
            loop {
                let part_number = parts.len() as u32 + 1;
                let etag = self.client.upload_part(request, &upload_id, part_number, &chunk)?;
                bytes += chunk.len() as u64;
                parts.push(CompletedPart { part_number, etag });

                chunk = read_part(body, self.part_size)?;
                if chunk.is_empty() {
                    break;
                }
            }
            let tag = self.client.complete_multipart_upload(request, &upload_id, &parts)?;
            Ok(PutOutcome {
                bytes,
                reported_tag: Some(tag),
            })
        })();

        if result.is_err() {
            if let Err(e) = self.client.abort_multipart_upload(request, &upload_id) {
                warn!("Could not abort upload {}: {}", upload_id, e);
            }
        }
        result
    }
}

impl<C: ObjectClient> Destination for Bucket<C> {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    fn put(&self, name: &str, body: &mut dyn Read) -> Result<PutOutcome> {
        let key = self.object_key(name);
        let request = self.request(&key);

        let first = read_part(body, self.part_size)?;
        if (first.len() as u64) < self.part_size {
            let tag = self.client.put_object(&request, &first)?;
            return Ok(PutOutcome {
                bytes: first.len() as u64,
                reported_tag: Some(tag),
            });
        }

        // A body of exactly one part still needs a peek to know it ended.
        let next = read_part(body, self.part_size)?;
        if next.is_empty() {
            let tag = self.client.put_object(&request, &first)?;
            return Ok(PutOutcome {
                bytes: first.len() as u64,
                reported_tag: Some(tag),
            });
        }

        let mut rest = io::Cursor::new(next).chain(body);
        self.multipart(&request, first, &mut rest)
    }

    fn get(&self, name: &str, sink: &mut dyn Write) -> Result<u64> {
        self.client.get_object(&self.bucket, &self.object_key(name), sink)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let key = self.object_key(name);
        Ok(self
            .client
            .list_objects(&self.bucket, &key)?
            .iter()
            .any(|o| o.name == key))
    }

    fn list(&self) -> Result<Vec<ObjectInfo>> {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        let mut objects = self.client.list_objects(&self.bucket, &prefix)?;
        for object in &mut objects {
            object.name = object.name[prefix.len()..].to_string();
        }
        Ok(objects)
    }
}

/// Read up to `part_size` bytes, stopping early only at end of stream
fn read_part(body: &mut dyn Read, part_size: u64) -> io::Result<Vec<u8>> {
    let mut part = Vec::new();
    body.take(part_size).read_to_end(&mut part)?;
    Ok(part)
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    storage_class: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<(String, String), StoredObject>,
    uploads: BTreeMap<String, BTreeMap<u32, Vec<u8>>>,
    next_upload: u64,
    puts: usize,
}

/// In-process [`ObjectClient`]
///
/// Tags follow the S3 convention, so they can be checked against
/// [`IntegrityTag`]. [`MemoryObjectClient::fail_after`] makes every store
/// request after the first `n` fail, to exercise interrupted runs.
#[derive(Debug, Default)]
pub struct MemoryObjectClient {
    state: Mutex<MemoryState>,
    fail_after: Mutex<Option<usize>>,
}

impl MemoryObjectClient {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every put or part upload after the first `puts` succeed
    pub fn fail_after(&self, puts: Option<usize>) {
        *self.fail_after.lock() = puts;
    }

    /// Stored objects in a bucket
    pub fn object_count(&self, bucket: &str) -> usize {
        self.state.lock().objects.keys().filter(|(b, _)| b == bucket).count()
    }

    /// Storage class an object was stored with
    pub fn storage_class(&self, bucket: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|o| o.storage_class.clone())
    }

    /// Count a store request, failing if the limit is reached
    fn admit(&self, state: &mut MemoryState) -> Result<()> {
        if let Some(limit) = *self.fail_after.lock() {
            if state.puts >= limit {
                return Err(FilesonError::transport("simulated connection reset"));
            }
        }
        state.puts += 1;
        Ok(())
    }
}

impl ObjectClient for MemoryObjectClient {
    fn put_object(&self, request: &ObjectRequest<'_>, body: &[u8]) -> Result<String> {
        let mut state = self.state.lock();
        self.admit(&mut state)?;
        let etag = format!("{:x}", md5::compute(body));
        state.objects.insert(
            (request.bucket.to_string(), request.key.to_string()),
            StoredObject {
                data: body.to_vec(),
                etag: etag.clone(),
                storage_class: request.storage_class.map(str::to_string),
            },
        );
        Ok(etag)
    }

    fn create_multipart_upload(&self, request: &ObjectRequest<'_>) -> Result<String> {
        let mut state = self.state.lock();
        state.next_upload += 1;
        let id = format!("upload-{}-{}", state.next_upload, request.key);
        state.uploads.insert(id.clone(), BTreeMap::new());
        Ok(id)
    }

    fn upload_part(&self, _request: &ObjectRequest<'_>, upload_id: &str, part_number: u32, body: &[u8]) -> Result<String> {
        let mut state = self.state.lock();
        self.admit(&mut state)?;
        let parts = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| FilesonError::transport(format!("unknown upload {}", upload_id)))?;
        parts.insert(part_number, body.to_vec());
        Ok(format!("{:x}", md5::compute(body)))
    }

    fn complete_multipart_upload(&self, request: &ObjectRequest<'_>, upload_id: &str, parts: &[CompletedPart]) -> Result<String> {
        let mut state = self.state.lock();
        let mut uploaded = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| FilesonError::transport(format!("unknown upload {}", upload_id)))?;

        let mut data = Vec::new();
        let mut digests = Vec::new();
        for part in parts {
            let body = uploaded
                .remove(&part.part_number)
                .ok_or_else(|| FilesonError::transport(format!("missing part {}", part.part_number)))?;
            digests.extend_from_slice(&md5::compute(&body).0);
            data.extend_from_slice(&body);
        }

        let etag = format!("{:x}-{}", md5::compute(&digests), parts.len());
        state.objects.insert(
            (request.bucket.to_string(), request.key.to_string()),
            StoredObject {
                data,
                etag: etag.clone(),
                storage_class: request.storage_class.map(str::to_string),
            },
        );
        Ok(etag)
    }

    fn abort_multipart_upload(&self, _request: &ObjectRequest<'_>, upload_id: &str) -> Result<()> {
        self.state.lock().uploads.remove(upload_id);
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str, sink: &mut dyn Write) -> Result<u64> {
        let data = self
            .state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
            .ok_or_else(|| FilesonError::ObjectNotFound(format!("{}/{}", bucket, key)))?;
        sink.write_all(&data)?;
        Ok(data.len() as u64)
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .state
            .lock()
            .objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), o)| ObjectInfo {
                name: k.clone(),
                size: o.data.len() as u64,
                etag: Some(o.etag.clone()),
            })
            .collect())
    }
}

impl<T: ObjectClient + ?Sized> ObjectClient for std::sync::Arc<T> {
    fn put_object(&self, request: &ObjectRequest<'_>, body: &[u8]) -> Result<String> {
        (**self).put_object(request, body)
    }

    fn create_multipart_upload(&self, request: &ObjectRequest<'_>) -> Result<String> {
        (**self).create_multipart_upload(request)
    }

    fn upload_part(&self, request: &ObjectRequest<'_>, upload_id: &str, part_number: u32, body: &[u8]) -> Result<String> {
        (**self).upload_part(request, upload_id, part_number, body)
    }

    fn complete_multipart_upload(&self, request: &ObjectRequest<'_>, upload_id: &str, parts: &[CompletedPart]) -> Result<String> {
        (**self).complete_multipart_upload(request, upload_id, parts)
    }

    fn abort_multipart_upload(&self, request: &ObjectRequest<'_>, upload_id: &str) -> Result<()> {
        (**self).abort_multipart_upload(request, upload_id)
    }

    fn get_object(&self, bucket: &str, key: &str, sink: &mut dyn Write) -> Result<u64> {
        (**self).get_object(bucket, key, sink)
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        (**self).list_objects(bucket, prefix)
    }
}

/// A parsed destination argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationSpec {
    /// Local directory
    Local(PathBuf),
    /// `s3://bucket/prefix`
    Bucket {
        /// Bucket name
        bucket: String,
        /// Key prefix without surrounding slashes
        prefix: String,
    },
}

impl FromStr for DestinationSpec {
    type Err = FilesonError;

    fn from_str(s: &str) -> Result<Self> {
        let Some(rest) = s.strip_prefix("s3://") else {
            return Ok(DestinationSpec::Local(PathBuf::from(s)));
        };

        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        let valid_bucket = !bucket.is_empty()
            && bucket
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_');
        if !valid_bucket {
            return Err(FilesonError::InvalidDestination(format!("bad bucket name in {:?}", s)));
        }

        Ok(DestinationSpec::Bucket {
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }
}

impl fmt::Display for DestinationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationSpec::Local(path) => write!(f, "{}", path.display()),
            DestinationSpec::Bucket { bucket, prefix } => write!(f, "s3://{}/{}", bucket, prefix),
        }
    }
}

impl DestinationSpec {
    /// Open the destination, connecting to S3 for bucket destinations
    ///
    /// `part_size` and `storage_class` only apply to buckets; a local
    /// directory is created first when `create` is set.
    pub fn open(&self, create: bool, part_size: u64, storage_class: Option<String>) -> Result<Box<dyn Destination>> {
        self.open_with(create, part_size, storage_class, S3ObjectClient::from_env)
    }

    /// Like [`DestinationSpec::open`], with `connect` supplying the bucket transport
    pub fn open_with<C, F>(
        &self,
        create: bool,
        part_size: u64,
        storage_class: Option<String>,
        connect: F,
    ) -> Result<Box<dyn Destination>>
    where
        C: ObjectClient + 'static,
        F: FnOnce() -> Result<C>,
    {
        match self {
            DestinationSpec::Local(_) => {
                if storage_class.is_some() {
                    warn!("Storage classes only apply to object-store destinations, ignoring for {}", self);
                }
                Ok(Box::new(self.open_local(create)?))
            }
            DestinationSpec::Bucket { bucket, prefix } => {
                debug!("Connecting to {}", self);
                let bucket = Bucket::new(connect()?, bucket.clone(), prefix.clone())
                    .with_part_size(part_size)
                    .with_storage_class(storage_class);
                Ok(Box::new(bucket))
            }
        }
    }

    /// Open a local destination, creating the directory when `create` is set
    ///
    /// # Errors
    ///
    /// - [`FilesonError::InvalidDestination`] for bucket destinations, which
    ///   go through [`DestinationSpec::open`]
    pub fn open_local(&self, create: bool) -> Result<LocalDirectory> {
        match self {
            DestinationSpec::Local(path) if create => LocalDirectory::create(path),
            DestinationSpec::Local(path) => LocalDirectory::open(path),
            DestinationSpec::Bucket { .. } => Err(FilesonError::InvalidDestination(format!(
                "{} is a bucket, not a local directory",
                self
            ))),
        }
    }

    /// Local path, if this is a local destination
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            DestinationSpec::Local(path) => Some(path),
            DestinationSpec::Bucket { .. } => None,
        }
    }
}
