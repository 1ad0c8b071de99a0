//! S3 transport for [`Bucket`](crate::destination::Bucket) destinations
//!
//! [`S3ObjectClient`] implements [`ObjectClient`] on top of the AWS SDK.
//! Credentials, region and endpoint come from the usual AWS environment
//! (`AWS_PROFILE`, `AWS_REGION`, `AWS_ENDPOINT_URL`, ...). The SDK is async;
//! the client owns a small tokio runtime and blocks on each request, so the
//! backup and restore engines stay synchronous.

use crate::destination::{CompletedPart, ObjectClient, ObjectInfo, ObjectRequest};
use crate::error::{FilesonError, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3Part, StorageClass};
use aws_sdk_s3::Client;
use std::fmt;
use std::io::Write;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, trace};

/// [`ObjectClient`] backed by Amazon S3 or an S3-compatible store
pub struct S3ObjectClient {
    client: Client,
    runtime: Runtime,
}

impl fmt::Debug for S3ObjectClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3ObjectClient").finish_non_exhaustive()
    }
}

impl S3ObjectClient {
    /// Client configured from the AWS environment
    ///
    /// Must not be called from inside an async runtime.
    pub fn from_env() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| FilesonError::transport(format!("cannot start S3 runtime: {}", e)))?;
        let config = runtime.block_on(aws_config::load_defaults(BehaviorVersion::latest()));
        debug!("S3 client for region {:?}", config.region().map(|r| r.as_ref().to_string()));
        Ok(Self {
            client: Client::new(&config),
            runtime,
        })
    }
}

fn sdk_error<E>(action: &str, key: &str, err: SdkError<E>) -> FilesonError
where
    E: std::error::Error + Send + Sync + 'static,
{
    FilesonError::transport(format!("{} {}: {}", action, key, DisplayErrorContext(err)))
}

fn unquote(etag: Option<&str>) -> String {
    etag.unwrap_or_default().trim_matches('"').to_string()
}

impl ObjectClient for S3ObjectClient {
    fn put_object(&self, request: &ObjectRequest<'_>, body: &[u8]) -> Result<String> {
        let output = self
            .runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(request.bucket)
                    .key(request.key)
                    .set_storage_class(request.storage_class.map(StorageClass::from))
                    .body(ByteStream::from(body.to_vec()))
                    .send(),
            )
            .map_err(|e| sdk_error("put", request.key, e))?;
        trace!("Put {} ({} bytes)", request.key, body.len());
        Ok(unquote(output.e_tag()))
    }

    fn create_multipart_upload(&self, request: &ObjectRequest<'_>) -> Result<String> {
        let output = self
            .runtime
            .block_on(
                self.client
                    .create_multipart_upload()
                    .bucket(request.bucket)
                    .key(request.key)
                    .set_storage_class(request.storage_class.map(StorageClass::from))
                    .send(),
            )
            .map_err(|e| sdk_error("start upload of", request.key, e))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| FilesonError::transport(format!("no upload id returned for {}", request.key)))
    }

    fn upload_part(&self, request: &ObjectRequest<'_>, upload_id: &str, part_number: u32, body: &[u8]) -> Result<String> {
        let part = i32::try_from(part_number)
            .map_err(|_| FilesonError::transport(format!("part number {} out of range", part_number)))?;
        let output = self
            .runtime
            .block_on(
                self.client
                    .upload_part()
                    .bucket(request.bucket)
                    .key(request.key)
                    .upload_id(upload_id)
                    .part_number(part)
                    .body(ByteStream::from(body.to_vec()))
                    .send(),
            )
            .map_err(|e| sdk_error("upload part of", request.key, e))?;
        trace!("Uploaded part {} of {}", part_number, request.key);
        Ok(unquote(output.e_tag()))
    }

    fn complete_multipart_upload(&self, request: &ObjectRequest<'_>, upload_id: &str, parts: &[CompletedPart]) -> Result<String> {
        let parts = parts
            .iter()
            .map(|p| {
                S3Part::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(format!("\"{}\"", p.etag))
                    .build()
            })
            .collect();
        let output = self
            .runtime
            .block_on(
                self.client
                    .complete_multipart_upload()
                    .bucket(request.bucket)
                    .key(request.key)
                    .upload_id(upload_id)
                    .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
                    .send(),
            )
            .map_err(|e| sdk_error("complete upload of", request.key, e))?;
        Ok(unquote(output.e_tag()))
    }

    fn abort_multipart_upload(&self, request: &ObjectRequest<'_>, upload_id: &str) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .abort_multipart_upload()
                    .bucket(request.bucket)
                    .key(request.key)
                    .upload_id(upload_id)
                    .send(),
            )
            .map_err(|e| sdk_error("abort upload of", request.key, e))?;
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str, sink: &mut dyn Write) -> Result<u64> {
        self.runtime.block_on(async {
            let output = match self.client.get_object().bucket(bucket).key(key).send().await {
                Ok(output) => output,
                Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => {
                    return Err(FilesonError::ObjectNotFound(key.to_string()));
                }
                Err(e) => return Err(sdk_error("get", key, e)),
            };

            let mut body = output.body;
            let mut written = 0u64;
            while let Some(chunk) = body
                .try_next()
                .await
                .map_err(|e| FilesonError::transport(format!("read {}: {}", key, DisplayErrorContext(e))))?
            {
                sink.write_all(&chunk)?;
                written += chunk.len() as u64;
            }
            Ok(written)
        })
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.runtime.block_on(async {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .into_paginator()
                .send();

            let mut objects = Vec::new();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| sdk_error("list", prefix, e))?;
                for object in page.contents() {
                    let Some(name) = object.key() else { continue };
                    objects.push(ObjectInfo {
                        name: name.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                        etag: object.e_tag().map(|t| t.trim_matches('"').to_string()),
                    });
                }
            }
            debug!("Listed {} objects under s3://{}/{}", objects.len(), bucket, prefix);
            Ok(objects)
        })
    }
}
