//! S3-API object store
//!
//! Real client for `s3://` and `http(s)://` connections. Works against AWS
//! S3 and any compatible endpoint (MinIO, Ceph RGW) via `endpoint` +
//! `forcePathStyle`.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials as SdkCredentials;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::debug;

use crate::config::Credentials;

use super::{
    ListPage, ListRequest, Metadata, ObjectData, ObjectHead, ObjectStorage, ObjectSummary,
    PutOptions, PutResult, StorageError,
};

// copy sources are URL-path encoded; keep `/` as the separator
const COPY_SOURCE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'=')
    .add(b'&')
    .add(b'+');

pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl S3Storage {
    /// Build a client for the given bucket. Explicit credentials win over
    /// the ambient provider chain.
    pub async fn new(
        bucket: impl Into<String>,
        endpoint: Option<String>,
        region: Option<String>,
        force_path_style: bool,
        credentials: Option<Credentials>,
    ) -> Self {
        let base = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&base);

        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if let Some(region) = region {
            builder = builder.region(Region::new(region));
        }
        if let Some(creds) = credentials {
            builder = builder.credentials_provider(SdkCredentials::new(
                creds.access_key,
                creds.secret_key,
                None,
                None,
                "s3db-connection-string",
            ));
        }
        builder = builder.force_path_style(force_path_style);

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: bucket.into(),
        }
    }

    fn convert_time(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> Option<DateTime<Utc>> {
        dt.and_then(|d| d.to_millis().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }
}

fn map_sdk_error<E>(err: SdkError<E>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if matches!(err, SdkError::TimeoutError(_)) {
        return StorageError::Timeout;
    }
    match err.code() {
        Some("NoSuchKey") | Some("NotFound") => StorageError::NoSuchKey,
        Some("NoSuchBucket") => StorageError::NoSuchBucket,
        Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch") => {
            StorageError::AccessDenied
        }
        Some("PreconditionFailed") | Some("ConditionalRequestConflict") => {
            StorageError::PreconditionFailed
        }
        Some("SlowDown") | Some("Throttling") | Some("ThrottlingException")
        | Some("RequestLimitExceeded") | Some("TooManyRequests") => StorageError::Throttled,
        _ => StorageError::Other(format!("{err}")),
    }
}

fn clean_etag(etag: Option<&str>) -> String {
    etag.unwrap_or_default().trim_matches('"').to_string()
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: Metadata,
        options: PutOptions,
    ) -> Result<PutResult, StorageError> {
        let content_length = body.len() as i64;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(content_length)
            .body(ByteStream::from(body));
        if !metadata.is_empty() {
            request = request.set_metadata(Some(metadata));
        }
        if let Some(content_type) = options.content_type {
            request = request.content_type(content_type);
        }
        if let Some(content_encoding) = options.content_encoding {
            request = request.content_encoding(content_encoding);
        }
        if let Some(etag) = options.if_match {
            request = request.if_match(format!("\"{etag}\""));
        }
        if options.if_none_match_any {
            request = request.if_none_match("*");
        }

        debug!(bucket = %self.bucket, key, "put_object: sending upstream request");
        let output = request.send().await.map_err(map_sdk_error)?;
        Ok(PutResult {
            etag: clean_etag(output.e_tag()),
        })
    }

    async fn get(&self, key: &str) -> Result<ObjectData, StorageError> {
        debug!(bucket = %self.bucket, key, "get_object: sending upstream request");
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|s| s.is_no_such_key()) == Some(true) {
                    StorageError::NoSuchKey
                } else {
                    map_sdk_error(e)
                }
            })?;

        let metadata = output.metadata().cloned().unwrap_or_default();
        let etag = clean_etag(output.e_tag());
        let last_modified = Self::convert_time(output.last_modified());
        let content_length = output.content_length().unwrap_or_default().max(0) as u64;
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Other(format!("body read failed: {e}")))?
            .into_bytes();

        Ok(ObjectData {
            content_length: if content_length > 0 {
                content_length
            } else {
                body.len() as u64
            },
            body,
            metadata,
            etag,
            last_modified,
        })
    }

    async fn head(&self, key: &str) -> Result<ObjectHead, StorageError> {
        debug!(bucket = %self.bucket, key, "head_object: sending upstream request");
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|s| s.is_not_found()) == Some(true) {
                    StorageError::NoSuchKey
                } else {
                    map_sdk_error(e)
                }
            })?;

        Ok(ObjectHead {
            metadata: output.metadata().cloned().unwrap_or_default(),
            content_length: output.content_length().unwrap_or_default().max(0) as u64,
            etag: clean_etag(output.e_tag()),
            last_modified: Self::convert_time(output.last_modified()),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        debug!(bucket = %self.bucket, key, "delete_object: sending upstream request");
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = format!(
            "{}/{}",
            self.bucket,
            utf8_percent_encode(from, COPY_SOURCE_SET)
        );
        debug!(bucket = %self.bucket, from, to, "copy_object: sending upstream request");
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(source)
            .key(to)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn list(&self, request: ListRequest) -> Result<ListPage, StorageError> {
        let max_keys = request.max_keys.clamp(1, 1000) as i32;
        debug!(bucket = %self.bucket, prefix = %request.prefix, "list_objects_v2: sending upstream request");
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&request.prefix)
            .max_keys(max_keys)
            .set_continuation_token(request.continuation_token)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let contents = output
            .contents()
            .iter()
            .filter_map(|obj| {
                Some(ObjectSummary {
                    key: obj.key()?.to_string(),
                    size: obj.size().unwrap_or_default().max(0) as u64,
                    etag: obj.e_tag().map(|e| e.trim_matches('"').to_string()),
                    last_modified: Self::convert_time(obj.last_modified()),
                })
            })
            .collect();

        Ok(ListPage {
            contents,
            is_truncated: output.is_truncated().unwrap_or(false),
            next_continuation_token: output.next_continuation_token().map(str::to_string),
        })
    }
}
