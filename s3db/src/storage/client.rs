//! Pooled object-store command layer
//!
//! Wraps an [`ObjectStorage`] implementation with the behavior every caller
//! needs: a bounded in-flight pool, per-request timeout, throttle retries
//! with exponential backoff, batch helpers chunked at the S3 limit, command
//! events, and error surfacing with bucket/key context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use s3db_types::{ErrorContext, S3dbError};

use crate::events::EventBus;

use super::{
    ListPage, ListRequest, Metadata, ObjectData, ObjectHead, ObjectStorage, PutOptions, PutResult,
    StorageError,
};

const BATCH_CHUNK: usize = 1000;
const THROTTLE_MAX_RETRIES: u32 = 5;
const THROTTLE_BASE_DELAY: Duration = Duration::from_millis(100);

/// Command counters, inspected by tests and operators.
#[derive(Debug, Clone, Default)]
pub struct ClientMetrics {
    pub commands: u64,
    pub errors: u64,
    pub throttle_retries: u64,
    pub objects_put: u64,
    pub objects_deleted: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

#[derive(Clone)]
pub struct ObjectClient {
    storage: Arc<dyn ObjectStorage>,
    bucket: String,
    events: EventBus,
    pool: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    request_timeout: Duration,
    metrics: Arc<RwLock<ClientMetrics>>,
}

/// Decrements the in-flight counter when a command finishes, on every
/// exit path.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ObjectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectClient")
            .field("bucket", &self.bucket)
            .field("available_permits", &self.pool.available_permits())
            .finish()
    }
}

impl ObjectClient {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        bucket: impl Into<String>,
        events: EventBus,
        concurrency: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
            events,
            pool: Arc::new(Semaphore::new(concurrency.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            request_timeout,
            metrics: Arc::new(RwLock::new(ClientMetrics::default())),
        }
    }

    /// Number of commands currently holding a pool permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait for in-flight commands to finish. Returns false when the
    /// deadline passed with work still running.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let started = Instant::now();
        while self.in_flight() > 0 {
            if started.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Close the pool. Commands already holding a permit finish; new
    /// commands fail with a configuration error.
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> ClientMetrics {
        self.metrics.read().unwrap().clone()
    }

    fn surface(&self, err: StorageError, key: &str) -> S3dbError {
        let context = ErrorContext::object(&self.bucket, key);
        self.metrics.write().unwrap().errors += 1;
        match err {
            StorageError::NoSuchKey => S3dbError::NoSuchKey { context },
            StorageError::NoSuchBucket => S3dbError::BucketNotFound {
                bucket: self.bucket.clone(),
            },
            StorageError::AccessDenied => S3dbError::AccessDenied { context },
            StorageError::PreconditionFailed => S3dbError::Race {
                message: "conditional write lost".to_string(),
                context,
            },
            StorageError::Throttled => S3dbError::Throttled { context },
            StorageError::Timeout => S3dbError::Unknown {
                message: "object store request timed out".to_string(),
                context,
            },
            StorageError::Io(e) => S3dbError::Io(e),
            StorageError::Other(message) => S3dbError::Unknown { message, context },
        }
    }

    /// Run one storage command under the pool, with timeout, throttle
    /// retries, and command events.
    async fn command<T, F, Fut>(&self, name: &str, key: &str, run: F) -> Result<T, S3dbError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| S3dbError::Config {
                message: "object client pool is closed".to_string(),
            })?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlightGuard(&self.in_flight);

        self.events.emit(
            "command.request",
            json!({"command": name, "bucket": self.bucket, "key": key}),
        );
        self.metrics.write().unwrap().commands += 1;

        let mut attempt: u32 = 0;
        let result = loop {
            let outcome = match tokio::time::timeout(self.request_timeout, run()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StorageError::Timeout),
            };
            match outcome {
                Err(StorageError::Throttled) if attempt < THROTTLE_MAX_RETRIES => {
                    let delay = THROTTLE_BASE_DELAY * 2u32.pow(attempt);
                    attempt += 1;
                    self.metrics.write().unwrap().throttle_retries += 1;
                    warn!(command = name, key, attempt, "throttled, backing off");
                    tokio::time::sleep(delay).await;
                }
                other => break other,
            }
        };

        match result {
            Ok(value) => {
                self.events.emit(
                    "command.response",
                    json!({"command": name, "bucket": self.bucket, "key": key, "ok": true}),
                );
                self.events.emit(name, json!({"bucket": self.bucket, "key": key}));
                Ok(value)
            }
            Err(err) => {
                self.events.emit(
                    "command.response",
                    json!({"command": name, "bucket": self.bucket, "key": key, "ok": false}),
                );
                Err(self.surface(err, key))
            }
        }
    }

    pub async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: Metadata,
        options: PutOptions,
    ) -> Result<PutResult, S3dbError> {
        let size = body.len() as u64;
        let result = self
            .command("putObject", key, || {
                self.storage
                    .put(key, body.clone(), metadata.clone(), options.clone())
            })
            .await?;
        let mut metrics = self.metrics.write().unwrap();
        metrics.objects_put += 1;
        metrics.bytes_uploaded += size;
        Ok(result)
    }

    /// Conditional create. `Ok(None)` means the key already exists.
    pub async fn put_if_absent(
        &self,
        key: &str,
        body: Bytes,
        metadata: Metadata,
    ) -> Result<Option<PutResult>, S3dbError> {
        match self.put(key, body, metadata, PutOptions::if_absent()).await {
            Ok(result) => Ok(Some(result)),
            Err(S3dbError::Race { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, key: &str) -> Result<ObjectData, S3dbError> {
        let data = self
            .command("getObject", key, || self.storage.get(key))
            .await?;
        self.metrics.write().unwrap().bytes_downloaded += data.body.len() as u64;
        Ok(data)
    }

    pub async fn head(&self, key: &str) -> Result<ObjectHead, S3dbError> {
        self.command("headObject", key, || self.storage.head(key))
            .await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, S3dbError> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_missing() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), S3dbError> {
        self.command("deleteObject", key, || self.storage.delete(key))
            .await?;
        self.metrics.write().unwrap().objects_deleted += 1;
        Ok(())
    }

    pub async fn copy(&self, from: &str, to: &str) -> Result<(), S3dbError> {
        self.command("copyObject", from, || self.storage.copy(from, to))
            .await
    }

    /// Copy-then-delete. Not atomic; the copy is durable before the delete
    /// is issued.
    pub async fn move_object(&self, from: &str, to: &str) -> Result<(), S3dbError> {
        self.copy(from, to).await?;
        self.delete(from).await
    }

    pub async fn list(&self, request: ListRequest) -> Result<ListPage, S3dbError> {
        let prefix = request.prefix.clone();
        self.command("listObjects", &prefix, || self.storage.list(request.clone()))
            .await
    }

    /// Delete many keys; chunked at the S3 batch limit, parallel within the
    /// pool. Per-key outcomes, no early abort.
    pub async fn delete_batch(&self, keys: &[String]) -> Vec<(String, Result<(), S3dbError>)> {
        let mut results = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(BATCH_CHUNK) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|key| async move { (key.clone(), self.delete(key).await) })
                .collect();
            results.extend(join_all(futures).await);
        }
        results
    }

    /// Every key under a prefix, fully paged.
    pub async fn list_all_keys(&self, prefix: &str) -> Result<Vec<String>, S3dbError> {
        let mut keys = Vec::new();
        let mut request = ListRequest::prefix(prefix);
        loop {
            let page = self.list(request.clone()).await?;
            keys.extend(page.contents.into_iter().map(|s| s.key));
            if !page.is_truncated {
                break;
            }
            request.continuation_token = page.next_continuation_token;
            if request.continuation_token.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    /// Key count under a prefix without materializing bodies.
    pub async fn count_keys(&self, prefix: &str) -> Result<usize, S3dbError> {
        let mut count = 0;
        let mut request = ListRequest::prefix(prefix);
        loop {
            let page = self.list(request.clone()).await?;
            count += page.contents.len();
            if !page.is_truncated {
                break;
            }
            request.continuation_token = page.next_continuation_token;
            if request.continuation_token.is_none() {
                break;
            }
        }
        Ok(count)
    }

    /// Remove every object under a prefix. Returns the number deleted.
    pub async fn delete_all_under(&self, prefix: &str) -> Result<usize, S3dbError> {
        let keys = self.list_all_keys(prefix).await?;
        let total = keys.len();
        let results = self.delete_batch(&keys).await;
        for (key, result) in &results {
            if let Err(e) = result {
                warn!(%key, error = %e, "bulk delete failed for key");
            }
        }
        debug!(prefix, total, "deleted all objects under prefix");
        Ok(results.iter().filter(|(_, r)| r.is_ok()).count().min(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client() -> ObjectClient {
        ObjectClient::new(
            Arc::new(MemoryStorage::new()),
            "test-bucket",
            EventBus::new(),
            8,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn emits_command_events() {
        let client = client();
        let requests = Arc::new(AtomicUsize::new(0));
        let responses = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&requests);
        client.events().on("command.request", move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        let r = Arc::clone(&responses);
        client.events().on("command.response", move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        client
            .put("k", Bytes::from_static(b"x"), HashMap::new(), PutOptions::default())
            .await
            .unwrap();
        client.get("k").await.unwrap();

        assert_eq!(requests.load(Ordering::SeqCst), 2);
        assert_eq!(responses.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_key_surfaces_no_such_key_with_context() {
        let client = client();
        let err = client.get("missing").await.unwrap_err();
        match err {
            S3dbError::NoSuchKey { context } => {
                assert_eq!(context.bucket.as_deref(), Some("test-bucket"));
                assert_eq!(context.key.as_deref(), Some("missing"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn put_if_absent_reports_held() {
        let client = client();
        let first = client
            .put_if_absent("lock", Bytes::new(), HashMap::new())
            .await
            .unwrap();
        assert!(first.is_some());
        let second = client
            .put_if_absent("lock", Bytes::new(), HashMap::new())
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn paged_helpers_cover_all_keys() {
        let client = client();
        for i in 0..7 {
            client
                .put(
                    &format!("pfx/item{i}"),
                    Bytes::new(),
                    HashMap::new(),
                    PutOptions::default(),
                )
                .await
                .unwrap();
        }
        assert_eq!(client.count_keys("pfx/").await.unwrap(), 7);
        assert_eq!(client.list_all_keys("pfx/").await.unwrap().len(), 7);
        assert_eq!(client.delete_all_under("pfx/").await.unwrap(), 7);
        assert_eq!(client.count_keys("pfx/").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_rejects_new_commands() {
        let client = client();
        client
            .put("k", Bytes::from_static(b"x"), HashMap::new(), PutOptions::default())
            .await
            .unwrap();

        assert!(client.drain(Duration::from_millis(100)).await);
        client.close();

        let err = client.get("k").await.unwrap_err();
        assert_eq!(err.code(), "ConfigError");
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn delete_batch_reports_per_key() {
        let client = client();
        client
            .put("a", Bytes::new(), HashMap::new(), PutOptions::default())
            .await
            .unwrap();
        let results = client
            .delete_batch(&["a".to_string(), "b".to_string()])
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }
}
