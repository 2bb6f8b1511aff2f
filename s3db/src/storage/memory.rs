//! In-process object store
//!
//! Backs `memory://` connections. All mutations happen under one lock, so
//! conditional puts are atomic, which the root-rewrite and lock paths rely
//! on in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    content_etag, ListPage, ListRequest, Metadata, ObjectData, ObjectHead, ObjectStorage,
    ObjectSummary, PutOptions, PutResult, StorageError,
};

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    metadata: Metadata,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: Metadata,
        options: PutOptions,
    ) -> Result<PutResult, StorageError> {
        let mut objects = self.objects.lock().await;

        if options.if_none_match_any && objects.contains_key(key) {
            return Err(StorageError::PreconditionFailed);
        }
        if let Some(expected) = &options.if_match {
            match objects.get(key) {
                Some(existing) if &existing.etag == expected => {}
                _ => return Err(StorageError::PreconditionFailed),
            }
        }

        let etag = content_etag(&body, &metadata);
        objects.insert(
            key.to_string(),
            StoredObject {
                body,
                metadata,
                etag: etag.clone(),
                last_modified: Utc::now(),
            },
        );
        Ok(PutResult { etag })
    }

    async fn get(&self, key: &str) -> Result<ObjectData, StorageError> {
        let objects = self.objects.lock().await;
        let stored = objects.get(key).ok_or(StorageError::NoSuchKey)?;
        Ok(ObjectData {
            body: stored.body.clone(),
            metadata: stored.metadata.clone(),
            content_length: stored.body.len() as u64,
            etag: stored.etag.clone(),
            last_modified: Some(stored.last_modified),
        })
    }

    async fn head(&self, key: &str) -> Result<ObjectHead, StorageError> {
        let objects = self.objects.lock().await;
        let stored = objects.get(key).ok_or(StorageError::NoSuchKey)?;
        Ok(ObjectHead {
            metadata: stored.metadata.clone(),
            content_length: stored.body.len() as u64,
            etag: stored.etag.clone(),
            last_modified: Some(stored.last_modified),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        // deleting a missing key is a no-op, as on S3
        self.objects.lock().await.remove(key);
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let mut objects = self.objects.lock().await;
        let source = objects.get(from).cloned().ok_or(StorageError::NoSuchKey)?;
        objects.insert(to.to_string(), source);
        Ok(())
    }

    async fn list(&self, request: ListRequest) -> Result<ListPage, StorageError> {
        let objects = self.objects.lock().await;
        let max_keys = request.max_keys.clamp(1, 1000);

        let mut contents = Vec::new();
        let mut is_truncated = false;
        let mut next_token = None;

        for (key, stored) in objects.range(request.prefix.clone()..) {
            if !key.starts_with(&request.prefix) {
                break;
            }
            if let Some(token) = &request.continuation_token {
                if key <= token {
                    continue;
                }
            }
            if contents.len() == max_keys {
                is_truncated = true;
                next_token = contents.last().map(|s: &ObjectSummary| s.key.clone());
                break;
            }
            contents.push(ObjectSummary {
                key: key.clone(),
                size: stored.body.len() as u64,
                etag: Some(stored.etag.clone()),
                last_modified: Some(stored.last_modified),
            });
        }

        Ok(ListPage {
            contents,
            is_truncated,
            next_continuation_token: next_token,
        })
    }
}
