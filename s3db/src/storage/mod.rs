//! Object storage abstraction
//!
//! Everything the engine persists goes through [`ObjectStorage`]. Three
//! implementations exist: the real S3 client, an in-process memory store
//! for tests, and a local-filesystem store.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod client;
pub mod filesystem;
pub mod memory;
pub mod s3;

pub use client::{ClientMetrics, ObjectClient};
pub use filesystem::FilesystemStorage;
pub use memory::MemoryStorage;
pub use s3::S3Storage;

/// User-defined object metadata (header name to header value).
pub type Metadata = HashMap<String, String>;

/// Options for a `put`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Conditional write: only succeed if the current etag matches.
    pub if_match: Option<String>,
    /// Conditional create: only succeed if the key does not exist.
    pub if_none_match_any: bool,
}

impl PutOptions {
    pub fn if_absent() -> Self {
        Self {
            if_none_match_any: true,
            ..Default::default()
        }
    }

    pub fn if_matches(etag: impl Into<String>) -> Self {
        Self {
            if_match: Some(etag.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub etag: String,
}

/// Result of a `head`.
#[derive(Debug, Clone)]
pub struct ObjectHead {
    pub metadata: Metadata,
    pub content_length: u64,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Result of a `get`.
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub body: Bytes,
    pub metadata: Metadata,
    pub content_length: u64,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectData {
    pub fn head(&self) -> ObjectHead {
        ObjectHead {
            metadata: self.metadata.clone(),
            content_length: self.content_length,
            etag: self.etag.clone(),
            last_modified: self.last_modified,
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub prefix: String,
    pub continuation_token: Option<String>,
    pub max_keys: usize,
}

impl ListRequest {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            continuation_token: None,
            max_keys: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub contents: Vec<ObjectSummary>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// Deterministic etag over body bytes and metadata, used by the local
/// storage implementations.
pub(crate) fn content_etag(body: &[u8], metadata: &Metadata) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(body);
    let mut pairs: Vec<_> = metadata.iter().collect();
    pairs.sort();
    for (k, v) in pairs {
        hasher.update(k.as_bytes());
        hasher.update([0u8]);
        hasher.update(v.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Errors produced by storage implementations, before context is attached.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no such key")]
    NoSuchKey,
    #[error("no such bucket")]
    NoSuchBucket,
    #[error("access denied")]
    AccessDenied,
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("throttled")]
    Throttled,
    #[error("request timed out")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn is_missing(&self) -> bool {
        matches!(self, StorageError::NoSuchKey)
    }
}

/// Uniform interface over the object store.
#[async_trait]
pub trait ObjectStorage: Send + Sync + std::fmt::Debug {
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: Metadata,
        options: PutOptions,
    ) -> Result<PutResult, StorageError>;

    async fn get(&self, key: &str) -> Result<ObjectData, StorageError>;

    async fn head(&self, key: &str) -> Result<ObjectHead, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError>;

    async fn list(&self, request: ListRequest) -> Result<ListPage, StorageError>;
}
