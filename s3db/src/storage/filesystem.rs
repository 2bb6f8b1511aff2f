//! Local-filesystem object store
//!
//! Backs `file://` connections. Object bodies live under `objects/`, user
//! metadata in JSON sidecars under `meta/` mirroring the key path. A single
//! write lock keeps conditional puts atomic within the process.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{
    content_etag, ListPage, ListRequest, Metadata, ObjectData, ObjectHead, ObjectStorage,
    ObjectSummary, PutOptions, PutResult, StorageError,
};

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    metadata: Metadata,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
pub struct FilesystemStorage {
    objects_root: PathBuf,
    meta_root: PathBuf,
    write_lock: Mutex<()>,
}

impl FilesystemStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            objects_root: root.join("objects"),
            meta_root: root.join("meta"),
            write_lock: Mutex::new(()),
        }
    }

    fn body_path(&self, key: &str) -> PathBuf {
        self.objects_root.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.meta_root.join(format!("{key}.json"))
    }

    async fn read_sidecar(&self, key: &str) -> Result<Sidecar, StorageError> {
        let raw = match tokio::fs::read(self.meta_path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NoSuchKey)
            }
            Err(e) => return Err(StorageError::Io(e)),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| StorageError::Other(format!("corrupt metadata sidecar for {key}: {e}")))
    }

    async fn write_parts(
        &self,
        key: &str,
        body: &[u8],
        sidecar: &Sidecar,
    ) -> Result<(), StorageError> {
        let body_path = self.body_path(key);
        if let Some(parent) = body_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let meta_path = self.meta_path(key);
        if let Some(parent) = meta_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&body_path, body).await?;
        let encoded = serde_json::to_vec(sidecar)
            .map_err(|e| StorageError::Other(format!("sidecar encode failed: {e}")))?;
        tokio::fs::write(&meta_path, encoded).await?;
        Ok(())
    }

    /// All keys under a prefix, sorted. Iterative walk, no recursion.
    async fn walk_keys(&self, prefix: &str) -> Result<Vec<PathBuf>, StorageError> {
        let mut stack = vec![self.objects_root.clone()];
        let mut files = Vec::new();
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else {
                    files.push(entry.path());
                }
            }
        }
        let mut keys: Vec<PathBuf> = files
            .into_iter()
            .filter(|p| {
                p.strip_prefix(&self.objects_root)
                    .map(|rel| rel.to_string_lossy().starts_with(prefix))
                    .unwrap_or(false)
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn key_of(&self, path: &Path) -> String {
        path.strip_prefix(&self.objects_root)
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStorage for FilesystemStorage {
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: Metadata,
        options: PutOptions,
    ) -> Result<PutResult, StorageError> {
        let _guard = self.write_lock.lock().await;

        let existing = self.read_sidecar(key).await;
        if options.if_none_match_any && existing.is_ok() {
            return Err(StorageError::PreconditionFailed);
        }
        if let Some(expected) = &options.if_match {
            match &existing {
                Ok(sidecar) if &sidecar.etag == expected => {}
                _ => return Err(StorageError::PreconditionFailed),
            }
        }

        let etag = content_etag(&body, &metadata);
        let sidecar = Sidecar {
            metadata,
            etag: etag.clone(),
            last_modified: Utc::now(),
        };
        self.write_parts(key, &body, &sidecar).await?;
        Ok(PutResult { etag })
    }

    async fn get(&self, key: &str) -> Result<ObjectData, StorageError> {
        let sidecar = self.read_sidecar(key).await?;
        let body = match tokio::fs::read(self.body_path(key)).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NoSuchKey)
            }
            Err(e) => return Err(StorageError::Io(e)),
        };
        Ok(ObjectData {
            content_length: body.len() as u64,
            body: Bytes::from(body),
            metadata: sidecar.metadata,
            etag: sidecar.etag,
            last_modified: Some(sidecar.last_modified),
        })
    }

    async fn head(&self, key: &str) -> Result<ObjectHead, StorageError> {
        let sidecar = self.read_sidecar(key).await?;
        let content_length = tokio::fs::metadata(self.body_path(key))
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(ObjectHead {
            metadata: sidecar.metadata,
            content_length,
            etag: sidecar.etag,
            last_modified: Some(sidecar.last_modified),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        for path in [self.body_path(key), self.meta_path(key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let data = self.get(from).await?;
        let _guard = self.write_lock.lock().await;
        let sidecar = Sidecar {
            metadata: data.metadata,
            etag: data.etag,
            last_modified: Utc::now(),
        };
        self.write_parts(to, &data.body, &sidecar).await
    }

    async fn list(&self, request: ListRequest) -> Result<ListPage, StorageError> {
        let max_keys = request.max_keys.clamp(1, 1000);
        let paths = self.walk_keys(&request.prefix).await?;

        let mut contents = Vec::new();
        let mut is_truncated = false;
        let mut next_token = None;

        for path in paths {
            let key = self.key_of(&path);
            if let Some(token) = &request.continuation_token {
                if key.as_str() <= token.as_str() {
                    continue;
                }
            }
            if contents.len() == max_keys {
                is_truncated = true;
                next_token = contents.last().map(|s: &ObjectSummary| s.key.clone());
                break;
            }
            let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            contents.push(ObjectSummary {
                key,
                size,
                etag: None,
                last_modified: None,
            });
        }

        Ok(ListPage {
            contents,
            is_truncated,
            next_continuation_token: next_token,
        })
    }
}
