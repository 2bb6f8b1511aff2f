//! Resource runtime
//!
//! A resource is a typed collection. It owns the write path (validate,
//! hooks, encrypt, pack, put, index) and the read path (head/get, decode,
//! decrypt, hooks), plus batch, listing, counting and query operations.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use s3db_types::{deep_merge, shallow_merge, Document, ErrorContext, S3dbError};

use crate::behavior::{Behavior, OVERFLOW_HEADER, TRUNCATED_HEADER};
use crate::events::EventBus;
use crate::hooks::{generated_bindings, run_pipeline, HookBinding, HookEvent, HookRegistry};
use crate::metadata::MetadataCodec;
use crate::partition::{
    self, current_entries, diff_entries, owner_key, owner_prefix, partition_prefix,
    PartitionDefinition,
};
use crate::query;
use crate::schema::Schema;
use crate::storage::{Metadata, ObjectClient, PutOptions};

/// Reserved metadata header keys managed by the runtime.
pub const VERSION_HEADER: &str = "_v";
pub const PARTITION_SET_HEADER: &str = "_ps";
pub const CREATED_AT_HEADER: &str = "_ca";
pub const UPDATED_AT_HEADER: &str = "_ua";
pub const DELETED_AT_HEADER: &str = "_da";
/// Consolidation fence (see the eventual-consistency plugin): written in
/// the same put as the aggregated value so recovery can tell which
/// transactions are already folded in.
pub const PENDING_VERSION_HEADER: &str = "_pv";

/// Persisted description of one schema version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub version: u32,
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary: Option<crate::encoding::dictionary::Dictionary>,
}

impl SchemaRecord {
    pub fn compile(&self) -> Result<Schema, S3dbError> {
        let schema = Schema::compile(self.version, self.attributes.clone())?;
        Ok(match &self.dictionary {
            Some(dictionary) => schema.with_dictionary(dictionary.clone()),
            None => schema,
        })
    }
}

/// Persisted resource definition, as written into `s3db.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub name: String,
    #[serde(default)]
    pub behavior: Behavior,
    #[serde(default)]
    pub timestamps: bool,
    #[serde(default)]
    pub paranoid: bool,
    #[serde(default)]
    pub async_partitions: bool,
    #[serde(default)]
    pub partitions: Vec<PartitionDefinition>,
    #[serde(default)]
    pub hooks: Vec<HookBinding>,
    pub schemas: Vec<SchemaRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<String>,
}

/// Options for list/count/query scoping.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    pub partition: Option<String>,
    pub partition_values: Option<Document>,
    pub include_deleted: bool,
}

/// Per-item outcome of a batch operation.
#[derive(Debug)]
pub struct BatchOutcome {
    pub ok: bool,
    pub err: Option<S3dbError>,
    pub data: Option<Document>,
}

impl BatchOutcome {
    fn success(data: Document) -> Self {
        Self {
            ok: true,
            err: None,
            data: Some(data),
        }
    }

    fn failure(err: S3dbError) -> Self {
        Self {
            ok: false,
            err: Some(err),
            data: None,
        }
    }
}

struct RawRecord {
    stored: Document,
    meta: Metadata,
}

struct ResourceInner {
    name: String,
    behavior: Behavior,
    timestamps: bool,
    paranoid: bool,
    async_partitions: bool,
    partitions: Vec<PartitionDefinition>,
    // append-only; last entry is the writing schema
    schemas: RwLock<Vec<Arc<Schema>>>,
    user_hooks: RwLock<Vec<HookBinding>>,
    generated_hooks: RwLock<Vec<HookBinding>>,
    registry: HookRegistry,
    client: ObjectClient,
    codec: MetadataCodec,
    prefix: String,
    events: EventBus,
}

/// Handle to a typed collection. Cheap to clone.
#[derive(Clone)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.inner.name)
            .field("behavior", &self.inner.behavior.as_str())
            .finish()
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn header_size(meta: &Metadata) -> usize {
    meta.iter().map(|(k, v)| k.len() + v.len() + 2).sum()
}

impl Resource {
    pub fn from_definition(
        definition: &ResourceDefinition,
        client: ObjectClient,
        codec: MetadataCodec,
        registry: HookRegistry,
        prefix: String,
        events: EventBus,
    ) -> Result<Self, S3dbError> {
        if definition.schemas.is_empty() {
            return Err(S3dbError::Config {
                message: format!("resource '{}' has no schema versions", definition.name),
            });
        }
        let mut schemas = Vec::with_capacity(definition.schemas.len());
        for record in &definition.schemas {
            schemas.push(Arc::new(record.compile()?));
        }
        // fail fast on hook names the registry does not know
        for binding in &definition.hooks {
            registry.resolve(&binding.name)?;
        }
        let generated = generated_bindings(schemas.last().unwrap());

        Ok(Self {
            inner: Arc::new(ResourceInner {
                name: definition.name.clone(),
                behavior: definition.behavior,
                timestamps: definition.timestamps,
                paranoid: definition.paranoid,
                async_partitions: definition.async_partitions,
                partitions: definition.partitions.clone(),
                schemas: RwLock::new(schemas),
                user_hooks: RwLock::new(definition.hooks.clone()),
                generated_hooks: RwLock::new(generated),
                registry,
                client,
                codec,
                prefix,
                events,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn behavior(&self) -> Behavior {
        self.inner.behavior
    }

    pub fn partitions(&self) -> &[PartitionDefinition] {
        &self.inner.partitions
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// The schema that writes new records.
    pub fn current_schema(&self) -> Arc<Schema> {
        self.inner.schemas.read().unwrap().last().unwrap().clone()
    }

    /// Append a new schema version; existing records keep decoding with
    /// the version embedded in their metadata.
    pub fn push_schema(&self, schema: Schema) {
        let schema = Arc::new(schema);
        *self.inner.generated_hooks.write().unwrap() = generated_bindings(&schema);
        self.inner.schemas.write().unwrap().push(schema);
    }

    fn schema_for_tag(&self, tag: Option<&String>) -> Result<Arc<Schema>, S3dbError> {
        let schemas = self.inner.schemas.read().unwrap();
        match tag {
            None => Ok(schemas.last().unwrap().clone()),
            Some(tag) => {
                let version: u32 = tag
                    .strip_prefix('v')
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(|| S3dbError::Unknown {
                        message: format!("invalid schema version tag: {tag}"),
                        context: ErrorContext::resource(&self.inner.name),
                    })?;
                schemas
                    .iter()
                    .find(|s| s.version == version)
                    .cloned()
                    .ok_or_else(|| S3dbError::Unknown {
                        message: format!("no schema with version {version}"),
                        context: ErrorContext::resource(&self.inner.name),
                    })
            }
        }
    }

    fn full_key(&self, relative: &str) -> String {
        if self.inner.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.inner.prefix, relative)
        }
    }

    fn owner_object_key(&self, id: &str) -> String {
        self.full_key(&owner_key(&self.inner.name, id))
    }

    fn validate(&self, schema: &Schema, document: &Document) -> Result<Document, S3dbError> {
        schema.validate(document).map_err(|issues| S3dbError::Validation {
            resource: self.inner.name.clone(),
            issues,
        })
    }

    async fn run_user(&self, event: HookEvent, data: Document) -> Result<Document, S3dbError> {
        let bindings = self.inner.user_hooks.read().unwrap().clone();
        run_pipeline(&self.inner.registry, &bindings, event, data).await
    }

    async fn run_generated(&self, event: HookEvent, data: Document) -> Result<Document, S3dbError> {
        let bindings = self.inner.generated_hooks.read().unwrap().clone();
        run_pipeline(&self.inner.registry, &bindings, event, data).await
    }

    fn emit(&self, name: &str, payload: Value) {
        self.inner.events.emit(name, payload);
    }

    fn emit_error(&self, operation: &str, err: &S3dbError, id: Option<&str>) {
        self.inner.events.emit(
            "error",
            json!({
                "resource": self.inner.name,
                "operation": operation,
                "id": id,
                "code": err.code(),
                "message": err.to_string(),
            }),
        );
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Persist `logical` (plaintext, validated) at `id`, reconciling
    /// partition entries against `previous_entries`.
    async fn persist(
        &self,
        id: &str,
        logical: &Document,
        previous_entries: BTreeMap<String, String>,
        before_event: HookEvent,
        created_at: Option<String>,
        deleted_at: Option<String>,
    ) -> Result<(), S3dbError> {
        let schema = self.current_schema();
        let stored = self.run_generated(before_event, logical.clone()).await?;

        let entries = current_entries(&self.inner.partitions, logical);
        let entries_json = serde_json::to_string(&entries).unwrap_or_default();

        // reserved headers are part of the byte budget
        let mut reserved = Metadata::new();
        reserved.insert(VERSION_HEADER.to_string(), schema.version_tag());
        if !entries.is_empty() {
            reserved.insert(PARTITION_SET_HEADER.to_string(), entries_json.clone());
        }
        if self.inner.timestamps {
            if let Some(created) = &created_at {
                reserved.insert(CREATED_AT_HEADER.to_string(), created.clone());
            }
            let updated = logical
                .get("updatedAt")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(now_iso);
            reserved.insert(UPDATED_AT_HEADER.to_string(), updated);
        }
        if let Some(deleted) = &deleted_at {
            reserved.insert(DELETED_AT_HEADER.to_string(), deleted.clone());
        }
        if let Some(pending) = logical.get("pendingVersion") {
            if !pending.is_null() {
                reserved.insert(
                    PENDING_VERSION_HEADER.to_string(),
                    serde_json::to_string(pending).unwrap_or_default(),
                );
            }
        }

        let plan = self.inner.behavior.pack(
            &self.inner.codec,
            &schema,
            &stored,
            header_size(&reserved) + 16,
            &self.inner.name,
        )?;

        let mut meta = plan.meta;
        meta.extend(reserved);
        if plan.truncated {
            meta.insert(TRUNCATED_HEADER.to_string(), "1".to_string());
        }
        if plan.overflow_count > 0 {
            meta.insert(OVERFLOW_HEADER.to_string(), plan.overflow_count.to_string());
        }

        let options = PutOptions {
            content_type: Some("application/json".to_string()),
            ..Default::default()
        };
        self.inner
            .client
            .put(&self.owner_object_key(id), plan.body, meta, options)
            .await?;

        self.reconcile_entries(id, previous_entries, entries).await
    }

    async fn reconcile_entries(
        &self,
        id: &str,
        previous: BTreeMap<String, String>,
        current: BTreeMap<String, String>,
    ) -> Result<(), S3dbError> {
        let (added, removed) = diff_entries(&previous, &current);
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }

        if self.inner.async_partitions {
            let resource = self.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                if let Err(e) = resource.apply_entry_diff(&id, &added, &removed).await {
                    warn!(resource = %resource.inner.name, %id, error = %e, "async partition reconciliation failed");
                    resource.emit(
                        "partition.drift",
                        json!({
                            "resource": resource.inner.name,
                            "id": id,
                            "error": e.to_string(),
                        }),
                    );
                }
            });
            Ok(())
        } else {
            self.apply_entry_diff(id, &added, &removed).await
        }
    }

    async fn apply_entry_diff(
        &self,
        id: &str,
        added: &[(String, String)],
        removed: &[(String, String)],
    ) -> Result<(), S3dbError> {
        for (name, suffix) in added {
            let key = self.full_key(&format!(
                "{}{}/id={}",
                partition_prefix(&self.inner.name, name),
                suffix,
                partition::escape(id)
            ));
            self.inner
                .client
                .put(&key, Bytes::new(), Metadata::new(), PutOptions::default())
                .await?;
        }
        for (name, suffix) in removed {
            let key = self.full_key(&format!(
                "{}{}/id={}",
                partition_prefix(&self.inner.name, name),
                suffix,
                partition::escape(id)
            ));
            self.inner.client.delete(&key).await?;
        }
        Ok(())
    }

    /// Insert a new record. Missing `id` gets a UUID v4.
    pub async fn insert(&self, data: Document) -> Result<Document, S3dbError> {
        let result = self.insert_inner(data).await;
        if let Err(e) = &result {
            self.emit_error("insert", e, None);
        }
        result
    }

    async fn insert_inner(&self, mut data: Document) -> Result<Document, S3dbError> {
        let id = match data.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        data.insert("id".to_string(), Value::String(id.clone()));

        let schema = self.current_schema();
        let validated = self.validate(&schema, &data)?;
        let mut logical = self.run_user(HookEvent::BeforeInsert, validated).await?;
        logical.insert("id".to_string(), Value::String(id.clone()));

        let created_at = if self.inner.timestamps {
            let now = now_iso();
            logical.insert("createdAt".to_string(), Value::String(now.clone()));
            logical.insert("updatedAt".to_string(), Value::String(now.clone()));
            Some(now)
        } else {
            None
        };

        self.persist(
            &id,
            &logical,
            BTreeMap::new(),
            HookEvent::BeforeInsert,
            created_at,
            None,
        )
        .await?;

        debug!(resource = %self.inner.name, %id, "inserted record");
        self.emit("insert", json!({"resource": self.inner.name, "id": id}));
        let result = self.run_user(HookEvent::AfterInsert, logical).await?;
        Ok(result)
    }

    /// Parallel insert; per-item outcomes, not a transaction.
    pub async fn insert_many(&self, items: Vec<Document>) -> Vec<BatchOutcome> {
        let futures: Vec<_> = items
            .into_iter()
            .map(|item| async move {
                match self.insert(item).await {
                    Ok(data) => BatchOutcome::success(data),
                    Err(e) => BatchOutcome::failure(e),
                }
            })
            .collect();
        join_all(futures).await
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    async fn fetch_raw(&self, id: &str) -> Result<RawRecord, S3dbError> {
        let key = self.owner_object_key(id);
        let head = self.inner.client.head(&key).await.map_err(|e| {
            if e.is_missing() {
                S3dbError::NoSuchKey {
                    context: ErrorContext::record(&self.inner.name, id)
                        .with_key(key.clone()),
                }
            } else {
                e
            }
        })?;

        let schema = self.schema_for_tag(head.metadata.get(VERSION_HEADER))?;
        let (meta, body) = if self.inner.behavior.needs_body(&head.metadata) {
            let data = self.inner.client.get(&key).await?;
            (data.metadata, Some(data.body))
        } else {
            (head.metadata, None)
        };

        let stored = self.inner.behavior.unpack(
            &self.inner.codec,
            &schema,
            &meta,
            body.as_deref(),
            &self.inner.name,
        )?;

        Ok(RawRecord { stored, meta })
    }

    fn decorate(&self, mut document: Document, id: &str, meta: &Metadata) -> Document {
        document.insert("id".to_string(), Value::String(id.to_string()));
        for (header, field) in [
            (CREATED_AT_HEADER, "createdAt"),
            (UPDATED_AT_HEADER, "updatedAt"),
            (DELETED_AT_HEADER, "deletedAt"),
        ] {
            if let Some(value) = meta.get(header) {
                document.insert(field.to_string(), Value::String(value.clone()));
            }
        }
        if let Some(raw) = meta.get(PENDING_VERSION_HEADER) {
            if let Ok(value) = serde_json::from_str::<Value>(raw) {
                document.insert("pendingVersion".to_string(), value);
            }
        }
        document
    }

    fn is_soft_deleted(meta: &Metadata) -> bool {
        meta.contains_key(DELETED_AT_HEADER)
    }

    /// Fetch one record by id.
    pub async fn get(&self, id: &str) -> Result<Document, S3dbError> {
        self.get_with(id, false).await
    }

    /// Fetch one record, optionally including soft-deleted ones.
    pub async fn get_with(&self, id: &str, include_deleted: bool) -> Result<Document, S3dbError> {
        let result = self.get_inner(id, include_deleted).await;
        if let Err(e) = &result {
            if !e.is_missing() {
                self.emit_error("get", e, Some(id));
            }
        }
        result
    }

    async fn get_inner(&self, id: &str, include_deleted: bool) -> Result<Document, S3dbError> {
        let raw = self.fetch_raw(id).await?;
        if self.inner.paranoid && !include_deleted && Self::is_soft_deleted(&raw.meta) {
            return Err(S3dbError::NoSuchKey {
                context: ErrorContext::record(&self.inner.name, id),
            });
        }
        let logical = self.run_generated(HookEvent::AfterGet, raw.stored).await?;
        let result = self.run_user(HookEvent::AfterGet, logical).await?;
        let result = self.decorate(result, id, &raw.meta);
        self.emit("get", json!({"resource": self.inner.name, "id": id}));
        Ok(result)
    }

    /// Parallel get.
    pub async fn get_many(&self, ids: &[String]) -> Vec<BatchOutcome> {
        let futures: Vec<_> = ids
            .iter()
            .map(|id| async move {
                match self.get(id).await {
                    Ok(data) => BatchOutcome::success(data),
                    Err(e) => BatchOutcome::failure(e),
                }
            })
            .collect();
        join_all(futures).await
    }

    pub async fn exists(&self, id: &str) -> Result<bool, S3dbError> {
        self.inner.client.exists(&self.owner_object_key(id)).await
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    async fn mutate(
        &self,
        id: &str,
        data: Document,
        deep: bool,
        replace_whole: bool,
    ) -> Result<Document, S3dbError> {
        // previous state: logical record for merging, meta for the
        // partition set and timestamps
        let (mut base, previous_meta) = if replace_whole {
            match self.fetch_raw(id).await {
                Ok(raw) => (Document::new(), Some(raw.meta)),
                Err(e) if e.is_missing() => (Document::new(), None),
                Err(e) => return Err(e),
            }
        } else {
            let raw = self.fetch_raw(id).await?;
            if self.inner.paranoid && Self::is_soft_deleted(&raw.meta) {
                return Err(S3dbError::NoSuchKey {
                    context: ErrorContext::record(&self.inner.name, id),
                });
            }
            let logical = self.run_generated(HookEvent::AfterGet, raw.stored.clone()).await?;
            (logical, Some(raw.meta))
        };

        if replace_whole {
            base = data;
        } else if deep {
            deep_merge(&mut base, data);
        } else {
            shallow_merge(&mut base, data);
        }
        base.insert("id".to_string(), Value::String(id.to_string()));
        base.remove("createdAt");
        base.remove("updatedAt");
        base.remove("deletedAt");
        // the consolidation fence survives unrelated writes
        if !base.contains_key("pendingVersion") {
            if let Some(raw) = previous_meta
                .as_ref()
                .and_then(|m| m.get(PENDING_VERSION_HEADER))
            {
                if let Ok(value) = serde_json::from_str::<Value>(raw) {
                    base.insert("pendingVersion".to_string(), value);
                }
            }
        }

        let schema = self.current_schema();
        let validated = self.validate(&schema, &base)?;
        let mut logical = self.run_user(HookEvent::BeforeUpdate, validated).await?;
        logical.insert("id".to_string(), Value::String(id.to_string()));

        let created_at = previous_meta
            .as_ref()
            .and_then(|m| m.get(CREATED_AT_HEADER).cloned())
            .or_else(|| self.inner.timestamps.then(now_iso));
        let deleted_at = previous_meta
            .as_ref()
            .and_then(|m| m.get(DELETED_AT_HEADER).cloned());
        let previous_entries: BTreeMap<String, String> = previous_meta
            .as_ref()
            .and_then(|m| m.get(PARTITION_SET_HEADER))
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();

        if self.inner.timestamps {
            if let Some(created) = &created_at {
                logical.insert("createdAt".to_string(), Value::String(created.clone()));
            }
            logical.insert("updatedAt".to_string(), Value::String(now_iso()));
        }

        self.persist(
            id,
            &logical,
            previous_entries,
            HookEvent::BeforeUpdate,
            created_at,
            deleted_at,
        )
        .await?;

        self.emit("update", json!({"resource": self.inner.name, "id": id}));
        let result = self.run_user(HookEvent::AfterUpdate, logical).await?;
        Ok(result)
    }

    /// Deep-merge `data` into the record and re-persist.
    pub async fn update(&self, id: &str, data: Document) -> Result<Document, S3dbError> {
        let result = self.mutate(id, data, true, false).await;
        if let Err(e) = &result {
            self.emit_error("update", e, Some(id));
        }
        result
    }

    /// Shallow-merge `data` into the record and re-persist.
    pub async fn patch(&self, id: &str, data: Document) -> Result<Document, S3dbError> {
        let result = self.mutate(id, data, false, false).await;
        if let Err(e) = &result {
            self.emit_error("patch", e, Some(id));
        }
        result
    }

    /// Replace the record wholesale with a full, valid document.
    pub async fn replace(&self, id: &str, data: Document) -> Result<Document, S3dbError> {
        let result = self.mutate(id, data, false, true).await;
        if let Err(e) = &result {
            self.emit_error("replace", e, Some(id));
        }
        result
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Soft delete when paranoid, hard delete otherwise.
    pub async fn delete(&self, id: &str) -> Result<(), S3dbError> {
        let result = self.delete_inner(id).await;
        if let Err(e) = &result {
            self.emit_error("delete", e, Some(id));
        }
        result
    }

    async fn delete_inner(&self, id: &str) -> Result<(), S3dbError> {
        if self.inner.paranoid {
            let raw = match self.fetch_raw(id).await {
                Ok(raw) => raw,
                // repeated paranoid delete is a no-op
                Err(e) if e.is_missing() => return Ok(()),
                Err(e) => return Err(e),
            };
            if Self::is_soft_deleted(&raw.meta) {
                return Ok(());
            }
            let logical = self.run_generated(HookEvent::AfterGet, raw.stored).await?;
            let logical = self.run_user(HookEvent::BeforeDelete, logical).await?;
            let previous_entries: BTreeMap<String, String> = raw
                .meta
                .get(PARTITION_SET_HEADER)
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default();
            let created_at = raw.meta.get(CREATED_AT_HEADER).cloned();
            // partition entries of soft-deleted records are retained
            self.persist(
                id,
                &logical,
                previous_entries,
                HookEvent::BeforeUpdate,
                created_at,
                Some(now_iso()),
            )
            .await?;
        } else {
            let raw = self.fetch_raw(id).await?;
            let logical = self.run_generated(HookEvent::AfterGet, raw.stored).await?;
            let logical = self.run_user(HookEvent::BeforeDelete, logical).await?;
            let entries: BTreeMap<String, String> = raw
                .meta
                .get(PARTITION_SET_HEADER)
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default();
            self.inner.client.delete(&self.owner_object_key(id)).await?;
            let removed: Vec<(String, String)> = entries.into_iter().collect();
            self.apply_entry_diff(id, &[], &removed).await?;
            let _ = self.run_user(HookEvent::AfterDelete, logical).await?;
        }
        self.emit("delete", json!({"resource": self.inner.name, "id": id}));
        Ok(())
    }

    /// Parallel delete with batched partition removal.
    pub async fn delete_many(&self, ids: &[String]) -> Vec<BatchOutcome> {
        let futures: Vec<_> = ids
            .iter()
            .map(|id| async move {
                match self.delete(id).await {
                    Ok(()) => BatchOutcome::success(Document::new()),
                    Err(e) => BatchOutcome::failure(e),
                }
            })
            .collect();
        join_all(futures).await
    }

    /// Bulk prefix delete. Requires an explicit confirmation flag.
    pub async fn delete_all(&self, confirm: bool) -> Result<usize, S3dbError> {
        if !confirm {
            return Err(S3dbError::Config {
                message: "delete_all requires confirm=true".to_string(),
            });
        }
        let prefix = self.full_key(&format!("resource={}/", partition::escape(&self.inner.name)));
        self.inner.client.delete_all_under(&prefix).await
    }

    // ------------------------------------------------------------------
    // Listing and counting
    // ------------------------------------------------------------------

    fn scope_prefix(&self, options: &ListOptions) -> Result<String, S3dbError> {
        match &options.partition {
            None => Ok(self.full_key(&owner_prefix(&self.inner.name))),
            Some(name) => {
                let definition = self
                    .inner
                    .partitions
                    .iter()
                    .find(|p| &p.name == name)
                    .ok_or_else(|| S3dbError::Config {
                        message: format!(
                            "resource '{}' has no partition '{name}'",
                            self.inner.name
                        ),
                    })?;
                let values = options.partition_values.clone().unwrap_or_default();
                Ok(self.full_key(&definition.values_prefix(&self.inner.name, &values)))
            }
        }
    }

    /// Key-only listing of record ids.
    pub async fn list_ids(&self, options: &ListOptions) -> Result<Vec<String>, S3dbError> {
        let prefix = self.scope_prefix(options)?;
        let keys = self.inner.client.list_all_keys(&prefix).await?;
        let ids = keys
            .iter()
            .filter_map(|k| partition::id_from_key(k))
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(ids)
    }

    /// Resolve keys to full records. Soft-deleted and vanished records are
    /// skipped, not errors.
    pub async fn list(&self, options: &ListOptions) -> Result<Vec<Document>, S3dbError> {
        let ids = self.list_ids(options).await?;
        let futures: Vec<_> = ids
            .iter()
            .map(|id| self.get_with(id, options.include_deleted))
            .collect();
        let mut records = Vec::with_capacity(ids.len());
        for result in join_all(futures).await {
            match result {
                Ok(record) => records.push(record),
                Err(e) if e.is_missing() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Every record, fully paginated.
    pub async fn get_all(&self) -> Result<Vec<Document>, S3dbError> {
        self.list(&ListOptions::default()).await
    }

    /// Key count under the scope prefix; no object reads.
    pub async fn count(&self, options: &ListOptions) -> Result<usize, S3dbError> {
        let prefix = self.scope_prefix(options)?;
        self.inner.client.count_keys(&prefix).await
    }

    /// Scan the scope, apply the filter in memory.
    pub async fn query(
        &self,
        filter: &Document,
        options: &ListOptions,
    ) -> Result<Vec<Document>, S3dbError> {
        let scan_scope = ListOptions {
            limit: None,
            offset: 0,
            partition: options.partition.clone(),
            partition_values: options.partition_values.clone(),
            include_deleted: options.include_deleted,
        };
        let candidates = self.list(&scan_scope).await?;
        let mut matched = Vec::new();
        for record in candidates {
            if query::matches(filter, &record)? {
                matched.push(record);
            }
        }
        let result: Vec<Document> = matched
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        self.emit(
            "query",
            json!({"resource": self.inner.name, "matched": result.len()}),
        );
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Index reconciliation
    // ------------------------------------------------------------------

    /// Operator tool: scan owner objects and rebuild the partition entry
    /// set, deleting stale entries and creating missing ones.
    pub async fn reconcile(&self) -> Result<usize, S3dbError> {
        let owner_pfx = self.full_key(&owner_prefix(&self.inner.name));
        let owner_keys = self.inner.client.list_all_keys(&owner_pfx).await?;

        // desired entry keys across all live records
        let mut desired: Vec<String> = Vec::new();
        for key in &owner_keys {
            let Some(id) = partition::id_from_key(key) else {
                continue;
            };
            let raw = match self.fetch_raw(&id).await {
                Ok(raw) => raw,
                Err(e) if e.is_missing() => continue,
                Err(e) => return Err(e),
            };
            let logical = self.run_generated(HookEvent::AfterGet, raw.stored).await?;
            for (name, suffix) in current_entries(&self.inner.partitions, &logical) {
                desired.push(self.full_key(&format!(
                    "{}{}/id={}",
                    partition_prefix(&self.inner.name, &name),
                    suffix,
                    partition::escape(&id)
                )));
            }
        }

        let mut existing: Vec<String> = Vec::new();
        for definition in &self.inner.partitions {
            let prefix = self.full_key(&partition_prefix(&self.inner.name, &definition.name));
            existing.extend(self.inner.client.list_all_keys(&prefix).await?);
        }

        let desired_set: std::collections::BTreeSet<&String> = desired.iter().collect();
        let existing_set: std::collections::BTreeSet<&String> = existing.iter().collect();

        let mut fixes = 0;
        for key in desired.iter().filter(|k| !existing_set.contains(*k)) {
            self.inner
                .client
                .put(key, Bytes::new(), Metadata::new(), PutOptions::default())
                .await?;
            fixes += 1;
        }
        let stale: Vec<String> = existing
            .iter()
            .filter(|k| !desired_set.contains(*k))
            .cloned()
            .collect();
        fixes += stale.len();
        self.inner.client.delete_batch(&stale).await;

        debug!(resource = %self.inner.name, fixes, "partition reconciliation finished");
        Ok(fixes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn test_resource(definition: ResourceDefinition) -> Resource {
        let events = EventBus::new();
        let client = ObjectClient::new(
            Arc::new(MemoryStorage::new()),
            "test-bucket",
            events.clone(),
            16,
            Duration::from_secs(5),
        );
        Resource::from_definition(
            &definition,
            client,
            MetadataCodec::default(),
            HookRegistry::with_builtins(Some("test-pass".to_string())),
            "data".to_string(),
            events,
        )
        .unwrap()
    }

    fn users_definition() -> ResourceDefinition {
        ResourceDefinition {
            name: "users".to_string(),
            behavior: Behavior::EnforceLimits,
            timestamps: true,
            paranoid: false,
            async_partitions: false,
            partitions: vec![],
            hooks: vec![],
            schemas: vec![SchemaRecord {
                version: 1,
                attributes: doc(json!({
                    "age": "number",
                    "email": "string|required",
                    "name": "string|required",
                })),
                dictionary: None,
            }],
            removed_at: None,
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let users = test_resource(users_definition());
        let record = users
            .insert(doc(json!({"name": "Ada", "email": "ada@ex.com", "age": 36})))
            .await
            .unwrap();
        let id = record.get("id").unwrap().as_str().unwrap().to_string();
        assert!(record.contains_key("createdAt"));

        let fetched = users.get(&id).await.unwrap();
        assert_eq!(fetched.get("name"), Some(&json!("Ada")));
        assert_eq!(fetched.get("email"), Some(&json!("ada@ex.com")));
        assert_eq!(fetched.get("age"), Some(&json!(36)));
    }

    #[tokio::test]
    async fn insert_rejects_undeclared_fields() {
        let users = test_resource(users_definition());
        let err = users
            .insert(doc(json!({"name": "A", "email": "a@b.co", "bio": "x"})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ValidationError");
    }

    #[tokio::test]
    async fn get_missing_is_no_such_key() {
        let users = test_resource(users_definition());
        let err = users.get("ghost").await.unwrap_err();
        assert_eq!(err.code(), "NoSuchKey");
    }

    #[tokio::test]
    async fn update_deep_merges_and_patch_shallow_merges() {
        let mut definition = users_definition();
        definition.schemas[0].attributes = doc(json!({
            "name": "string",
            "profile": {"bio": "string", "site": "string"},
        }));
        let users = test_resource(definition);

        let record = users
            .insert(doc(json!({
                "id": "u1",
                "name": "Ada",
                "profile": {"bio": "b", "site": "s"},
            })))
            .await
            .unwrap();
        assert_eq!(record.get("id"), Some(&json!("u1")));

        let updated = users
            .update("u1", doc(json!({"profile": {"bio": "b2"}})))
            .await
            .unwrap();
        assert_eq!(updated.get("profile"), Some(&json!({"bio": "b2", "site": "s"})));

        let patched = users
            .patch("u1", doc(json!({"profile": {"bio": "b3"}})))
            .await
            .unwrap();
        assert_eq!(patched.get("profile"), Some(&json!({"bio": "b3"})));
    }

    #[tokio::test]
    async fn update_on_empty_document_is_noop() {
        let users = test_resource(users_definition());
        users
            .insert(doc(json!({"id": "u1", "name": "Ada", "email": "a@b.co"})))
            .await
            .unwrap();
        let updated = users.update("u1", Document::new()).await.unwrap();
        let fetched = users.get("u1").await.unwrap();
        assert_eq!(updated.get("name"), fetched.get("name"));
        assert_eq!(updated.get("email"), fetched.get("email"));
    }

    #[tokio::test]
    async fn hard_delete_then_second_delete_errors() {
        let users = test_resource(users_definition());
        users
            .insert(doc(json!({"id": "u1", "name": "A", "email": "a@b.co"})))
            .await
            .unwrap();
        users.delete("u1").await.unwrap();
        let err = users.delete("u1").await.unwrap_err();
        assert_eq!(err.code(), "NoSuchKey");
    }

    #[tokio::test]
    async fn paranoid_delete_is_soft_and_idempotent() {
        let mut definition = users_definition();
        definition.paranoid = true;
        let users = test_resource(definition);

        users
            .insert(doc(json!({"id": "u1", "name": "A", "email": "a@b.co"})))
            .await
            .unwrap();
        users.delete("u1").await.unwrap();
        // second soft delete is a no-op
        users.delete("u1").await.unwrap();

        let err = users.get("u1").await.unwrap_err();
        assert_eq!(err.code(), "NoSuchKey");

        let record = users.get_with("u1", true).await.unwrap();
        assert!(record.contains_key("deletedAt"));
    }

    #[tokio::test]
    async fn partition_entries_follow_updates() {
        let mut definition = users_definition();
        definition.name = "orders".to_string();
        definition.schemas[0].attributes = doc(json!({"status": "string|required"}));
        definition.partitions = vec![PartitionDefinition::new("byStatus", &[("status", "string")])];
        let orders = test_resource(definition);

        orders
            .insert(doc(json!({"id": "o1", "status": "pending"})))
            .await
            .unwrap();

        let pending = ListOptions {
            partition: Some("byStatus".to_string()),
            partition_values: Some(doc(json!({"status": "pending"}))),
            ..Default::default()
        };
        let shipped = ListOptions {
            partition: Some("byStatus".to_string()),
            partition_values: Some(doc(json!({"status": "shipped"}))),
            ..Default::default()
        };
        assert_eq!(orders.count(&pending).await.unwrap(), 1);
        assert_eq!(orders.count(&shipped).await.unwrap(), 0);

        orders
            .update("o1", doc(json!({"status": "shipped"})))
            .await
            .unwrap();
        assert_eq!(orders.count(&pending).await.unwrap(), 0);
        assert_eq!(orders.count(&shipped).await.unwrap(), 1);

        let listed = orders.list(&shipped).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].get("id"), Some(&json!("o1")));
        assert!(orders.list(&pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hard_delete_removes_partition_entries() {
        let mut definition = users_definition();
        definition.name = "orders".to_string();
        definition.schemas[0].attributes = doc(json!({"status": "string"}));
        definition.partitions = vec![PartitionDefinition::new("byStatus", &[("status", "string")])];
        let orders = test_resource(definition);

        orders
            .insert(doc(json!({"id": "o1", "status": "open"})))
            .await
            .unwrap();
        orders.delete("o1").await.unwrap();

        let scope = ListOptions {
            partition: Some("byStatus".to_string()),
            partition_values: Some(doc(json!({"status": "open"}))),
            ..Default::default()
        };
        assert_eq!(orders.count(&scope).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_ids_and_pagination() {
        let users = test_resource(users_definition());
        for i in 0..5 {
            users
                .insert(doc(json!({
                    "id": format!("u{i}"),
                    "name": format!("N{i}"),
                    "email": "a@b.co",
                })))
                .await
                .unwrap();
        }
        let all = users.list_ids(&ListOptions::default()).await.unwrap();
        assert_eq!(all.len(), 5);

        let window = users
            .list_ids(&ListOptions {
                limit: Some(2),
                offset: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(window, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[tokio::test]
    async fn query_filters_in_memory() {
        let users = test_resource(users_definition());
        for (i, age) in [30, 40, 50].iter().enumerate() {
            users
                .insert(doc(json!({
                    "id": format!("u{i}"),
                    "name": format!("N{i}"),
                    "email": "a@b.co",
                    "age": age,
                })))
                .await
                .unwrap();
        }
        let older = users
            .query(&doc(json!({"age": {"$gte": 40}})), &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(older.len(), 2);

        let named = users
            .query(&doc(json!({"name": {"$regex": "^N0$"}})), &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(named.len(), 1);
    }

    #[tokio::test]
    async fn secret_fields_are_opaque_at_rest() {
        let mut definition = users_definition();
        definition.schemas[0].attributes = doc(json!({
            "apiKey": "secret",
            "name": "string",
        }));
        let users = test_resource(definition);

        users
            .insert(doc(json!({"id": "u1", "name": "A", "apiKey": "k-123"})))
            .await
            .unwrap();

        // read back decrypts
        let record = users.get("u1").await.unwrap();
        assert_eq!(record.get("apiKey"), Some(&json!("k-123")));

        // raw metadata holds ciphertext, not plaintext
        let raw = users.fetch_raw("u1").await.unwrap();
        let stored = raw.stored.get("apiKey").unwrap().as_str().unwrap();
        assert_ne!(stored, "k-123");

        // two records with equal plaintext store different ciphertext
        users
            .insert(doc(json!({"id": "u2", "name": "B", "apiKey": "k-123"})))
            .await
            .unwrap();
        let other = users.fetch_raw("u2").await.unwrap();
        assert_ne!(
            other.stored.get("apiKey").unwrap(),
            raw.stored.get("apiKey").unwrap()
        );
    }

    #[tokio::test]
    async fn body_overflow_resource_round_trips_big_records() {
        let mut definition = users_definition();
        definition.name = "docs".to_string();
        definition.behavior = Behavior::BodyOverflow;
        definition.schemas[0].attributes = doc(json!({"body": "string", "title": "string"}));
        let docs = test_resource(definition);

        let body = "X".repeat(5000);
        docs.insert(doc(json!({"id": "d1", "title": "T", "body": body})))
            .await
            .unwrap();

        let raw = docs.fetch_raw("d1").await.unwrap();
        assert!(raw.meta.contains_key(OVERFLOW_HEADER));

        let record = docs.get("d1").await.unwrap();
        assert_eq!(record.get("title"), Some(&json!("T")));
        assert_eq!(record.get("body").unwrap().as_str().unwrap().len(), 5000);
    }

    #[tokio::test]
    async fn enforce_limits_rejects_oversized_record() {
        let users = test_resource(users_definition());
        let err = users
            .insert(doc(json!({
                "name": "A",
                "email": format!("{}@x.co", "a".repeat(4000)),
            })))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MetadataLimitError");
    }

    #[tokio::test]
    async fn insert_many_reports_per_item() {
        let users = test_resource(users_definition());
        let outcomes = users
            .insert_many(vec![
                doc(json!({"name": "A", "email": "a@b.co"})),
                doc(json!({"name": "B"})),
            ])
            .await;
        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok);
        assert_eq!(outcomes[1].err.as_ref().unwrap().code(), "ValidationError");
    }

    #[tokio::test]
    async fn reconcile_rebuilds_missing_entries() {
        let mut definition = users_definition();
        definition.name = "orders".to_string();
        definition.schemas[0].attributes = doc(json!({"status": "string"}));
        definition.partitions = vec![PartitionDefinition::new("byStatus", &[("status", "string")])];
        let orders = test_resource(definition);

        orders
            .insert(doc(json!({"id": "o1", "status": "open"})))
            .await
            .unwrap();

        // simulate drift: remove the index entry behind the runtime's back
        let entry_key = "data/resource=orders/partition=byStatus/status=open/id=o1";
        orders.inner.client.delete(entry_key).await.unwrap();

        let scope = ListOptions {
            partition: Some("byStatus".to_string()),
            partition_values: Some(doc(json!({"status": "open"}))),
            ..Default::default()
        };
        assert_eq!(orders.count(&scope).await.unwrap(), 0);

        let fixes = orders.reconcile().await.unwrap();
        assert_eq!(fixes, 1);
        assert_eq!(orders.count(&scope).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn schema_versions_decode_old_records() {
        let users = test_resource(users_definition());
        users
            .insert(doc(json!({"id": "u1", "name": "Ada", "email": "a@b.co"})))
            .await
            .unwrap();

        // evolve: v2 adds a field and drops nothing
        let v2 = Schema::compile(
            2,
            doc(json!({
                "age": "number",
                "email": "string|required",
                "name": "string|required",
                "nickname": "string",
            })),
        )
        .unwrap();
        users.push_schema(v2);

        // the v1 record still decodes with its embedded version
        let record = users.get("u1").await.unwrap();
        assert_eq!(record.get("name"), Some(&json!("Ada")));

        // new writes carry v2
        users
            .insert(doc(json!({
                "id": "u2",
                "name": "B",
                "email": "b@b.co",
                "nickname": "bee",
            })))
            .await
            .unwrap();
        let raw = users.fetch_raw("u2").await.unwrap();
        assert_eq!(raw.meta.get(VERSION_HEADER).map(String::as_str), Some("v2"));
    }
}
