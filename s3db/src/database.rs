//! Database root
//!
//! A `Database` owns one bucket/prefix and a single metadata object at
//! `{prefix}/s3db.json` describing every resource and its schema history.
//! The root is rewritten with optimistic concurrency (`if_match` on the
//! last seen etag) whenever a resource definition changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use s3db_types::{ErrorContext, S3dbError};

use crate::behavior::Behavior;
use crate::config::{Backend, ConnectionConfig};
use crate::events::EventBus;
use crate::hooks::{HookBinding, HookRegistry};
use crate::metadata::MetadataCodec;
use crate::partition::PartitionDefinition;
use crate::plugins::Plugin;
use crate::resource::{Resource, ResourceDefinition, SchemaRecord};
use crate::storage::{
    FilesystemStorage, MemoryStorage, ObjectClient, ObjectStorage, PutOptions, S3Storage,
};

const ROOT_OBJECT: &str = "s3db.json";
const ROOT_VERSION: &str = "1";
const ROOT_REWRITE_ATTEMPTS: u32 = 3;
const DISCONNECT_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// The persisted shape of `s3db.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RootDocument {
    version: String,
    #[serde(default)]
    resources: Vec<ResourceDefinition>,
    #[serde(default)]
    plugins: Vec<String>,
}

impl Default for RootDocument {
    fn default() -> Self {
        Self {
            version: ROOT_VERSION.to_string(),
            resources: Vec::new(),
            plugins: Vec::new(),
        }
    }
}

struct RootState {
    document: RootDocument,
    etag: Option<String>,
}

/// Inputs for `create_resource`.
#[derive(Debug, Clone)]
pub struct ResourceOptions {
    pub name: String,
    pub attributes: Map<String, Value>,
    pub behavior: Behavior,
    pub timestamps: bool,
    pub paranoid: bool,
    pub async_partitions: bool,
    pub partitions: Vec<PartitionDefinition>,
    pub hooks: Vec<HookBinding>,
}

impl ResourceOptions {
    pub fn new(name: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            attributes,
            behavior: Behavior::default(),
            timestamps: false,
            paranoid: false,
            async_partitions: false,
            partitions: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    pub fn with_paranoid(mut self) -> Self {
        self.paranoid = true;
        self
    }

    pub fn with_async_partitions(mut self) -> Self {
        self.async_partitions = true;
        self
    }

    pub fn with_partition(mut self, partition: PartitionDefinition) -> Self {
        self.partitions.push(partition);
        self
    }

    pub fn with_hook(mut self, hook: HookBinding) -> Self {
        self.hooks.push(hook);
        self
    }
}

struct DatabaseInner {
    config: ConnectionConfig,
    client: ObjectClient,
    codec: MetadataCodec,
    registry: HookRegistry,
    events: EventBus,
    resources: std::sync::RwLock<HashMap<String, Resource>>,
    root: Mutex<RootState>,
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
}

/// Connection-scoped root handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("bucket", &self.inner.config.bucket)
            .field("prefix", &self.inner.config.prefix)
            .finish()
    }
}

impl Database {
    /// Connect with a connection string (§ connection schemes).
    pub async fn connect(connection_string: &str) -> Result<Self, S3dbError> {
        let config = ConnectionConfig::parse(connection_string)?;
        Self::connect_with(config, None).await
    }

    /// Connect with a parsed config and an optional pre-populated hook
    /// registry (custom hooks must be registered before resources that
    /// reference them are loaded).
    pub async fn connect_with(
        config: ConnectionConfig,
        registry: Option<HookRegistry>,
    ) -> Result<Self, S3dbError> {
        let storage: Arc<dyn ObjectStorage> = match &config.backend {
            Backend::Memory => Arc::new(MemoryStorage::new()),
            Backend::Filesystem { root } => Arc::new(FilesystemStorage::new(root)),
            Backend::S3 {
                endpoint,
                region,
                force_path_style,
                credentials,
            } => Arc::new(
                S3Storage::new(
                    config.bucket.clone(),
                    endpoint.clone(),
                    region.clone(),
                    *force_path_style,
                    credentials.clone(),
                )
                .await,
            ),
        };

        let events = EventBus::new();
        let client = ObjectClient::new(
            storage,
            config.bucket.clone(),
            events.clone(),
            config.concurrency,
            Duration::from_secs(config.request_timeout_secs),
        );
        let registry =
            registry.unwrap_or_else(|| HookRegistry::with_builtins(config.passphrase.clone()));
        let codec = MetadataCodec::new(config.metadata_limit);

        let database = Self {
            inner: Arc::new(DatabaseInner {
                config,
                client,
                codec,
                registry,
                events,
                resources: std::sync::RwLock::new(HashMap::new()),
                root: Mutex::new(RootState {
                    document: RootDocument::default(),
                    etag: None,
                }),
                plugins: Mutex::new(Vec::new()),
            }),
        };

        database.load_root().await?;
        info!(
            bucket = %database.inner.config.bucket,
            prefix = %database.inner.config.prefix,
            "database connected"
        );
        Ok(database)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.registry
    }

    pub fn client(&self) -> &ObjectClient {
        &self.inner.client
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    fn root_key(&self) -> String {
        self.inner.config.full_key(ROOT_OBJECT)
    }

    fn build_resource(&self, definition: &ResourceDefinition) -> Result<Resource, S3dbError> {
        Resource::from_definition(
            definition,
            self.inner.client.clone(),
            self.inner.codec.clone(),
            self.inner.registry.clone(),
            self.inner.config.prefix.clone(),
            self.inner.events.clone(),
        )
    }

    /// Fetch (or create) the root object and instantiate resources.
    async fn load_root(&self) -> Result<(), S3dbError> {
        let key = self.root_key();
        let state = match self.inner.client.get(&key).await {
            Ok(data) => {
                let document: RootDocument =
                    serde_json::from_slice(&data.body).map_err(|e| S3dbError::Unknown {
                        message: format!("corrupt root metadata object: {e}"),
                        context: ErrorContext::object(&self.inner.config.bucket, &key),
                    })?;
                RootState {
                    document,
                    etag: Some(data.etag),
                }
            }
            Err(e) if e.is_missing() => {
                let document = RootDocument::default();
                let body = serde_json::to_vec_pretty(&document).unwrap_or_default();
                match self
                    .inner
                    .client
                    .put_if_absent(&key, Bytes::from(body), Default::default())
                    .await?
                {
                    Some(result) => RootState {
                        document,
                        etag: Some(result.etag),
                    },
                    // another process created it first; read theirs
                    None => {
                        let data = self.inner.client.get(&key).await?;
                        let document: RootDocument = serde_json::from_slice(&data.body)
                            .map_err(|e| S3dbError::Unknown {
                                message: format!("corrupt root metadata object: {e}"),
                                context: ErrorContext::object(&self.inner.config.bucket, &key),
                            })?;
                        RootState {
                            document,
                            etag: Some(data.etag),
                        }
                    }
                }
            }
            Err(e) => return Err(e),
        };

        {
            let mut resources = self.inner.resources.write().unwrap();
            resources.clear();
            for definition in &state.document.resources {
                resources.insert(definition.name.clone(), self.build_resource(definition)?);
            }
        }
        *self.inner.root.lock().await = state;
        Ok(())
    }

    /// Rewrite the root under optimistic concurrency. The mutator runs on
    /// the freshest copy each attempt.
    async fn rewrite_root<F>(&self, mutate: F) -> Result<(), S3dbError>
    where
        F: Fn(&mut RootDocument) -> Result<(), S3dbError>,
    {
        let key = self.root_key();
        let mut state = self.inner.root.lock().await;
        for attempt in 0..ROOT_REWRITE_ATTEMPTS {
            let mut document = state.document.clone();
            mutate(&mut document)?;
            let body = serde_json::to_vec_pretty(&document).map_err(|e| S3dbError::Unknown {
                message: format!("root encode failed: {e}"),
                context: ErrorContext::object(&self.inner.config.bucket, &key),
            })?;

            let options = PutOptions {
                content_type: Some("application/json".to_string()),
                if_match: state.etag.clone(),
                if_none_match_any: state.etag.is_none(),
                ..Default::default()
            };
            match self
                .inner
                .client
                .put(&key, Bytes::from(body), Default::default(), options)
                .await
            {
                Ok(result) => {
                    state.document = document;
                    state.etag = Some(result.etag);
                    return Ok(());
                }
                Err(S3dbError::Race { .. }) => {
                    warn!(attempt, "root rewrite lost the race, re-reading");
                    tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
                    let data = self.inner.client.get(&key).await?;
                    state.document =
                        serde_json::from_slice(&data.body).map_err(|e| S3dbError::Unknown {
                            message: format!("corrupt root metadata object: {e}"),
                            context: ErrorContext::object(&self.inner.config.bucket, &key),
                        })?;
                    state.etag = Some(data.etag);
                }
                Err(e) => return Err(e),
            }
        }
        Err(S3dbError::Race {
            message: format!("root rewrite failed after {ROOT_REWRITE_ATTEMPTS} attempts"),
            context: ErrorContext::object(&self.inner.config.bucket, &key),
        })
    }

    /// Create (or idempotently evolve) a resource. An existing resource
    /// with a different attribute definition gets a new schema version.
    pub async fn create_resource(&self, options: ResourceOptions) -> Result<Resource, S3dbError> {
        let existing = self
            .inner
            .resources
            .read()
            .unwrap()
            .get(&options.name)
            .cloned();
        if let Some(resource) = existing {
            let current = resource.current_schema();
            if current.definition == options.attributes {
                return Ok(resource);
            }
            return self.update_schema(&options.name, options.attributes).await;
        }

        // validate before touching the root
        let schema_record = SchemaRecord {
            version: 1,
            attributes: options.attributes.clone(),
            dictionary: None,
        };
        schema_record.compile()?;

        let definition = ResourceDefinition {
            name: options.name.clone(),
            behavior: options.behavior,
            timestamps: options.timestamps,
            paranoid: options.paranoid,
            async_partitions: options.async_partitions,
            partitions: options.partitions.clone(),
            hooks: options.hooks.clone(),
            schemas: vec![schema_record],
            removed_at: None,
        };

        let resource = self.build_resource(&definition)?;
        let for_root = definition.clone();
        self.rewrite_root(move |root| {
            if !root.resources.iter().any(|r| r.name == for_root.name) {
                root.resources.push(for_root.clone());
            }
            Ok(())
        })
        .await?;

        self.inner
            .resources
            .write()
            .unwrap()
            .insert(options.name.clone(), resource.clone());
        info!(resource = %options.name, "resource created");
        self.inner
            .events
            .emit("resource.created", json!({"resource": options.name}));
        Ok(resource)
    }

    /// Append a new schema version. Existing records keep decoding with
    /// the version tag embedded in their metadata.
    pub async fn update_schema(
        &self,
        name: &str,
        attributes: Map<String, Value>,
    ) -> Result<Resource, S3dbError> {
        let resource = self.resource(name)?;
        let next_version = resource.current_schema().version + 1;
        let record = SchemaRecord {
            version: next_version,
            attributes: attributes.clone(),
            dictionary: None,
        };
        let schema = record.compile()?;

        let name_owned = name.to_string();
        self.rewrite_root(move |root| {
            let entry = root
                .resources
                .iter_mut()
                .find(|r| r.name == name_owned)
                .ok_or_else(|| S3dbError::NotFound {
                    context: ErrorContext::resource(&name_owned),
                })?;
            if !entry.schemas.iter().any(|s| s.version == next_version) {
                entry.schemas.push(record.clone());
            }
            Ok(())
        })
        .await?;

        resource.push_schema(schema);
        info!(resource = name, version = next_version, "schema version appended");
        Ok(resource)
    }

    /// Mark a resource removed. Its schema history stays live so existing
    /// records remain decodable until purged.
    pub async fn remove_resource(&self, name: &str) -> Result<(), S3dbError> {
        let name_owned = name.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        self.rewrite_root(move |root| {
            let entry = root
                .resources
                .iter_mut()
                .find(|r| r.name == name_owned)
                .ok_or_else(|| S3dbError::NotFound {
                    context: ErrorContext::resource(&name_owned),
                })?;
            entry.removed_at = Some(now.clone());
            Ok(())
        })
        .await
    }

    /// Look up a live resource handle.
    pub fn resource(&self, name: &str) -> Result<Resource, S3dbError> {
        self.inner
            .resources
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| S3dbError::NotFound {
                context: ErrorContext::resource(name),
            })
    }

    /// Names of all resources, including removed ones still decodable.
    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.resources.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Install and start a plugin. Plugins are stopped in reverse order on
    /// disconnect.
    pub async fn install_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), S3dbError> {
        plugin.install(self).await?;
        plugin.start(self).await?;
        let plugin_name = plugin.name().to_string();
        self.inner.plugins.lock().await.push(plugin);
        self.rewrite_root(move |root| {
            if !root.plugins.contains(&plugin_name) {
                root.plugins.push(plugin_name.clone());
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Stop plugins in reverse installation order, drain in-flight
    /// object-store work with a deadline, and close the client pool.
    pub async fn disconnect(&self) -> Result<(), S3dbError> {
        {
            let mut plugins = self.inner.plugins.lock().await;
            for plugin in plugins.iter().rev() {
                if let Err(e) = plugin.stop().await {
                    warn!(plugin = plugin.name(), error = %e, "plugin stop failed");
                }
            }
            plugins.clear();
        }
        if !self.inner.client.drain(DISCONNECT_DRAIN_DEADLINE).await {
            warn!(
                in_flight = self.inner.client.in_flight(),
                "disconnect deadline passed with commands still in flight"
            );
        }
        self.inner.client.close();
        info!(bucket = %self.inner.config.bucket, "database disconnected");
        Ok(())
    }
}
