//! Hook pipelines
//!
//! Hooks are named, registered transformations over the record being
//! written or read. A resource's pipelines persist into `s3db.json` as
//! `{event, name, params}` bindings, so a database is reconstructible from
//! its metadata object alone: on connect each binding is resolved against
//! the registry, and an unknown name is a configuration error. Hooks must
//! be pure over `(data, params)`; they cannot capture external state.
//!
//! The schema generates bindings for `secret*` fields (encrypt before
//! persist, decrypt after read) and `password` fields (bcrypt before
//! persist, one-way). Generated bindings run ahead of user hooks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use s3db_types::{get_path, set_path, Document, ErrorContext, S3dbError};

use crate::crypto;
use crate::schema::Schema;

pub const ENCRYPT_HOOK: &str = "encryptSecretFields";
pub const DECRYPT_HOOK: &str = "decryptSecretFields";
pub const PASSWORD_HOOK: &str = "hashPasswordFields";

/// Lifecycle points a hook can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookEvent {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    AfterGet,
}

/// A persisted hook reference: registry name plus immutable params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookBinding {
    pub event: HookEvent,
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

/// A registered transformation. Implementations read and write only the
/// `data` argument and their params.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn apply(&self, data: Document, params: &Value) -> Result<Document, S3dbError>;
}

/// Adapter for plain function hooks.
struct FnHook<F>(F);

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(Document, &Value) -> Result<Document, S3dbError> + Send + Sync,
{
    async fn apply(&self, data: Document, params: &Value) -> Result<Document, S3dbError> {
        (self.0)(data, params)
    }
}

/// Name-to-hook table shared by every resource of a database.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Arc<RwLock<HashMap<String, Arc<dyn Hook>>>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("registered", &self.hooks.read().unwrap().len())
            .finish()
    }
}

impl HookRegistry {
    /// Registry preloaded with the generated crypto hooks.
    pub fn with_builtins(passphrase: Option<String>) -> Self {
        let registry = Self::default();
        let encrypt_passphrase = passphrase.clone();
        registry.register_fn(ENCRYPT_HOOK, move |data, params| {
            encrypt_fields(data, params, encrypt_passphrase.as_deref())
        });
        registry.register_fn(DECRYPT_HOOK, move |data, params| {
            decrypt_fields(data, params, passphrase.as_deref())
        });
        registry.register_fn(PASSWORD_HOOK, hash_password_fields);
        registry
    }

    pub fn register(&self, name: impl Into<String>, hook: Arc<dyn Hook>) {
        self.hooks.write().unwrap().insert(name.into(), hook);
    }

    pub fn register_fn<F>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn(Document, &Value) -> Result<Document, S3dbError> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnHook(hook)));
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Hook>, S3dbError> {
        self.hooks
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| S3dbError::Config {
                message: format!("hook '{name}' is not registered"),
            })
    }
}

/// Run a pipeline of bindings over a document, in order.
pub async fn run_pipeline(
    registry: &HookRegistry,
    bindings: &[HookBinding],
    event: HookEvent,
    mut data: Document,
) -> Result<Document, S3dbError> {
    for binding in bindings.iter().filter(|b| b.event == event) {
        let hook = registry.resolve(&binding.name)?;
        data = hook.apply(data, &binding.params).await?;
    }
    Ok(data)
}

/// Bindings the schema generates for its crypto-typed fields. Returned in
/// the order they must run, ahead of user hooks.
pub fn generated_bindings(schema: &Schema) -> Vec<HookBinding> {
    let mut bindings = Vec::new();

    let secret_fields = schema.secret_fields();
    if !secret_fields.is_empty() {
        let mut field_types = serde_json::Map::new();
        for field in &secret_fields {
            let kind = match schema.attribute_at(field).map(|a| &a.attr_type) {
                Some(crate::schema::AttributeType::SecretNumber) => "secretNumber",
                Some(crate::schema::AttributeType::SecretAny) => "secretAny",
                _ => "secret",
            };
            field_types.insert(field.clone(), Value::String(kind.to_string()));
        }
        let params = Value::Object(
            [("fields".to_string(), Value::Object(field_types))]
                .into_iter()
                .collect(),
        );
        for event in [HookEvent::BeforeInsert, HookEvent::BeforeUpdate] {
            bindings.push(HookBinding {
                event,
                name: ENCRYPT_HOOK.to_string(),
                params: params.clone(),
            });
        }
        bindings.push(HookBinding {
            event: HookEvent::AfterGet,
            name: DECRYPT_HOOK.to_string(),
            params,
        });
    }

    let password_fields = schema.password_fields();
    if !password_fields.is_empty() {
        let params = serde_json::json!({"fields": password_fields});
        for event in [HookEvent::BeforeInsert, HookEvent::BeforeUpdate] {
            bindings.push(HookBinding {
                event,
                name: PASSWORD_HOOK.to_string(),
                params: params.clone(),
            });
        }
        // one-way: no after-read binding
    }

    bindings
}

fn missing_passphrase(field: &str) -> S3dbError {
    S3dbError::Encryption {
        message: "no passphrase configured for secret fields".to_string(),
        context: ErrorContext::default().with_field(field),
    }
}

fn field_types(params: &Value) -> Vec<(String, String)> {
    params
        .get("fields")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or("secret").to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn encrypt_fields(
    mut data: Document,
    params: &Value,
    passphrase: Option<&str>,
) -> Result<Document, S3dbError> {
    for (field, kind) in field_types(params) {
        let Some(value) = get_path(&data, &field).cloned() else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let passphrase = passphrase.ok_or_else(|| missing_passphrase(&field))?;
        let plaintext = match kind.as_str() {
            "secret" => match value {
                Value::String(s) => s,
                other => other.to_string(),
            },
            "secretNumber" => value.to_string(),
            _ => serde_json::to_string(&value).map_err(|e| S3dbError::Encryption {
                message: format!("secretAny serialization failed: {e}"),
                context: ErrorContext::default().with_field(&field),
            })?,
        };
        let ciphertext = crypto::encrypt_str(passphrase, &plaintext)?;
        set_path(&mut data, &field, Value::String(ciphertext));
    }
    Ok(data)
}

fn decrypt_fields(
    mut data: Document,
    params: &Value,
    passphrase: Option<&str>,
) -> Result<Document, S3dbError> {
    for (field, kind) in field_types(params) {
        let Some(Value::String(payload)) = get_path(&data, &field).cloned() else {
            continue;
        };
        let passphrase = passphrase.ok_or_else(|| missing_passphrase(&field))?;
        let plaintext = crypto::decrypt_str(passphrase, &payload)?;
        let restored = match kind.as_str() {
            "secret" => Value::String(plaintext),
            "secretNumber" => serde_json::from_str::<Value>(&plaintext)
                .ok()
                .filter(Value::is_number)
                .ok_or_else(|| S3dbError::Encryption {
                    message: "decrypted payload is not a number".to_string(),
                    context: ErrorContext::default().with_field(&field),
                })?,
            _ => serde_json::from_str(&plaintext).map_err(|e| S3dbError::Encryption {
                message: format!("decrypted payload is not JSON: {e}"),
                context: ErrorContext::default().with_field(&field),
            })?,
        };
        set_path(&mut data, &field, restored);
    }
    Ok(data)
}

fn hash_password_fields(mut data: Document, params: &Value) -> Result<Document, S3dbError> {
    let fields: Vec<String> = params
        .get("fields")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    for field in fields {
        let Some(Value::String(raw)) = get_path(&data, &field).cloned() else {
            continue;
        };
        // already hashed (re-persist after a read/merge)
        if raw.starts_with("$2") {
            continue;
        }
        let hashed = crypto::hash_password(&raw)?;
        set_path(&mut data, &field, Value::String(hashed));
    }
    Ok(data)
}
