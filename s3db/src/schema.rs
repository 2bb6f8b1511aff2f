//! Schema definition and validation
//!
//! Attributes are declared with a pipe-delimited DSL
//! (`"email|required|string|min:3|max:120"`) or, for nested shapes, plain
//! maps and the explicit `{type: "array", items: ...}` form. Definitions
//! compile once per schema version into a validator; the original
//! definition value is what gets persisted, so schemas survive a round trip
//! through `s3db.json` and recompile on connect.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use s3db_types::{Document, S3dbError, ValidationIssue};

use crate::encoding::base62;
use crate::encoding::dictionary::Dictionary;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());
static ALPHANUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9]+$").unwrap());

/// Attribute names the runtime manages itself; they are accepted on input
/// without being declared.
pub const MANAGED_FIELDS: &[&str] = &[
    "id",
    "createdAt",
    "updatedAt",
    "deletedAt",
    "pendingVersion",
    "_truncated",
];

/// The type dimension of an attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeType {
    String,
    Number,
    Integer,
    Boolean,
    Date,
    Uuid,
    Email,
    Url,
    Json,
    Embedding(usize),
    Secret,
    SecretNumber,
    SecretAny,
    Password,
    Array(Box<CompiledAttribute>),
    Object(BTreeMap<String, CompiledAttribute>),
}

impl AttributeType {
    pub fn is_secret(&self) -> bool {
        matches!(
            self,
            AttributeType::Secret | AttributeType::SecretNumber | AttributeType::SecretAny
        )
    }
}

/// One attribute with its compiled rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledAttribute {
    pub attr_type: AttributeType,
    pub required: bool,
    pub nullable: bool,
    pub default: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pattern: Option<String>,
    pub enum_values: Option<Vec<String>>,
    pub trim: bool,
    pub lowercase: bool,
    pub uppercase: bool,
    pub alphanum: bool,
    pub positive: bool,
    pub non_empty: bool,
}

impl Default for CompiledAttribute {
    fn default() -> Self {
        Self {
            attr_type: AttributeType::String,
            required: false,
            nullable: false,
            default: None,
            min: None,
            max: None,
            pattern: None,
            enum_values: None,
            trim: false,
            lowercase: false,
            uppercase: false,
            alphanum: false,
            positive: false,
            non_empty: false,
        }
    }
}

fn parse_type_token(token: &str) -> Option<AttributeType> {
    if let Some(n) = token.strip_prefix("embedding:") {
        return n.parse().ok().map(AttributeType::Embedding);
    }
    match token {
        "string" => Some(AttributeType::String),
        "number" => Some(AttributeType::Number),
        "integer" => Some(AttributeType::Integer),
        "boolean" => Some(AttributeType::Boolean),
        "date" => Some(AttributeType::Date),
        "uuid" => Some(AttributeType::Uuid),
        "email" => Some(AttributeType::Email),
        "url" => Some(AttributeType::Url),
        "json" => Some(AttributeType::Json),
        "secret" => Some(AttributeType::Secret),
        "secretNumber" => Some(AttributeType::SecretNumber),
        "secretAny" => Some(AttributeType::SecretAny),
        "password" => Some(AttributeType::Password),
        "array" => Some(AttributeType::Array(Box::default())),
        "object" => Some(AttributeType::Object(BTreeMap::new())),
        _ => None,
    }
}

fn parse_default_literal(raw: &str) -> Value {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return v;
    }
    Value::String(raw.to_string())
}

/// Parse a pipe-delimited rule string into a compiled attribute.
fn compile_rule_string(field: &str, rule: &str) -> Result<CompiledAttribute, S3dbError> {
    let mut compiled = CompiledAttribute::default();
    let mut saw_type = false;

    for token in rule.split('|').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some(attr_type) = parse_type_token(token) {
            compiled.attr_type = attr_type;
            saw_type = true;
            continue;
        }
        match token {
            "required" => compiled.required = true,
            "optional" => compiled.required = false,
            "nullable" => compiled.nullable = true,
            "trim" => compiled.trim = true,
            "lowercase" => compiled.lowercase = true,
            "uppercase" => compiled.uppercase = true,
            "alphanum" => compiled.alphanum = true,
            "positive" => compiled.positive = true,
            _ => {
                let (name, arg) = token.split_once(':').ok_or_else(|| S3dbError::Config {
                    message: format!("unknown rule '{token}' for attribute '{field}'"),
                })?;
                match name {
                    "min" => {
                        compiled.min = Some(arg.parse().map_err(|_| S3dbError::Config {
                            message: format!("invalid min for '{field}': {arg}"),
                        })?)
                    }
                    "max" => {
                        compiled.max = Some(arg.parse().map_err(|_| S3dbError::Config {
                            message: format!("invalid max for '{field}': {arg}"),
                        })?)
                    }
                    "default" => compiled.default = Some(parse_default_literal(arg)),
                    "pattern" => {
                        let trimmed = arg.trim_matches('/');
                        Regex::new(trimmed).map_err(|e| S3dbError::Config {
                            message: format!("invalid pattern for '{field}': {e}"),
                        })?;
                        compiled.pattern = Some(trimmed.to_string());
                    }
                    "enum" => {
                        compiled.enum_values =
                            Some(arg.split(',').map(|v| v.trim().to_string()).collect())
                    }
                    "items" => {
                        let items = compile_rule_string(field, arg)?;
                        compiled.attr_type = AttributeType::Array(Box::new(items));
                        saw_type = true;
                    }
                    "empty" => compiled.non_empty = arg == "false",
                    _ => {
                        return Err(S3dbError::Config {
                            message: format!("unknown rule '{token}' for attribute '{field}'"),
                        })
                    }
                }
            }
        }
    }

    if !saw_type {
        debug!(field, "attribute rule has no type token, defaulting to string");
    }
    Ok(compiled)
}

/// Compile one attribute definition value (rule string, nested map, or the
/// explicit `{type, items/properties}` form).
fn compile_attribute(field: &str, definition: &Value) -> Result<CompiledAttribute, S3dbError> {
    match definition {
        Value::String(rule) => compile_rule_string(field, rule),
        Value::Object(map) => {
            // explicit form when a `type` string is present
            if let Some(Value::String(type_name)) = map.get("type") {
                let mut compiled = CompiledAttribute {
                    attr_type: parse_type_token(type_name).ok_or_else(|| S3dbError::Config {
                        message: format!("unknown type '{type_name}' for attribute '{field}'"),
                    })?,
                    ..Default::default()
                };
                if let Some(Value::Bool(true)) = map.get("required") {
                    compiled.required = true;
                }
                match &mut compiled.attr_type {
                    AttributeType::Array(items) => {
                        if let Some(item_def) = map.get("items") {
                            *items = Box::new(compile_attribute(field, item_def)?);
                        }
                    }
                    AttributeType::Object(properties) => {
                        if let Some(Value::Object(props)) = map.get("properties") {
                            for (name, def) in props {
                                properties.insert(name.clone(), compile_attribute(name, def)?);
                            }
                        }
                    }
                    _ => {}
                }
                Ok(compiled)
            } else {
                // plain nested object schema
                let mut properties = BTreeMap::new();
                for (name, def) in map {
                    properties.insert(name.clone(), compile_attribute(name, def)?);
                }
                Ok(CompiledAttribute {
                    attr_type: AttributeType::Object(properties),
                    ..Default::default()
                })
            }
        }
        other => Err(S3dbError::Config {
            message: format!("invalid attribute definition for '{field}': {other}"),
        }),
    }
}

/// Bijection between attribute names and short metadata keys for one
/// schema version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeMap {
    name_to_key: BTreeMap<String, String>,
    key_to_name: BTreeMap<String, String>,
}

fn short_key_for(index: usize) -> String {
    base62::encode_u64(index as u64)
}

impl AttributeMap {
    /// Walk attributes depth-first in stable (sorted) order; nested object
    /// properties get compound keys under their parent's key.
    fn build(attributes: &BTreeMap<String, CompiledAttribute>) -> Self {
        let mut map = AttributeMap::default();
        Self::assign(attributes, None, &mut map);
        map
    }

    fn assign(
        attributes: &BTreeMap<String, CompiledAttribute>,
        parent: Option<(&str, &str)>,
        map: &mut AttributeMap,
    ) {
        for (index, (name, attribute)) in attributes.iter().enumerate() {
            let (full_name, key) = match parent {
                Some((parent_name, parent_key)) => (
                    format!("{parent_name}.{name}"),
                    format!("{parent_key}.{}", short_key_for(index)),
                ),
                None => (name.clone(), short_key_for(index)),
            };
            map.name_to_key.insert(full_name.clone(), key.clone());
            map.key_to_name.insert(key.clone(), full_name.clone());
            if let AttributeType::Object(properties) = &attribute.attr_type {
                Self::assign(properties, Some((&full_name, &key)), map);
            }
        }
    }

    pub fn key_for(&self, name: &str) -> Option<&str> {
        self.name_to_key.get(name).map(String::as_str)
    }

    pub fn name_for(&self, key: &str) -> Option<&str> {
        self.key_to_name.get(key).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = (&String, &String)> {
        self.name_to_key.iter()
    }
}

/// A compiled, versioned schema.
#[derive(Debug, Clone)]
pub struct Schema {
    pub version: u32,
    /// The definition exactly as declared; persisted to `s3db.json`.
    pub definition: Map<String, Value>,
    pub attributes: BTreeMap<String, CompiledAttribute>,
    pub map: AttributeMap,
    pub dictionary: Option<Dictionary>,
}

impl Schema {
    pub fn compile(version: u32, definition: Map<String, Value>) -> Result<Self, S3dbError> {
        let mut attributes = BTreeMap::new();
        for (name, def) in &definition {
            attributes.insert(name.clone(), compile_attribute(name, def)?);
        }
        let map = AttributeMap::build(&attributes);
        Ok(Self {
            version,
            definition,
            attributes,
            map,
            dictionary: None,
        })
    }

    pub fn with_dictionary(mut self, dictionary: Dictionary) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    /// `vN` tag stored in each record's metadata.
    pub fn version_tag(&self) -> String {
        format!("v{}", self.version)
    }

    /// Attribute names (with dot paths for nested) tagged `secret*`, in
    /// stable order.
    pub fn secret_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        Self::collect_fields(&self.attributes, None, &mut fields, &|a| {
            a.attr_type.is_secret()
        });
        fields
    }

    /// Attribute names tagged `password`.
    pub fn password_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        Self::collect_fields(&self.attributes, None, &mut fields, &|a| {
            a.attr_type == AttributeType::Password
        });
        fields
    }

    /// Look up the compiled attribute at a dot path (`"address.city"`).
    pub fn attribute_at(&self, path: &str) -> Option<&CompiledAttribute> {
        let mut segments = path.split('.');
        let mut current = self.attributes.get(segments.next()?)?;
        for segment in segments {
            match &current.attr_type {
                AttributeType::Object(properties) => current = properties.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    fn collect_fields(
        attributes: &BTreeMap<String, CompiledAttribute>,
        parent: Option<&str>,
        out: &mut Vec<String>,
        predicate: &dyn Fn(&CompiledAttribute) -> bool,
    ) {
        for (name, attribute) in attributes {
            let full = match parent {
                Some(p) => format!("{p}.{name}"),
                None => name.clone(),
            };
            if predicate(attribute) {
                out.push(full.clone());
            }
            if let AttributeType::Object(properties) = &attribute.attr_type {
                Self::collect_fields(properties, Some(&full), out, predicate);
            }
        }
    }

    /// Validate a document, producing the normalized copy (defaults filled,
    /// string normalizers applied) or the ordered issue list.
    pub fn validate(&self, document: &Document) -> Result<Document, Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        let normalized = validate_object(&self.attributes, document, "", &mut issues, true);
        if issues.is_empty() {
            Ok(normalized)
        } else {
            Err(issues)
        }
    }
}

fn path_of(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn validate_object(
    attributes: &BTreeMap<String, CompiledAttribute>,
    document: &Document,
    prefix: &str,
    issues: &mut Vec<ValidationIssue>,
    top_level: bool,
) -> Document {
    let mut normalized = Document::new();

    // unknown attributes are rejected; runtime-managed fields pass through
    for (name, value) in document {
        if attributes.contains_key(name) {
            continue;
        }
        if top_level && MANAGED_FIELDS.contains(&name.as_str()) {
            normalized.insert(name.clone(), value.clone());
            continue;
        }
        issues.push(ValidationIssue::new(
            path_of(prefix, name),
            "attribute is not declared in the schema",
            "undeclared",
        ));
    }

    for (name, attribute) in attributes {
        let path = path_of(prefix, name);
        match document.get(name) {
            None | Some(Value::Null) => {
                let explicit_null = matches!(document.get(name), Some(Value::Null));
                if let Some(default) = &attribute.default {
                    normalized.insert(name.clone(), default.clone());
                } else if explicit_null && attribute.nullable {
                    normalized.insert(name.clone(), Value::Null);
                } else if attribute.required {
                    issues.push(ValidationIssue::new(&path, "attribute is required", "required"));
                }
            }
            Some(value) => {
                if let Some(v) = validate_value(attribute, value, &path, issues) {
                    normalized.insert(name.clone(), v);
                }
            }
        }
    }

    normalized
}

fn validate_value(
    attribute: &CompiledAttribute,
    value: &Value,
    path: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<Value> {
    match &attribute.attr_type {
        AttributeType::String
        | AttributeType::Email
        | AttributeType::Url
        | AttributeType::Date
        | AttributeType::Uuid
        | AttributeType::Secret
        | AttributeType::Password => {
            let Some(raw) = value.as_str() else {
                issues.push(ValidationIssue::new(path, "expected a string", "type"));
                return None;
            };
            let mut text = raw.to_string();
            if attribute.trim {
                text = text.trim().to_string();
            }
            if attribute.lowercase {
                text = text.to_lowercase();
            }
            if attribute.uppercase {
                text = text.to_uppercase();
            }
            validate_string(attribute, &text, path, issues);
            Some(Value::String(text))
        }
        AttributeType::Number | AttributeType::SecretNumber => {
            let Some(number) = value.as_f64() else {
                issues.push(ValidationIssue::new(path, "expected a number", "type"));
                return None;
            };
            validate_number(attribute, number, path, issues);
            Some(value.clone())
        }
        AttributeType::Integer => {
            let Some(number) = value.as_i64() else {
                issues.push(ValidationIssue::new(path, "expected an integer", "integer"));
                return None;
            };
            validate_number(attribute, number as f64, path, issues);
            Some(value.clone())
        }
        AttributeType::Boolean => {
            if !value.is_boolean() {
                issues.push(ValidationIssue::new(path, "expected a boolean", "type"));
                return None;
            }
            Some(value.clone())
        }
        AttributeType::Json | AttributeType::SecretAny => Some(value.clone()),
        AttributeType::Embedding(dimensions) => {
            let Some(items) = value.as_array() else {
                issues.push(ValidationIssue::new(path, "expected a float array", "type"));
                return None;
            };
            if items.len() != *dimensions {
                issues.push(ValidationIssue::new(
                    path,
                    format!("expected {dimensions} components, got {}", items.len()),
                    "embedding",
                ));
            }
            if !items.iter().all(Value::is_number) {
                issues.push(ValidationIssue::new(path, "components must be numbers", "embedding"));
            }
            Some(value.clone())
        }
        AttributeType::Array(items) => {
            let Some(elements) = value.as_array() else {
                issues.push(ValidationIssue::new(path, "expected an array", "type"));
                return None;
            };
            if attribute.non_empty && elements.is_empty() {
                issues.push(ValidationIssue::new(path, "array must not be empty", "empty"));
            }
            if let Some(min) = attribute.min {
                if (elements.len() as f64) < min {
                    issues.push(ValidationIssue::new(
                        path,
                        format!("array needs at least {min} items"),
                        "min",
                    ));
                }
            }
            if let Some(max) = attribute.max {
                if (elements.len() as f64) > max {
                    issues.push(ValidationIssue::new(
                        path,
                        format!("array allows at most {max} items"),
                        "max",
                    ));
                }
            }
            let mut normalized = Vec::with_capacity(elements.len());
            for (index, element) in elements.iter().enumerate() {
                let element_path = format!("{path}[{index}]");
                if let Some(v) = validate_value(items, element, &element_path, issues) {
                    normalized.push(v);
                }
            }
            Some(Value::Array(normalized))
        }
        AttributeType::Object(properties) => {
            let Some(object) = value.as_object() else {
                issues.push(ValidationIssue::new(path, "expected an object", "type"));
                return None;
            };
            let normalized = validate_object(properties, object, path, issues, false);
            Some(Value::Object(normalized))
        }
    }
}

fn validate_string(
    attribute: &CompiledAttribute,
    text: &str,
    path: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    if let Some(min) = attribute.min {
        if (text.chars().count() as f64) < min {
            issues.push(ValidationIssue::new(
                path,
                format!("length must be at least {min}"),
                "min",
            ));
        }
    }
    if let Some(max) = attribute.max {
        if (text.chars().count() as f64) > max {
            issues.push(ValidationIssue::new(
                path,
                format!("length must be at most {max}"),
                "max",
            ));
        }
    }
    if let Some(pattern) = &attribute.pattern {
        // compiled at schema build, so this cannot fail here
        if let Ok(re) = Regex::new(pattern) {
            if !re.is_match(text) {
                issues.push(ValidationIssue::new(path, "value does not match pattern", "pattern"));
            }
        }
    }
    if let Some(allowed) = &attribute.enum_values {
        if !allowed.iter().any(|v| v == text) {
            issues.push(ValidationIssue::new(
                path,
                format!("value must be one of: {}", allowed.join(", ")),
                "enum",
            ));
        }
    }
    if attribute.alphanum && !ALPHANUM_RE.is_match(text) {
        issues.push(ValidationIssue::new(path, "value must be alphanumeric", "alphanum"));
    }

    match attribute.attr_type {
        AttributeType::Email => {
            if !EMAIL_RE.is_match(text) {
                issues.push(ValidationIssue::new(path, "invalid email address", "email"));
            }
        }
        AttributeType::Url => {
            if url::Url::parse(text).is_err() {
                issues.push(ValidationIssue::new(path, "invalid URL", "url"));
            }
        }
        AttributeType::Uuid => {
            if uuid::Uuid::parse_str(text).is_err() {
                issues.push(ValidationIssue::new(path, "invalid UUID", "uuid"));
            }
        }
        AttributeType::Date => {
            if chrono::DateTime::parse_from_rfc3339(text).is_err() {
                issues.push(ValidationIssue::new(path, "invalid ISO-8601 timestamp", "date"));
            }
        }
        _ => {}
    }
}

fn validate_number(
    attribute: &CompiledAttribute,
    number: f64,
    path: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    if let Some(min) = attribute.min {
        if number < min {
            issues.push(ValidationIssue::new(path, format!("must be at least {min}"), "min"));
        }
    }
    if let Some(max) = attribute.max {
        if number > max {
            issues.push(ValidationIssue::new(path, format!("must be at most {max}"), "max"));
        }
    }
    if attribute.positive && number <= 0.0 {
        issues.push(ValidationIssue::new(path, "must be positive", "positive"));
    }
}
