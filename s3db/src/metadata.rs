//! Metadata codec
//!
//! Packs typed attribute values into S3 user-metadata header values. Every
//! encoded value starts with a one-character tag naming its encoding, so
//! decoding needs no schema on the encoding dimension; the attribute map
//! still supplies names and the schema supplies semantics.
//!
//! Tags: `i` int base62, `f` fixed-point decimal, `b` boolean, `t` packed
//! timestamp, `u` uuid, `s` ascii string, `e` base64 string, `d` dictionary
//! token, `p` pipe-joined string array, `n` base62 int array, `v` packed
//! embedding, `x` secret ciphertext, `j` json base64, `z` null.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

use s3db_types::{set_path, Document, ErrorContext, S3dbError};

use crate::encoding::{base62, dictionary::Dictionary, embedding};
use crate::schema::{AttributeType, CompiledAttribute, Schema};
use crate::storage::Metadata;

/// Outcome of packing a record against the byte budget.
#[derive(Debug, Clone)]
pub struct PackedRecord {
    /// True when every attribute fit into metadata.
    pub fit: bool,
    /// Header map (short key to tagged value) for the attributes that fit.
    pub meta: Metadata,
    /// Attributes that must live in the object body, as a nested document.
    pub overflow: Document,
    /// Serialized size of `meta` in budget bytes.
    pub serialized_size: usize,
}

#[derive(Debug, Clone)]
pub struct MetadataCodec {
    pub limit: usize,
    pub embedding_scale: f64,
}

impl Default for MetadataCodec {
    fn default() -> Self {
        Self {
            limit: crate::config::DEFAULT_METADATA_LIMIT,
            embedding_scale: embedding::DEFAULT_SCALE,
        }
    }
}

fn is_header_safe(text: &str) -> bool {
    text.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

fn header_cost(key: &str, value: &str) -> usize {
    key.len() + value.len() + 2
}

fn json_fallback(value: &Value) -> String {
    format!(
        "j{}",
        BASE64.encode(serde_json::to_vec(value).expect("Value always serializes"))
    )
}

fn decode_error(message: impl Into<String>) -> S3dbError {
    S3dbError::Unknown {
        message: message.into(),
        context: ErrorContext::default(),
    }
}

impl MetadataCodec {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    /// Encode one value, choosing the smallest safe encoding for its type.
    pub fn encode_value(
        &self,
        value: &Value,
        attribute: Option<&CompiledAttribute>,
        dictionary: Option<&Dictionary>,
    ) -> String {
        match value {
            Value::Null => "z".to_string(),
            Value::Bool(b) => format!("b{}", if *b { "1" } else { "0" }),
            Value::Number(n) => self.encode_number(n),
            Value::String(text) => self.encode_string(text, attribute, dictionary),
            Value::Array(items) => self.encode_array(items, attribute),
            Value::Object(_) => json_fallback(value),
        }
    }

    fn encode_number(&self, n: &Number) -> String {
        if let Some(i) = n.as_i64() {
            return format!("i{}", base62::encode_i64(i));
        }
        if let Some(v) = n.as_f64() {
            let scaled = (v * embedding::DEFAULT_SCALE).round();
            if scaled.abs() < (i64::MAX as f64) && scaled / embedding::DEFAULT_SCALE == v {
                return format!("f{}", base62::encode_i64(scaled as i64));
            }
        }
        json_fallback(&Value::Number(n.clone()))
    }

    fn encode_string(
        &self,
        text: &str,
        attribute: Option<&CompiledAttribute>,
        dictionary: Option<&Dictionary>,
    ) -> String {
        if let Some(attribute) = attribute {
            match &attribute.attr_type {
                t if t.is_secret() => return format!("x{text}"),
                AttributeType::Date => {
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                        return format!("t{}", base62::encode_i64(parsed.timestamp_millis()));
                    }
                }
                AttributeType::Uuid => {
                    if let Ok(id) = uuid::Uuid::parse_str(text) {
                        return format!("u{}", base62::encode_bytes(id.as_bytes()));
                    }
                }
                _ => {}
            }
        }
        if let Some(dictionary) = dictionary {
            if let Some(token) = dictionary.token_for(text) {
                return format!("d{token}");
            }
        }
        if is_header_safe(text) {
            format!("s{text}")
        } else {
            format!("e{}", BASE64.encode(text.as_bytes()))
        }
    }

    fn encode_array(&self, items: &[Value], attribute: Option<&CompiledAttribute>) -> String {
        if let Some(CompiledAttribute {
            attr_type: AttributeType::Embedding(_),
            ..
        }) = attribute
        {
            if let Some(floats) = items
                .iter()
                .map(Value::as_f64)
                .collect::<Option<Vec<f64>>>()
            {
                return format!("v{}", embedding::pack(&floats, self.embedding_scale));
            }
        }
        if !items.is_empty() {
            if let Some(ints) = items.iter().map(Value::as_i64).collect::<Option<Vec<i64>>>() {
                let joined: Vec<String> = ints.iter().map(|i| base62::encode_i64(*i)).collect();
                return format!("n{}", joined.join("_"));
            }
        }
        let all_plain_strings = items.iter().all(|v| {
            v.as_str()
                .map(|s| !s.is_empty() && is_header_safe(s) && !s.contains('|'))
                .unwrap_or(false)
        });
        if all_plain_strings {
            let joined: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            return format!("p{}", joined.join("|"));
        }
        json_fallback(&Value::Array(items.to_vec()))
    }

    /// Decode one tagged value.
    pub fn decode_value(
        &self,
        encoded: &str,
        dictionary: Option<&Dictionary>,
    ) -> Result<Value, S3dbError> {
        let mut chars = encoded.chars();
        let tag = chars
            .next()
            .ok_or_else(|| decode_error("empty metadata value"))?;
        let rest = chars.as_str();
        match tag {
            'z' => Ok(Value::Null),
            'b' => match rest {
                "1" => Ok(Value::Bool(true)),
                "0" => Ok(Value::Bool(false)),
                other => Err(decode_error(format!("invalid boolean payload: {other}"))),
            },
            'i' => base62::decode_i64(rest)
                .map(|i| Value::Number(i.into()))
                .ok_or_else(|| decode_error(format!("invalid base62 integer: {rest}"))),
            'f' => {
                let scaled = base62::decode_i64(rest)
                    .ok_or_else(|| decode_error(format!("invalid fixed-point payload: {rest}")))?;
                let number = Number::from_f64(scaled as f64 / embedding::DEFAULT_SCALE)
                    .ok_or_else(|| decode_error("fixed-point payload is not finite"))?;
                Ok(Value::Number(number))
            }
            't' => {
                let millis = base62::decode_i64(rest)
                    .ok_or_else(|| decode_error(format!("invalid timestamp payload: {rest}")))?;
                let when = DateTime::<Utc>::from_timestamp_millis(millis)
                    .ok_or_else(|| decode_error("timestamp out of range"))?;
                let text = if millis % 1000 == 0 {
                    when.to_rfc3339_opts(SecondsFormat::Secs, true)
                } else {
                    when.to_rfc3339_opts(SecondsFormat::Millis, true)
                };
                Ok(Value::String(text))
            }
            'u' => {
                let bytes = base62::decode_16_bytes(rest)
                    .ok_or_else(|| decode_error(format!("invalid uuid payload: {rest}")))?;
                Ok(Value::String(uuid::Uuid::from_bytes(bytes).to_string()))
            }
            's' | 'x' => Ok(Value::String(rest.to_string())),
            'e' => {
                let raw = BASE64
                    .decode(rest)
                    .map_err(|_| decode_error("invalid base64 string payload"))?;
                String::from_utf8(raw)
                    .map(Value::String)
                    .map_err(|_| decode_error("string payload is not UTF-8"))
            }
            'd' => {
                let dictionary =
                    dictionary.ok_or_else(|| decode_error("dictionary token without dictionary"))?;
                dictionary
                    .resolve(rest)
                    .map(|v| Value::String(v.to_string()))
                    .ok_or_else(|| decode_error(format!("unknown dictionary token: {rest}")))
            }
            'p' => {
                if rest.is_empty() {
                    return Ok(Value::Array(Vec::new()));
                }
                Ok(Value::Array(
                    rest.split('|').map(|s| Value::String(s.to_string())).collect(),
                ))
            }
            'n' => {
                if rest.is_empty() {
                    return Ok(Value::Array(Vec::new()));
                }
                rest.split('_')
                    .map(|part| {
                        base62::decode_i64(part)
                            .map(|i| Value::Number(i.into()))
                            .ok_or_else(|| decode_error(format!("invalid int array item: {part}")))
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            'v' => {
                let floats = embedding::unpack(rest, self.embedding_scale)
                    .ok_or_else(|| decode_error("invalid embedding payload"))?;
                Ok(Value::Array(
                    floats
                        .into_iter()
                        .filter_map(Number::from_f64)
                        .map(Value::Number)
                        .collect(),
                ))
            }
            'j' => {
                let raw = BASE64
                    .decode(rest)
                    .map_err(|_| decode_error("invalid base64 json payload"))?;
                serde_json::from_slice(&raw).map_err(|e| decode_error(format!("invalid json payload: {e}")))
            }
            other => Err(decode_error(format!("unknown metadata tag: {other}"))),
        }
    }

    /// Flatten a document into `(dot path, value)` pairs that exist in the
    /// schema's attribute map. Arrays (including arrays of objects) stay
    /// whole; nested plain objects split into leaf paths.
    pub fn flatten(&self, schema: &Schema, document: &Document) -> Vec<(String, Value)> {
        let mut flat = Vec::new();
        for (name, value) in document {
            if schema.attribute_at(name).is_none() {
                continue;
            }
            self.flatten_into(schema, name, value, &mut flat);
        }
        flat
    }

    fn flatten_into(
        &self,
        schema: &Schema,
        path: &str,
        value: &Value,
        out: &mut Vec<(String, Value)>,
    ) {
        let is_object_attr = matches!(
            schema.attribute_at(path),
            Some(CompiledAttribute {
                attr_type: AttributeType::Object(_),
                ..
            })
        );
        match value {
            Value::Object(map) if is_object_attr => {
                for (name, child) in map {
                    let child_path = format!("{path}.{name}");
                    if schema.attribute_at(&child_path).is_some() {
                        self.flatten_into(schema, &child_path, child, out);
                    }
                }
            }
            other => out.push((path.to_string(), other.clone())),
        }
    }

    /// Pack a validated document under the byte budget. `reserved` is the
    /// size already consumed by runtime headers (`_v`, `_ps`, ...).
    pub fn try_serialize(
        &self,
        schema: &Schema,
        document: &Document,
        reserved: usize,
    ) -> PackedRecord {
        let flat = self.flatten(schema, document);

        // deterministic packing order: attribute-map (sorted) order
        let mut by_key: BTreeMap<String, (String, Value)> = BTreeMap::new();
        for (name, value) in flat {
            if let Some(key) = schema.map.key_for(&name) {
                by_key.insert(key.to_string(), (name, value));
            }
        }

        let mut meta = Metadata::new();
        let mut overflow = Document::new();
        let mut size = reserved;
        let mut fit = true;

        for (key, (name, value)) in by_key {
            let attribute = schema.attribute_at(&name);
            let encoded = self.encode_value(&value, attribute, schema.dictionary.as_ref());
            let cost = header_cost(&key, &encoded);
            if size + cost <= self.limit {
                size += cost;
                meta.insert(key, encoded);
            } else {
                fit = false;
                set_path(&mut overflow, &name, value);
            }
        }

        PackedRecord {
            fit,
            meta,
            overflow,
            serialized_size: size,
        }
    }

    /// Rebuild a nested document from a short-key header map. Reserved
    /// (`_`-prefixed) headers are ignored.
    pub fn decode_record(&self, schema: &Schema, meta: &Metadata) -> Result<Document, S3dbError> {
        let mut document = Document::new();
        let mut keys: Vec<&String> = meta.keys().collect();
        keys.sort();
        for key in keys {
            if key.starts_with('_') {
                continue;
            }
            let name = schema
                .map
                .name_for(key)
                .ok_or_else(|| decode_error(format!("unknown short key in metadata: {key}")))?;
            let value = self.decode_value(&meta[key], schema.dictionary.as_ref())?;
            set_path(&mut document, name, value);
        }
        Ok(document)
    }
}
