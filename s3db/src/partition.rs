//! Partition index
//!
//! A partition is a named secondary index materialized as extra object
//! keys under the resource prefix:
//! `resource={name}/partition={pname}/{k1}={v1}/.../id={id}`. A record is
//! indexed under a partition only when every partition field resolves to a
//! non-null value. Key components are percent-escaped so values containing
//! `/`, `=`, `?` or `&` survive the round trip.

use std::collections::BTreeMap;

use percent_encoding::{percent_decode_str, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use s3db_types::{get_path, Document};

// unreserved characters stay readable; everything else is escaped
const COMPONENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Escape one `key=value` component half.
pub fn escape(component: &str) -> String {
    percent_encoding::utf8_percent_encode(component, COMPONENT_SET).to_string()
}

/// Reverse of [`escape`].
pub fn unescape(component: &str) -> Option<String> {
    percent_decode_str(component)
        .decode_utf8()
        .ok()
        .map(|s| s.to_string())
}

/// Owner-object key for a record, relative to the database prefix.
pub fn owner_key(resource: &str, id: &str) -> String {
    format!("resource={}/id={}", escape(resource), escape(id))
}

/// Prefix under which all owner objects of a resource live.
pub fn owner_prefix(resource: &str) -> String {
    format!("resource={}/id=", escape(resource))
}

/// Prefix under which one partition's entries live.
pub fn partition_prefix(resource: &str, partition: &str) -> String {
    format!(
        "resource={}/partition={}/",
        escape(resource),
        escape(partition)
    )
}

/// Extract the record id out of any owner or partition entry key.
pub fn id_from_key(key: &str) -> Option<String> {
    key.rsplit('/')
        .next()
        .and_then(|last| last.strip_prefix("id="))
        .and_then(unescape)
}

/// One named secondary-index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDefinition {
    pub name: String,
    /// Attribute path to field type spec (e.g. `"date|maxlength:7"`).
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn render_field_value(spec: &str, value: &Value) -> Option<String> {
    let mut text = match value {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).ok()?,
    };
    for rule in spec.split('|') {
        if let Some(n) = rule.strip_prefix("maxlength:") {
            if let Ok(limit) = n.parse::<usize>() {
                text = text.chars().take(limit).collect();
            }
        }
    }
    Some(text)
}

impl PartitionDefinition {
    pub fn new(name: impl Into<String>, fields: &[(&str, &str)]) -> Self {
        Self {
            name: name.into(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            description: None,
        }
    }

    /// The `k1=v1/k2=v2` suffix for a record, or `None` when any field is
    /// null or missing (the record is simply not indexed here).
    pub fn entry_suffix(&self, document: &Document) -> Option<String> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for (field, spec) in &self.fields {
            let value = get_path(document, field)?;
            let rendered = render_field_value(spec, value)?;
            parts.push(format!("{}={}", escape(field), escape(&rendered)));
        }
        Some(parts.join("/"))
    }

    /// Full entry key for a record id, relative to the database prefix.
    pub fn entry_key(&self, resource: &str, document: &Document, id: &str) -> Option<String> {
        let suffix = self.entry_suffix(document)?;
        Some(format!(
            "{}{}/id={}",
            partition_prefix(resource, &self.name),
            suffix,
            escape(id)
        ))
    }

    /// Listing prefix for a set of concrete field values. Fields are
    /// consumed in definition order; the prefix stops at the first field
    /// the caller did not supply.
    pub fn values_prefix(&self, resource: &str, values: &Document) -> String {
        let mut prefix = partition_prefix(resource, &self.name);
        for (field, spec) in &self.fields {
            let Some(value) = values.get(field) else { break };
            let Some(rendered) = render_field_value(spec, value) else {
                break;
            };
            prefix.push_str(&format!("{}={}/", escape(field), escape(&rendered)));
        }
        prefix
    }
}

/// All partition entries a record should currently have.
pub fn current_entries(
    partitions: &[PartitionDefinition],
    document: &Document,
) -> BTreeMap<String, String> {
    partitions
        .iter()
        .filter_map(|p| p.entry_suffix(document).map(|s| (p.name.clone(), s)))
        .collect()
}

/// Diff previous vs current entry sets into `(added, removed)` pairs of
/// `(partition name, suffix)`.
pub fn diff_entries(
    previous: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> (Vec<(String, String)>, Vec<(String, String)>) {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    for (name, suffix) in current {
        if previous.get(name) != Some(suffix) {
            added.push((name.clone(), suffix.clone()));
        }
    }
    for (name, suffix) in previous {
        if current.get(name) != Some(suffix) {
            removed.push((name.clone(), suffix.clone()));
        }
    }
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn owner_keys_escape_components() {
        assert_eq!(owner_key("users", "u1"), "resource=users/id=u1");
        assert_eq!(
            owner_key("users", "a/b=c?d&e"),
            "resource=users/id=a%2Fb%3Dc%3Fd%26e"
        );
        assert_eq!(
            id_from_key("resource=users/id=a%2Fb%3Dc%3Fd%26e").as_deref(),
            Some("a/b=c?d&e")
        );
    }

    #[test]
    fn entry_suffix_requires_all_fields() {
        let partition = PartitionDefinition::new("byStatus", &[("status", "string")]);
        assert_eq!(
            partition.entry_suffix(&doc(json!({"status": "pending"}))),
            Some("status=pending".to_string())
        );
        assert_eq!(partition.entry_suffix(&doc(json!({"status": null}))), None);
        assert_eq!(partition.entry_suffix(&doc(json!({}))), None);
    }

    #[test]
    fn maxlength_truncates_dates_to_month() {
        let partition =
            PartitionDefinition::new("byMonth", &[("createdAt", "date|maxlength:7")]);
        let suffix = partition
            .entry_suffix(&doc(json!({"createdAt": "2026-08-01T10:00:00Z"})))
            .unwrap();
        assert_eq!(suffix, "createdAt=2026-08");
    }

    #[test]
    fn multi_field_entries_sort_by_field_name() {
        let partition = PartitionDefinition::new(
            "byRegionStatus",
            &[("status", "string"), ("region", "string")],
        );
        let key = partition
            .entry_key(
                "orders",
                &doc(json!({"region": "eu", "status": "open"})),
                "o1",
            )
            .unwrap();
        assert_eq!(
            key,
            "resource=orders/partition=byRegionStatus/region=eu/status=open/id=o1"
        );
    }

    #[test]
    fn values_with_reserved_characters_round_trip() {
        let partition = PartitionDefinition::new("byPath", &[("path", "string")]);
        let raw = "a/b=c?d&e";
        let suffix = partition
            .entry_suffix(&doc(json!({"path": raw})))
            .unwrap();
        assert!(!suffix.contains('?'));
        let encoded_value = suffix.strip_prefix("path=").unwrap();
        assert_eq!(unescape(encoded_value).as_deref(), Some(raw));
    }

    #[test]
    fn diff_detects_moves() {
        let previous: BTreeMap<String, String> =
            [("byStatus".to_string(), "status=pending".to_string())].into();
        let current: BTreeMap<String, String> =
            [("byStatus".to_string(), "status=shipped".to_string())].into();
        let (added, removed) = diff_entries(&previous, &current);
        assert_eq!(added, vec![("byStatus".to_string(), "status=shipped".to_string())]);
        assert_eq!(removed, vec![("byStatus".to_string(), "status=pending".to_string())]);
    }

    #[test]
    fn partial_values_prefix_stops_at_missing_field() {
        let partition = PartitionDefinition::new(
            "byRegionStatus",
            &[("region", "string"), ("status", "string")],
        );
        let full = partition.values_prefix("orders", &doc(json!({"region": "eu", "status": "x"})));
        assert_eq!(
            full,
            "resource=orders/partition=byRegionStatus/region=eu/status=x/"
        );
        let partial = partition.values_prefix("orders", &doc(json!({"region": "eu"})));
        assert_eq!(partial, "resource=orders/partition=byRegionStatus/region=eu/");
        let none = partition.values_prefix("orders", &doc(json!({})));
        assert_eq!(none, "resource=orders/partition=byRegionStatus/");
    }
}
