//! Query filters
//!
//! `query` scans documents (preferring a partition scope) and applies a
//! filter in memory. A filter maps attribute paths to either a literal
//! (equality) or an operator object: `$gt`, `$gte`, `$lt`, `$lte`, `$ne`,
//! `$in`, `$nin`, `$exists`, `$regex`. `$regex` is evaluated post-fetch,
//! never pushed to the store. `$increment`/`$decrement` are reserved for
//! the eventual-consistency write sugar and rejected here.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;

use s3db_types::{get_path, Document, S3dbError};

fn config_error(message: impl Into<String>) -> S3dbError {
    S3dbError::Config {
        message: message.into(),
    }
}

/// Order two JSON scalars when they are comparable.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn apply_operator(op: &str, expected: &Value, actual: Option<&Value>) -> Result<bool, S3dbError> {
    match op {
        "$exists" => {
            let wanted = expected.as_bool().unwrap_or(true);
            let exists = actual.map(|v| !v.is_null()).unwrap_or(false);
            Ok(exists == wanted)
        }
        "$ne" => Ok(actual != Some(expected)),
        "$in" => {
            let candidates = expected
                .as_array()
                .ok_or_else(|| config_error("$in expects an array"))?;
            Ok(actual.map(|v| candidates.contains(v)).unwrap_or(false))
        }
        "$nin" => {
            let candidates = expected
                .as_array()
                .ok_or_else(|| config_error("$nin expects an array"))?;
            Ok(actual.map(|v| !candidates.contains(v)).unwrap_or(true))
        }
        "$regex" => {
            let pattern = expected
                .as_str()
                .ok_or_else(|| config_error("$regex expects a string pattern"))?;
            let re = Regex::new(pattern)
                .map_err(|e| config_error(format!("invalid $regex pattern: {e}")))?;
            Ok(actual
                .and_then(Value::as_str)
                .map(|text| re.is_match(text))
                .unwrap_or(false))
        }
        "$gt" | "$gte" | "$lt" | "$lte" => {
            let Some(actual) = actual else {
                return Ok(false);
            };
            let Some(ordering) = compare(actual, expected) else {
                return Ok(false);
            };
            Ok(match op {
                "$gt" => ordering == Ordering::Greater,
                "$gte" => ordering != Ordering::Less,
                "$lt" => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            })
        }
        "$increment" | "$decrement" => Err(config_error(format!(
            "{op} is write sugar for eventual-consistency fields, not a query operator"
        ))),
        other => Err(config_error(format!("unknown query operator: {other}"))),
    }
}

/// Evaluate a filter against one document.
pub fn matches(filter: &Document, document: &Document) -> Result<bool, S3dbError> {
    for (path, condition) in filter {
        let actual = get_path(document, path);
        match condition {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                for (op, expected) in ops {
                    if !apply_operator(op, expected, actual)? {
                        return Ok(false);
                    }
                }
            }
            literal => {
                if actual != Some(literal) {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn check(filter: Value, document: Value) -> bool {
        matches(&doc(filter), &doc(document)).unwrap()
    }

    #[test]
    fn equality_and_nested_paths() {
        assert!(check(json!({"status": "open"}), json!({"status": "open"})));
        assert!(!check(json!({"status": "open"}), json!({"status": "done"})));
        assert!(check(
            json!({"address.city": "Lisbon"}),
            json!({"address": {"city": "Lisbon"}})
        ));
    }

    #[test]
    fn range_operators() {
        let record = json!({"age": 36});
        assert!(check(json!({"age": {"$gt": 30}}), record.clone()));
        assert!(check(json!({"age": {"$gte": 36}}), record.clone()));
        assert!(check(json!({"age": {"$lt": 40, "$gt": 30}}), record.clone()));
        assert!(!check(json!({"age": {"$lte": 35}}), record.clone()));
        assert!(!check(json!({"missing": {"$gt": 0}}), record));
    }

    #[test]
    fn membership_and_negation() {
        let record = json!({"state": "eu"});
        assert!(check(json!({"state": {"$in": ["eu", "us"]}}), record.clone()));
        assert!(!check(json!({"state": {"$nin": ["eu"]}}), record.clone()));
        assert!(check(json!({"state": {"$ne": "us"}}), record.clone()));
        assert!(check(json!({"other": {"$nin": ["x"]}}), record));
    }

    #[test]
    fn exists_and_regex() {
        let record = json!({"email": "ada@example.com", "nick": null});
        assert!(check(json!({"email": {"$exists": true}}), record.clone()));
        assert!(check(json!({"nick": {"$exists": false}}), record.clone()));
        assert!(check(json!({"phone": {"$exists": false}}), record.clone()));
        assert!(check(
            json!({"email": {"$regex": "^ada@"}}),
            record.clone()
        ));
        assert!(!check(json!({"email": {"$regex": "^bob@"}}), record));
    }

    #[test]
    fn reserved_and_unknown_operators_error() {
        let record = doc(json!({"clicks": 4}));
        assert!(matches(&doc(json!({"clicks": {"$increment": 1}})), &record).is_err());
        assert!(matches(&doc(json!({"clicks": {"$near": 1}})), &record).is_err());
    }

    #[test]
    fn object_literal_without_operators_is_equality() {
        let record = json!({"meta": {"a": 1}});
        assert!(check(json!({"meta": {"a": 1}}), record.clone()));
        assert!(!check(json!({"meta": {"a": 2}}), record));
    }
}
