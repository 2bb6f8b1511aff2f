//! Shared string dictionary
//!
//! Resources may declare a small dictionary of frequent string values at
//! schema-definition time. The metadata codec substitutes `#nn` tokens
//! (base62 index) for exact matches. Decoding requires the same dictionary
//! version, which is stored with the schema.

use serde::{Deserialize, Serialize};

use crate::encoding::base62;

/// Versioned value dictionary shared by all records of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dictionary {
    pub version: u32,
    pub entries: Vec<String>,
}

impl Dictionary {
    pub fn new(entries: Vec<String>) -> Self {
        Self {
            version: 1,
            entries,
        }
    }

    /// Token for a value, if the dictionary contains it.
    pub fn token_for(&self, value: &str) -> Option<String> {
        let index = self.entries.iter().position(|e| e == value)?;
        let token = format!("#{}", base62::encode_u64(index as u64));
        // substitution only pays off when the token is shorter
        (token.len() < value.len()).then_some(token)
    }

    /// Resolve a `#nn` token back into its value.
    pub fn resolve(&self, token: &str) -> Option<&str> {
        let index = base62::decode_u64(token.strip_prefix('#')?)? as usize;
        self.entries.get(index).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_and_resolves() {
        let dict = Dictionary::new(vec![
            "pending".to_string(),
            "shipped".to_string(),
            "delivered".to_string(),
        ]);
        let token = dict.token_for("shipped").unwrap();
        assert_eq!(token, "#1");
        assert_eq!(dict.resolve(&token), Some("shipped"));
    }

    #[test]
    fn skips_values_shorter_than_token() {
        let dict = Dictionary::new(vec!["a".to_string()]);
        assert_eq!(dict.token_for("a"), None);
    }

    #[test]
    fn unknown_token_is_none() {
        let dict = Dictionary::new(vec!["x-long-value".to_string()]);
        assert_eq!(dict.resolve("#9"), None);
        assert_eq!(dict.resolve("nope"), None);
    }
}
