//! Compact value codecs used by the metadata layer.

pub mod base62;
pub mod dictionary;
pub mod embedding;
