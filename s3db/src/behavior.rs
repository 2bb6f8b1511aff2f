//! Behavior strategies
//!
//! A behavior decides how a record's bytes are split between object
//! metadata and object body, and whether reads need `head` or `get`.

use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use s3db_types::{deep_merge, Document, ErrorContext, S3dbError};

use crate::metadata::MetadataCodec;
use crate::schema::Schema;
use crate::storage::Metadata;

/// Reserved header carrying the count of body-resident fields.
pub const OVERFLOW_HEADER: &str = "_of";
/// Reserved header flagging a truncated record.
pub const TRUNCATED_HEADER: &str = "_t";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Behavior {
    /// Metadata only; reject records that do not fit.
    EnforceLimits,
    /// Metadata only; drop overflowing fields and flag the record.
    TruncateData,
    /// Metadata for what fits, the rest JSON-encoded in the body.
    BodyOverflow,
    /// Entire record in the body; metadata stays empty.
    BodyOnly,
    /// Metadata attempt with no safety; the store rejects over-limit puts.
    #[default]
    UserManaged,
}

impl Behavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Behavior::EnforceLimits => "enforce-limits",
            Behavior::TruncateData => "truncate-data",
            Behavior::BodyOverflow => "body-overflow",
            Behavior::BodyOnly => "body-only",
            Behavior::UserManaged => "user-managed",
        }
    }
}

impl FromStr for Behavior {
    type Err = S3dbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enforce-limits" => Ok(Behavior::EnforceLimits),
            "truncate-data" => Ok(Behavior::TruncateData),
            "body-overflow" => Ok(Behavior::BodyOverflow),
            "body-only" => Ok(Behavior::BodyOnly),
            "user-managed" => Ok(Behavior::UserManaged),
            other => Err(S3dbError::Config {
                message: format!("unknown behavior: {other}"),
            }),
        }
    }
}

/// What a behavior decided to write.
#[derive(Debug, Clone)]
pub struct WritePlan {
    pub meta: Metadata,
    pub body: Bytes,
    pub truncated: bool,
    pub overflow_count: usize,
}

impl Behavior {
    /// Split a validated document into metadata and body.
    pub fn pack(
        &self,
        codec: &MetadataCodec,
        schema: &Schema,
        document: &Document,
        reserved: usize,
        resource: &str,
    ) -> Result<WritePlan, S3dbError> {
        match self {
            Behavior::BodyOnly => {
                let body = serde_json::to_vec(&Value::Object(document.clone()))
                    .map_err(|e| S3dbError::Unknown {
                        message: format!("body encode failed: {e}"),
                        context: ErrorContext::resource(resource),
                    })?;
                Ok(WritePlan {
                    meta: Metadata::new(),
                    body: Bytes::from(body),
                    truncated: false,
                    overflow_count: 0,
                })
            }
            Behavior::UserManaged => {
                // no safety: encode everything and let the store decide
                let unbounded = MetadataCodec {
                    limit: usize::MAX,
                    ..codec.clone()
                };
                let packed = unbounded.try_serialize(schema, document, reserved);
                Ok(WritePlan {
                    meta: packed.meta,
                    body: Bytes::new(),
                    truncated: false,
                    overflow_count: 0,
                })
            }
            Behavior::EnforceLimits => {
                let packed = codec.try_serialize(schema, document, reserved);
                if !packed.fit {
                    return Err(S3dbError::MetadataLimit {
                        size: packed.serialized_size
                            + serde_json::to_string(&Value::Object(packed.overflow.clone()))
                                .map(|s| s.len())
                                .unwrap_or(0),
                        limit: codec.limit,
                        context: ErrorContext::resource(resource),
                    });
                }
                Ok(WritePlan {
                    meta: packed.meta,
                    body: Bytes::new(),
                    truncated: false,
                    overflow_count: 0,
                })
            }
            Behavior::TruncateData => {
                let packed = codec.try_serialize(schema, document, reserved);
                Ok(WritePlan {
                    meta: packed.meta,
                    body: Bytes::new(),
                    truncated: !packed.fit,
                    overflow_count: 0,
                })
            }
            Behavior::BodyOverflow => {
                let packed = codec.try_serialize(schema, document, reserved);
                let overflow_count = packed.overflow.len();
                let body = if overflow_count > 0 {
                    Bytes::from(
                        serde_json::to_vec(&Value::Object(packed.overflow.clone())).map_err(
                            |e| S3dbError::Unknown {
                                message: format!("overflow encode failed: {e}"),
                                context: ErrorContext::resource(resource),
                            },
                        )?,
                    )
                } else {
                    Bytes::new()
                };
                Ok(WritePlan {
                    meta: packed.meta,
                    body,
                    truncated: false,
                    overflow_count,
                })
            }
        }
    }

    /// Whether materializing a record needs the object body given its
    /// metadata headers.
    pub fn needs_body(&self, meta: &Metadata) -> bool {
        match self {
            Behavior::BodyOnly => true,
            Behavior::BodyOverflow => meta
                .get(OVERFLOW_HEADER)
                .and_then(|v| v.parse::<usize>().ok())
                .map(|count| count > 0)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Rebuild the logical record from metadata and (optional) body.
    pub fn unpack(
        &self,
        codec: &MetadataCodec,
        schema: &Schema,
        meta: &Metadata,
        body: Option<&[u8]>,
        resource: &str,
    ) -> Result<Document, S3dbError> {
        let parse_body = |raw: &[u8]| -> Result<Document, S3dbError> {
            let value: Value = serde_json::from_slice(raw).map_err(|e| S3dbError::Unknown {
                message: format!("body decode failed: {e}"),
                context: ErrorContext::resource(resource),
            })?;
            value.as_object().cloned().ok_or_else(|| S3dbError::Unknown {
                message: "body is not a JSON object".to_string(),
                context: ErrorContext::resource(resource),
            })
        };

        match self {
            Behavior::BodyOnly => {
                let raw = body.unwrap_or_default();
                if raw.is_empty() {
                    return Ok(Document::new());
                }
                parse_body(raw)
            }
            _ => {
                let mut document = codec.decode_record(schema, meta)?;
                if let Some(raw) = body {
                    if !raw.is_empty() {
                        deep_merge(&mut document, parse_body(raw)?);
                    }
                }
                if meta.get(TRUNCATED_HEADER).map(String::as_str) == Some("1") {
                    document.insert("_truncated".to_string(), Value::Bool(true));
                }
                Ok(document)
            }
        }
    }
}
