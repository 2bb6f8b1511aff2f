//! Error taxonomy for s3db
//!
//! Every surfaced error carries a stable code, a message, and as much
//! context as the failing layer can provide (bucket/key for I/O errors,
//! resource/id/field for data-layer errors).

use thiserror::Error;

/// Context attached to an error at the point where it surfaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub resource: Option<String>,
    pub id: Option<String>,
    pub field: Option<String>,
}

impl ErrorContext {
    pub fn bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            ..Default::default()
        }
    }

    pub fn object(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn resource(resource: impl Into<String>) -> Self {
        Self {
            resource: Some(resource.into()),
            ..Default::default()
        }
    }

    pub fn record(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource: Some(resource.into()),
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(b) = &self.bucket {
            parts.push(format!("bucket={b}"));
        }
        if let Some(k) = &self.key {
            parts.push(format!("key={k}"));
        }
        if let Some(r) = &self.resource {
            parts.push(format!("resource={r}"));
        }
        if let Some(i) = &self.id {
            parts.push(format!("id={i}"));
        }
        if let Some(fl) = &self.field {
            parts.push(format!("field={fl}"));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// A single schema validation failure.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub rule: String,
}

impl ValidationIssue {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        rule: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            rule: rule.into(),
        }
    }
}

/// Error type for every fallible s3db operation.
#[derive(Debug, Error)]
pub enum S3dbError {
    #[error("validation failed for '{resource}': {issues:?}")]
    Validation {
        resource: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("no such key ({context})")]
    NoSuchKey { context: ErrorContext },

    #[error("not found ({context})")]
    NotFound { context: ErrorContext },

    #[error("access denied ({context})")]
    AccessDenied { context: ErrorContext },

    #[error("bucket not found: {bucket}")]
    BucketNotFound { bucket: String },

    #[error("metadata limit exceeded: {size} > {limit} bytes ({context})")]
    MetadataLimit {
        size: usize,
        limit: usize,
        context: ErrorContext,
    },

    #[error("encryption error: {message} ({context})")]
    Encryption {
        message: String,
        context: ErrorContext,
    },

    #[error("optimistic concurrency retries exhausted: {message} ({context})")]
    Race {
        message: String,
        context: ErrorContext,
    },

    #[error("throttled by object store ({context})")]
    Throttled { context: ErrorContext },

    #[error("lock already held ({context})")]
    LockHeld { context: ErrorContext },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown error: {message} ({context})")]
    Unknown {
        message: String,
        context: ErrorContext,
    },
}

impl S3dbError {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            S3dbError::Validation { .. } => "ValidationError",
            S3dbError::NoSuchKey { .. } => "NoSuchKey",
            S3dbError::NotFound { .. } => "NotFound",
            S3dbError::AccessDenied { .. } => "AccessDenied",
            S3dbError::BucketNotFound { .. } => "BucketNotFound",
            S3dbError::MetadataLimit { .. } => "MetadataLimitError",
            S3dbError::Encryption { .. } => "EncryptionError",
            S3dbError::Race { .. } => "RaceError",
            S3dbError::Throttled { .. } => "ThrottledError",
            S3dbError::LockHeld { .. } => "LockHeldError",
            S3dbError::Config { .. } => "ConfigError",
            S3dbError::Io(_) => "IoError",
            S3dbError::Unknown { .. } => "UnknownError",
        }
    }

    /// Human hint for resolving the error, when one exists.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            S3dbError::Validation { .. } => {
                Some("fix the listed fields and retry the operation")
            }
            S3dbError::MetadataLimit { .. } => Some(
                "shrink the record or switch the resource to the body-overflow or body-only behavior",
            ),
            S3dbError::AccessDenied { .. } => {
                Some("check the connection credentials and bucket policy")
            }
            S3dbError::BucketNotFound { .. } => {
                Some("create the bucket or fix the connection string")
            }
            S3dbError::Throttled { .. } => Some("the operation retried and gave up; back off"),
            S3dbError::Race { .. } => Some("re-read the database metadata and retry"),
            S3dbError::Encryption { .. } => {
                Some("verify the passphrase configured for secret fields")
            }
            _ => None,
        }
    }

    /// Whether a retry with backoff is reasonable for this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            S3dbError::Throttled { .. } | S3dbError::Race { .. }
        )
    }

    /// Whether the error means "the object does not exist".
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            S3dbError::NoSuchKey { .. } | S3dbError::NotFound { .. }
        )
    }
}
