//! Shared types for the s3db document database
//!
//! This crate contains the document value model and the error taxonomy
//! used across the s3db ecosystem.

pub mod document;
pub mod error;

pub use document::{deep_merge, get_path, set_path, shallow_merge, Document};
pub use error::{ErrorContext, S3dbError, ValidationIssue};
