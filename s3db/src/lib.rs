//! s3db — a document database layered over S3-compatible object storage
//!
//! A bucket is the data plane: records persist as objects whose
//! user-defined metadata encodes most field values, so reads are a single
//! `head`. Typed resources add schema validation, partition indexing,
//! hooks, and field encryption; plugins add eventual-consistency
//! consolidation and S3-backed leader election.

pub mod behavior;
pub mod config;
pub mod crypto;
pub mod database;
pub mod encoding;
pub mod events;
pub mod hooks;
pub mod metadata;
pub mod partition;
pub mod plugins;
pub mod query;
pub mod resource;
pub mod schema;
pub mod storage;

#[cfg(test)]
mod integration_tests;

// Public re-exports
pub use behavior::Behavior;
pub use config::ConnectionConfig;
pub use database::{Database, ResourceOptions};
pub use events::{Event, EventBus};
pub use hooks::{Hook, HookBinding, HookEvent, HookRegistry};
pub use partition::PartitionDefinition;
pub use plugins::coordinator::{CoordinatorConfig, GlobalCoordinator};
pub use plugins::eventual_consistency::{EventualConsistencyConfig, EventualConsistencyPlugin};
pub use plugins::Plugin;
pub use resource::{BatchOutcome, ListOptions, Resource, ResourceDefinition};
pub use schema::Schema;
pub use s3db_types::{Document, ErrorContext, S3dbError, ValidationIssue};
