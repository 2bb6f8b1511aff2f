//! Plugin framework
//!
//! Plugins extend a database with background subsystems. `install` may
//! create private resources; `start` spawns any loops; `stop` must halt
//! them. The database stops plugins in reverse installation order on
//! disconnect.

use async_trait::async_trait;

use s3db_types::S3dbError;

use crate::database::Database;

pub mod coordinator;
pub mod eventual_consistency;

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called once at registration; may create private resources.
    async fn install(&self, db: &Database) -> Result<(), S3dbError>;

    /// Spawn background work. Called after `install`.
    async fn start(&self, db: &Database) -> Result<(), S3dbError>;

    /// Halt background work and release held leadership/locks best-effort.
    async fn stop(&self) -> Result<(), S3dbError>;
}
