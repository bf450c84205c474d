// ABOUTME: Library root for ct-replicator
// ABOUTME: Exposes the replication engine modules and their public types

pub mod applier;
pub mod change;
pub mod config;
pub mod daemon;
pub mod fetcher;
pub mod mssql;
pub mod orchestrator;
pub mod planner;
pub mod repopulate;
pub mod schema;
pub mod session;
pub mod version;

pub use change::{Change, ChangeBatch, Operation};
pub use config::{Config, DatabaseInfo, Mode, ReplicationSet};
pub use daemon::Controller;
pub use mssql::{MssqlClient, SqlValue};
pub use orchestrator::SyncedEvent;
pub use schema::{ForeignKey, TableDesc};
