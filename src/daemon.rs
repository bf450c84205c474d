// ABOUTME: Controller for one-shot and interval-loop replication runs
// ABOUTME: Session resumability, cancellation between sets, idle-time computation

use crate::config::{Config, ReplicationSet};
use crate::mssql;
use crate::orchestrator::{Orchestrator, SyncedEvent};
use crate::schema::{SchemaInspector, TableDesc};
use crate::session::{self, SessionMarker};
use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Runs replication sets sequentially, once or on an interval.
///
/// Table descriptors are inspected once per set and live for the process;
/// they are re-read only on restart.
pub struct Controller {
    config: Config,
    cancel: CancellationToken,
    synced: Option<UnboundedSender<SyncedEvent>>,
    session_path: PathBuf,
    schemas: HashMap<String, Vec<TableDesc>>,
}

impl Controller {
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        Self {
            config,
            cancel,
            synced: None,
            session_path: session::default_path(),
            schemas: HashMap::new(),
        }
    }

    /// Deliver a `SyncedEvent` per successful replication set to an observer.
    pub fn with_synced_events(mut self, sender: UnboundedSender<SyncedEvent>) -> Self {
        self.synced = Some(sender);
        self
    }

    pub fn with_session_path(mut self, path: PathBuf) -> Self {
        self.session_path = path;
        self
    }

    /// Execute every replication set once. Returns `true` when all of them
    /// completed without error.
    pub async fn run_once(&mut self) -> Result<bool> {
        let marker = session::load(&self.session_path).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable session marker: {:#}", e);
            SessionMarker::default()
        });

        let order = set_order(&self.config.replication_sets, &marker);
        let mut error = false;

        for idx in order {
            if self.cancel.is_cancelled() {
                tracing::info!("Cancellation requested; stopping between replication sets");
                break;
            }

            let set = self.config.replication_sets[idx].clone();
            let progress = SessionMarker {
                in_progress: true,
                destination_name: set.name.clone(),
            };
            if let Err(e) = session::save(&self.session_path, &progress) {
                tracing::warn!("Failed to write session marker: {:#}", e);
            }

            error |= self.replicate_set(&set).await;
        }

        if let Err(e) = session::clear(&self.session_path) {
            tracing::warn!("Failed to clear session marker: {:#}", e);
        }

        Ok(!error)
    }

    /// Repeat `run_once` every `Interval` seconds until cancelled.
    pub async fn run_loop(&mut self) -> Result<()> {
        let interval = self.config.interval();
        tracing::info!("Replicating every {:?}", interval);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let started = Instant::now();
            match self.run_once().await {
                Ok(true) => tracing::info!("Run completed in {:?}", started.elapsed()),
                Ok(false) => tracing::warn!("Run completed with errors"),
                Err(e) => tracing::error!("Run failed: {:#}", e),
            }

            let idle = interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }

        tracing::info!("Replication loop stopped");
        Ok(())
    }

    /// Returns `true` on error; a failing set never takes the process down.
    async fn replicate_set(&mut self, set: &ReplicationSet) -> bool {
        tracing::info!("Replicating set '{}'", set.name);
        let timeout = self.config.timeout();

        let mut source = match mssql::connect_with_retry(&set.source.connection_string).await {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(
                    "Failed to connect to source '{}': {:#}",
                    set.source.name,
                    e
                );
                return true;
            }
        };

        if !self.schemas.contains_key(&set.name) {
            let mut inspector = SchemaInspector::new(&mut source, timeout);
            match inspector.inspect(&set.tables, &set.exclude_tables).await {
                Ok(tables) => {
                    self.schemas.insert(set.name.clone(), tables);
                }
                Err(e) => {
                    tracing::error!("Skipping set '{}': {:#}", set.name, e);
                    return true;
                }
            }
        }
        let tables = &self.schemas[&set.name];

        Orchestrator::new(set, tables, timeout, self.synced.as_ref())
            .replicate(&mut source)
            .await
    }
}

/// Process sets in configuration order, rotated so that an interrupted run
/// resumes at the set named by the session marker.
fn set_order(sets: &[ReplicationSet], marker: &SessionMarker) -> Vec<usize> {
    let mut order: Vec<usize> = (0..sets.len()).collect();
    if marker.in_progress {
        if let Some(start) = sets
            .iter()
            .position(|s| s.name == marker.destination_name)
        {
            order.rotate_left(start);
            tracing::info!(
                "Resuming interrupted session at replication set '{}'",
                marker.destination_name
            );
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseInfo;
    use std::time::Duration;

    fn set(name: &str) -> ReplicationSet {
        ReplicationSet {
            name: name.to_string(),
            source: db(name),
            destinations: vec![db("d")],
            tables: Vec::new(),
            exclude_tables: Vec::new(),
            debug_tables: Vec::new(),
        }
    }

    fn db(name: &str) -> DatabaseInfo {
        DatabaseInfo {
            name: name.to_string(),
            connection_string: String::new(),
            batch_size: None,
            populate_out_of_sync: false,
            mode: Default::default(),
            table_mapping: Vec::new(),
            add_row_version_column: false,
            row_version_column_name: None,
            disable_all_constraints: None,
        }
    }

    #[test]
    fn test_set_order_without_marker() {
        let sets = vec![set("a"), set("b"), set("c")];
        assert_eq!(set_order(&sets, &SessionMarker::default()), vec![0, 1, 2]);
    }

    #[test]
    fn test_set_order_resumes_at_marked_set() {
        let sets = vec![set("a"), set("b"), set("c")];
        let marker = SessionMarker {
            in_progress: true,
            destination_name: "b".to_string(),
        };
        assert_eq!(set_order(&sets, &marker), vec![1, 2, 0]);
    }

    #[test]
    fn test_set_order_ignores_unknown_marker() {
        let sets = vec![set("a"), set("b")];
        let marker = SessionMarker {
            in_progress: true,
            destination_name: "gone".to_string(),
        };
        assert_eq!(set_order(&sets, &marker), vec![0, 1]);
    }

    #[test]
    fn test_idle_time_saturates_at_zero() {
        let interval = Duration::from_secs(30);
        assert_eq!(
            interval.saturating_sub(Duration::from_secs(45)),
            Duration::ZERO
        );
        assert_eq!(
            interval.saturating_sub(Duration::from_secs(10)),
            Duration::from_secs(20)
        );
    }
}
