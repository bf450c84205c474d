// ABOUTME: Replication orchestrator - drives one set end to end per run
// ABOUTME: Groups destinations by version, applies batches, recovers from FK rejection

use crate::applier::{ApplyOptions, ChangeApplier};
use crate::change::{Change, ChangeBatch};
use crate::config::{Mode, ReplicationSet};
use crate::fetcher::{ChangeFetcher, FetchOptions};
use crate::mssql::{self, MssqlClient};
use crate::planner;
use crate::schema::TableDesc;
use crate::version;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Emitted after a replication set completes without error.
#[derive(Debug, Clone)]
pub struct SyncedEvent {
    pub replication_set: String,
    pub version: i64,
}

/// Drives schema-inspected tables through fetch, plan, and apply for every
/// destination of one replication set.
pub struct Orchestrator<'a> {
    set: &'a ReplicationSet,
    tables: &'a [TableDesc],
    timeout: Option<Duration>,
    synced: Option<&'a UnboundedSender<SyncedEvent>>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        set: &'a ReplicationSet,
        tables: &'a [TableDesc],
        timeout: Option<Duration>,
        synced: Option<&'a UnboundedSender<SyncedEvent>>,
    ) -> Self {
        Self {
            set,
            tables,
            timeout,
            synced,
        }
    }

    /// Replicate the set once. Returns `true` when any destination hit an
    /// error; data errors never panic or abort the process.
    pub async fn replicate(&self, source: &mut MssqlClient) -> bool {
        let mut error = false;

        // Destinations sharing a version can share a batch; each group is
        // fetched and applied independently.
        let mut clients: Vec<Option<MssqlClient>> = Vec::new();
        let mut versions: Vec<(usize, i64)> = Vec::new();
        for (idx, dest) in self.set.destinations.iter().enumerate() {
            match mssql::connect_with_retry(&dest.connection_string).await {
                Ok(mut client) => {
                    match version::current_version(&mut client, self.timeout).await {
                        Ok(v) => {
                            tracing::info!("Destination '{}' is at version {}", dest.name, v);
                            versions.push((idx, v));
                        }
                        Err(e) => {
                            tracing::error!(
                                "Failed to read the version of '{}': {:#}",
                                dest.name,
                                e
                            );
                            error = true;
                        }
                    }
                    clients.push(Some(client));
                }
                Err(e) => {
                    tracing::error!("Failed to connect to '{}': {:#}", dest.name, e);
                    error = true;
                    clients.push(None);
                }
            }
        }

        let mut newest_version = None;
        for (group_version, members) in group_by_version(&versions) {
            let (group_error, applied_version) = self
                .replicate_group(source, &mut clients, group_version, &members)
                .await;
            error |= group_error;
            if let Some(v) = applied_version {
                newest_version = Some(newest_version.map_or(v, |n: i64| n.max(v)));
            }
        }

        if !error {
            if let (Some(sender), Some(version)) = (self.synced, newest_version) {
                let _ = sender.send(SyncedEvent {
                    replication_set: self.set.name.clone(),
                    version,
                });
            }
        }

        error
    }

    /// One destination group: fetch a batch for its shared version, plan it,
    /// apply it per destination, and walk the recovery ladder on foreign-key
    /// rejection.
    async fn replicate_group(
        &self,
        source: &mut MssqlClient,
        clients: &mut [Option<MssqlClient>],
        group_version: i64,
        members: &[usize],
    ) -> (bool, Option<i64>) {
        let group_cfgs: Vec<_> = members
            .iter()
            .map(|&idx| &self.set.destinations[idx])
            .collect();
        let mut fetch_options = FetchOptions {
            batch_size: group_cfgs.iter().filter_map(|d| d.batch_size).min(),
            ..FetchOptions::default()
        };
        let mut ignore_duplicates = false;
        let mut temporary_disable_all = vec![false; members.len()];
        let mut error = false;
        let mut applied_version = None;

        // Retrieve: re-entered with widened fetch options after the first
        // foreign-key rejection in the group.
        'retrieve: loop {
            let mut batch = {
                let mut fetcher = ChangeFetcher::new(source, self.timeout);
                match fetcher
                    .fetch(self.tables, group_version, &group_cfgs, &fetch_options)
                    .await
                {
                    Ok(Some(batch)) => batch,
                    Ok(None) => {
                        tracing::error!(
                            "Destination group at version {} is older than the retained \
                             change history and cannot be brought forward",
                            group_version
                        );
                        return (true, None);
                    }
                    Err(e) => {
                        tracing::error!("Failed to fetch changes: {:#}", e);
                        return (true, None);
                    }
                }
            };

            if batch.is_empty() && batch.to_version <= group_version {
                tracing::debug!(
                    "Destination group at version {} is already current",
                    group_version
                );
                return (error, Some(group_version));
            }

            let repopulating = !batch.out_of_sync_databases.is_empty();
            if repopulating {
                tracing::warn!(
                    "Replacing the batch with a full repopulation for: {}",
                    batch.out_of_sync_databases.join(", ")
                );
                batch = repopulate_plan(self.tables, &batch);
            }
            planner::plan_deferrals(&mut batch, self.tables);

            let mut position = 0;
            while position < members.len() {
                let dest_idx = members[position];
                let dest_cfg = &self.set.destinations[dest_idx];
                let Some(dest_client) = clients[dest_idx].as_mut() else {
                    position += 1;
                    continue;
                };

                if repopulating && dest_cfg.mode == Mode::Normal {
                    tracing::error!(
                        "Destination '{}' is in Normal mode, which forbids \
                         truncate-based repopulation",
                        dest_cfg.name
                    );
                    error = true;
                    position += 1;
                    continue;
                }

                let apply_options = ApplyOptions {
                    ignore_duplicate_key_inserts: ignore_duplicates,
                    force_disable_all_constraints: temporary_disable_all[position],
                };
                let mut applier = ChangeApplier::new(
                    source,
                    dest_client,
                    self.tables,
                    dest_cfg,
                    &self.set.debug_tables,
                    self.timeout,
                );

                match applier.apply(&batch, &apply_options).await {
                    Ok(()) => {
                        temporary_disable_all[position] = false;
                        applied_version = Some(batch.to_version);
                        position += 1;
                    }
                    Err(e)
                        if mssql::server_error_code(&e) == Some(mssql::ERR_FK_VIOLATION) =>
                    {
                        if !fetch_options.use_destination_version_as_min {
                            // Stage one: widen the fetch window to the
                            // destination version for every table and tolerate
                            // replayed inserts, then retry the whole group.
                            // The retry is capped at the version this batch
                            // targeted so it cannot sweep in changes committed
                            // on the source since the failed attempt.
                            tracing::warn!(
                                "Foreign key rejected on '{}'; re-fetching with the \
                                 destination version as the uniform lower bound",
                                dest_cfg.name
                            );
                            fetch_options.use_destination_version_as_min = true;
                            fetch_options.max_version = Some(batch.to_version);
                            ignore_duplicates = true;
                            continue 'retrieve;
                        } else if temporary_disable_all[position] {
                            // Both stages exhausted for this destination.
                            tracing::error!(
                                "Foreign key still rejected on '{}' with all \
                                 constraints disabled: {:#}",
                                dest_cfg.name,
                                e
                            );
                            temporary_disable_all[position] = false;
                            error = true;
                            position += 1;
                        } else {
                            // Stage two: replay this destination with every
                            // constraint disabled for the batch.
                            tracing::warn!(
                                "Foreign key rejected again on '{}'; replaying with \
                                 all constraints disabled",
                                dest_cfg.name
                            );
                            temporary_disable_all[position] = true;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to apply batch to '{}': {:#}", dest_cfg.name, e);
                        error = true;
                        position += 1;
                    }
                }
            }

            break;
        }

        // The widened-fetch switches are scoped to this group.
        (error, applied_version)
    }
}

/// Partition destinations by their current version, preserving
/// configuration order within each group.
fn group_by_version(versions: &[(usize, i64)]) -> Vec<(i64, Vec<usize>)> {
    let mut groups: Vec<(i64, Vec<usize>)> = Vec::new();
    for &(idx, version) in versions {
        match groups.iter_mut().find(|(v, _)| *v == version) {
            Some((_, members)) => members.push(idx),
            None => groups.push((version, vec![idx])),
        }
    }
    groups
}

/// One repopulate record per table, in dependency order.
fn repopulate_plan(tables: &[TableDesc], batch: &ChangeBatch) -> ChangeBatch {
    let mut plan = ChangeBatch::new(batch.to_version);
    plan.out_of_sync_versions = batch.out_of_sync_versions.clone();
    plan.out_of_sync_databases = batch.out_of_sync_databases.clone();
    for idx in 0..tables.len() {
        plan.changes.push(Change::repopulate(idx, batch.to_version));
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Operation;
    use crate::schema::tests::table;

    #[test]
    fn test_group_by_version() {
        let versions = vec![(0, 10), (1, 12), (2, 10), (3, 9)];
        let groups = group_by_version(&versions);
        assert_eq!(
            groups,
            vec![(10, vec![0, 2]), (12, vec![1]), (9, vec![3])]
        );
    }

    #[test]
    fn test_repopulate_plan_covers_every_table_in_order() {
        let tables = vec![table("dbo", "Cust", 0), table("dbo", "Ord", 1)];
        let mut batch = ChangeBatch::new(42);
        batch.out_of_sync_versions.push(7);
        batch.out_of_sync_databases.push("replica-1".to_string());

        let plan = repopulate_plan(&tables, &batch);
        assert_eq!(plan.to_version, 42);
        assert_eq!(plan.changes.len(), 2);
        assert!(plan.changes.iter().all(|c| c.op == Operation::Repopulate));
        assert_eq!(plan.changes[0].table, 0);
        assert_eq!(plan.changes[1].table, 1);
        assert_eq!(plan.out_of_sync_databases, vec!["replica-1"]);
    }
}
