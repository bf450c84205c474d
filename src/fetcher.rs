// ABOUTME: Change fetcher - materialises typed change records from the tracking facility
// ABOUTME: Per-table CHANGETABLE joins under snapshot isolation, history-gap detection

use crate::change::{Change, ChangeBatch, Operation};
use crate::config::DatabaseInfo;
use crate::mssql::{self, MssqlClient, SqlValue};
use crate::schema::TableDesc;
use crate::version;
use anyhow::{Context, Result};
use std::time::Duration;

/// Knobs the orchestrator turns between fetch attempts.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Use the destination version uniformly as every table's lower bound,
    /// ignoring per-table minimum valid versions. Set by the recovery path
    /// to catch rows the per-table windows may have missed.
    pub use_destination_version_as_min: bool,
    /// Restrict the fetch to changes with version strictly below this bound.
    /// Set by the recovery re-fetch so a retry stays within the window the
    /// failed attempt targeted.
    pub max_version: Option<i64>,
    /// Cap on change rows fetched per table.
    pub batch_size: Option<u32>,
}

/// Fetches the net changes advancing one destination group past `from_version`.
pub struct ChangeFetcher<'a> {
    client: &'a mut MssqlClient,
    timeout: Option<Duration>,
}

impl<'a> ChangeFetcher<'a> {
    pub fn new(client: &'a mut MssqlClient, timeout: Option<Duration>) -> Self {
        Self { client, timeout }
    }

    /// Build the batch spanning `(from_version, toVersion]`.
    ///
    /// Returns `Ok(None)` when a table has fallen out of the facility's
    /// retained history and no destination in the group opted in to
    /// repopulation; the group cannot proceed.
    pub async fn fetch(
        &mut self,
        tables: &[TableDesc],
        from_version: i64,
        destinations: &[&DatabaseInfo],
        options: &FetchOptions,
    ) -> Result<Option<ChangeBatch>> {
        let facility = version::facility_version(self.client, self.timeout)
            .await?
            .context("Change tracking is not enabled on the source database")?;
        // A bounded fetch filters to versions strictly below the cap, so the
        // batch may advance destinations no further than the cap's
        // predecessor; anything at or past it belongs to the next batch.
        let to_version = match options.max_version {
            Some(bound) => facility.min(bound - 1),
            None => facility,
        };
        let mut batch = ChangeBatch::new(to_version);

        // With snapshot isolation all per-table reads observe one version
        // boundary; without it, rows committed past toVersion leak into the
        // result and are filtered out below.
        let snapshot = self.snapshot_isolation_enabled().await?;
        if snapshot {
            self.execute("SET TRANSACTION ISOLATION LEVEL SNAPSHOT").await?;
            self.execute("BEGIN TRANSACTION").await?;
        } else {
            tracing::warn!(
                "Snapshot isolation is disabled on the source; \
                 out-of-window rows will be discarded"
            );
        }

        let result = self
            .fetch_all_tables(&mut batch, tables, from_version, destinations, options, snapshot)
            .await;

        if snapshot {
            let end = if result.is_ok() { "COMMIT TRANSACTION" } else { "ROLLBACK TRANSACTION" };
            if let Err(e) = self.execute(end).await {
                tracing::warn!("Failed to end snapshot transaction: {}", e);
            }
            if let Err(e) = self
                .execute("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
                .await
            {
                tracing::warn!("Failed to restore isolation level: {}", e);
            }
        }

        if !result? {
            return Ok(None);
        }

        batch.sort_for_apply(tables);
        Ok(Some(batch))
    }

    /// Fills the batch; `Ok(false)` signals a fatal history gap.
    async fn fetch_all_tables(
        &mut self,
        batch: &mut ChangeBatch,
        tables: &[TableDesc],
        from_version: i64,
        destinations: &[&DatabaseInfo],
        options: &FetchOptions,
        snapshot: bool,
    ) -> Result<bool> {
        for (table_idx, table) in tables.iter().enumerate() {
            let start_version = if options.use_destination_version_as_min {
                from_version
            } else {
                let min_valid = self.min_valid_version(table).await?;
                if min_valid > from_version {
                    tracing::warn!(
                        "{} history starts at version {} but the destination group \
                         is at {}; the group is out of sync",
                        table.qualified_name(),
                        min_valid,
                        from_version
                    );
                    if !batch.out_of_sync_versions.contains(&from_version) {
                        batch.out_of_sync_versions.push(from_version);
                    }

                    let opted: Vec<&&DatabaseInfo> = destinations
                        .iter()
                        .filter(|d| d.populate_out_of_sync)
                        .collect();
                    if opted.is_empty() {
                        tracing::error!(
                            "No destination in the group opted in to repopulation \
                             (PopulateOutOfSync); aborting the batch"
                        );
                        return Ok(false);
                    }
                    for dest in opted {
                        if !batch.out_of_sync_databases.contains(&dest.name) {
                            batch.out_of_sync_databases.push(dest.name.clone());
                        }
                    }
                    continue;
                }
                from_version.max(min_valid)
            };

            self.fetch_table(batch, table_idx, table, start_version, options, snapshot)
                .await
                .with_context(|| {
                    format!("Failed to fetch changes for {}", table.qualified_name())
                })?;
        }
        Ok(true)
    }

    async fn fetch_table(
        &mut self,
        batch: &mut ChangeBatch,
        table_idx: usize,
        table: &TableDesc,
        start_version: i64,
        options: &FetchOptions,
        snapshot: bool,
    ) -> Result<()> {
        let sql = build_change_query(table, options.batch_size, options.max_version.is_some());

        let rows = {
            let client = &mut *self.client;
            let max_version = options.max_version.unwrap_or(0);
            mssql::with_timeout(self.timeout, async move {
                let params: Vec<&dyn tiberius::ToSql> = if options.max_version.is_some() {
                    vec![&start_version, &max_version]
                } else {
                    vec![&start_version]
                };
                Ok(client
                    .query(sql.as_str(), &params)
                    .await?
                    .into_first_result()
                    .await?)
            })
            .await?
        };

        let key_count = table.keys.len();
        for row in &rows {
            let version: i64 = row
                .try_get::<i64, _>(0)
                .ok()
                .flatten()
                .context("Change row without SYS_CHANGE_VERSION")?;
            let creation_version = row
                .try_get::<i64, _>(1)
                .ok()
                .flatten()
                .unwrap_or(version);
            let code = row.try_get::<&str, _>(2).ok().flatten().unwrap_or_default();
            let Some(op) = Operation::from_code(code.trim()) else {
                tracing::warn!(
                    "Skipping change with unknown operation code '{}' on {}",
                    code,
                    table.qualified_name()
                );
                continue;
            };

            // Without a snapshot transaction the change table can surface
            // rows committed after toVersion; they belong to a later batch.
            if !snapshot && version.min(creation_version) > batch.to_version {
                continue;
            }

            let keys: Vec<(String, SqlValue)> = table
                .keys
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), SqlValue::from_row(row, 3 + i)))
                .collect();
            let others: Vec<(String, SqlValue)> = if op == Operation::Delete {
                Vec::new()
            } else {
                table
                    .others
                    .iter()
                    .enumerate()
                    .map(|(i, name)| {
                        (name.clone(), SqlValue::from_row(row, 3 + key_count + i))
                    })
                    .collect()
            };

            batch
                .changes
                .push(Change::new(table_idx, op, version, creation_version, keys, others));
        }

        tracing::debug!(
            "Fetched {} change(s) for {} starting at version {}",
            rows.len(),
            table.qualified_name(),
            start_version
        );
        Ok(())
    }

    async fn min_valid_version(&mut self, table: &TableDesc) -> Result<i64> {
        let qualified = table.qualified_name();
        let client = &mut *self.client;
        let rows = mssql::with_timeout(self.timeout, async move {
            Ok(client
                .query(
                    "SELECT CHANGE_TRACKING_MIN_VALID_VERSION(OBJECT_ID(@P1))",
                    &[&qualified.as_str()],
                )
                .await?
                .into_first_result()
                .await?)
        })
        .await?;

        Ok(rows
            .first()
            .and_then(|r| r.try_get::<i64, _>(0).ok().flatten())
            .unwrap_or(0))
    }

    async fn snapshot_isolation_enabled(&mut self) -> Result<bool> {
        let client = &mut *self.client;
        let rows = mssql::with_timeout(self.timeout, async move {
            Ok(client
                .query(
                    "SELECT snapshot_isolation_state FROM sys.databases \
                     WHERE name = DB_NAME()",
                    &[],
                )
                .await?
                .into_first_result()
                .await?)
        })
        .await
        .context("Failed to check snapshot isolation")?;

        Ok(rows
            .first()
            .and_then(|r| r.try_get::<u8, _>(0).ok().flatten())
            .unwrap_or(0)
            == 1)
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        let client = &mut *self.client;
        mssql::with_timeout(self.timeout, async move {
            client.execute(sql, &[]).await?;
            Ok(())
        })
        .await
        .with_context(|| format!("Failed to execute '{}'", sql))
    }
}

/// Join the facility's change table with the current row data.
///
/// Deletes surface key values only; the outer join leaves the data columns
/// null. Ordering by creation version biases the stream toward the order in
/// which rows came into existence.
fn build_change_query(table: &TableDesc, batch_size: Option<u32>, with_max_version: bool) -> String {
    let quoted = table.quoted_name();
    let top = batch_size
        .map(|n| format!("TOP ({}) ", n))
        .unwrap_or_default();

    let mut select_list = vec![
        "ct.SYS_CHANGE_VERSION".to_string(),
        "ct.SYS_CHANGE_CREATION_VERSION".to_string(),
        "ct.SYS_CHANGE_OPERATION".to_string(),
    ];
    for key in &table.keys {
        select_list.push(format!("ct.{}", mssql::quote_ident(key)));
    }
    for column in &table.others {
        select_list.push(format!("t.{}", mssql::quote_ident(column)));
    }

    let join_condition: Vec<String> = table
        .keys
        .iter()
        .map(|k| {
            let quoted_key = mssql::quote_ident(k);
            format!("t.{} = ct.{}", quoted_key, quoted_key)
        })
        .collect();

    let filter = if with_max_version {
        " WHERE ct.SYS_CHANGE_VERSION < @P2"
    } else {
        ""
    };

    format!(
        "SELECT {}{} FROM CHANGETABLE(CHANGES {}, @P1) AS ct \
         LEFT OUTER JOIN {} AS t ON {}{} \
         ORDER BY ct.SYS_CHANGE_CREATION_VERSION",
        top,
        select_list.join(", "),
        quoted,
        quoted,
        join_condition.join(" AND "),
        filter
    )
}
