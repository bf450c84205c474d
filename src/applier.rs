// ABOUTME: Change applier - plays a planned batch into one destination transaction
// ABOUTME: Statement synthesis, identity-insert toggling, constraint deferral, error recovery

use crate::change::{Change, ChangeBatch, Operation};
use crate::config::{name_matches, DatabaseInfo};
use crate::mssql::{self, MssqlClient, SqlValue};
use crate::repopulate;
use crate::schema::TableDesc;
use crate::version;
use anyhow::{Context, Result};
use std::time::Duration;

const DISABLE_ALL_CONSTRAINTS: &str =
    "EXEC sp_MSforeachtable 'ALTER TABLE ? NOCHECK CONSTRAINT ALL'";
const ENABLE_ALL_CONSTRAINTS: &str =
    "EXEC sp_MSforeachtable 'ALTER TABLE ? CHECK CONSTRAINT ALL'";

/// Per-attempt switches set by the orchestrator's recovery state machine.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Swallow duplicate-key errors on inserts (server error 2627). Set
    /// together with the uniform-lower-bound refetch, which replays rows the
    /// destination may already hold.
    pub ignore_duplicate_key_inserts: bool,
    /// Disable every destination constraint for this batch, regardless of
    /// the per-constraint plan.
    pub force_disable_all_constraints: bool,
}

/// Applies one batch to one destination under a single transaction.
///
/// The destination is assumed quiescent, so writes run under read
/// uncommitted to stay non-blocking. The version marker write shares the
/// transaction: a batch either fully commits, marker included, or fully
/// rolls back.
pub struct ChangeApplier<'a> {
    source: &'a mut MssqlClient,
    dest: &'a mut MssqlClient,
    tables: &'a [TableDesc],
    dest_cfg: &'a DatabaseInfo,
    debug_tables: &'a [String],
    timeout: Option<Duration>,
}

impl<'a> ChangeApplier<'a> {
    pub fn new(
        source: &'a mut MssqlClient,
        dest: &'a mut MssqlClient,
        tables: &'a [TableDesc],
        dest_cfg: &'a DatabaseInfo,
        debug_tables: &'a [String],
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            source,
            dest,
            tables,
            dest_cfg,
            debug_tables,
            timeout,
        }
    }

    pub async fn apply(&mut self, batch: &ChangeBatch, options: &ApplyOptions) -> Result<()> {
        self.execute("SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED")
            .await?;
        self.execute("BEGIN TRANSACTION").await?;

        let result = self.apply_inside_transaction(batch, options).await;

        match result {
            Ok(()) => {
                self.execute("COMMIT TRANSACTION").await?;
                tracing::info!(
                    "Destination '{}' advanced to version {} ({} change(s))",
                    self.dest_cfg.name,
                    batch.to_version,
                    batch.changes.len()
                );
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = self.execute("ROLLBACK TRANSACTION").await {
                    tracing::warn!(
                        "Rollback on '{}' failed: {}",
                        self.dest_cfg.name,
                        rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn apply_inside_transaction(
        &mut self,
        batch: &ChangeBatch,
        options: &ApplyOptions,
    ) -> Result<()> {
        // A repopulating batch always runs with every constraint down; the
        // per-constraint plan only covers delta batches.
        let disable_all = options.force_disable_all_constraints
            || self.dest_cfg.disable_all_constraints.unwrap_or(false)
            || batch
                .changes
                .iter()
                .any(|c| c.op == Operation::Repopulate);

        if disable_all {
            tracing::debug!("Disabling all constraints on '{}'", self.dest_cfg.name);
            self.execute(DISABLE_ALL_CONSTRAINTS).await?;
        }

        // Constraint name -> (owning table, re-enable after this creation version).
        let mut disabled: Vec<(String, usize, i64)> = Vec::new();

        for (pos, change) in batch.changes.iter().enumerate() {
            if !disable_all {
                for (name, until) in &change.deferred_constraints {
                    match disabled.iter_mut().find(|(n, _, _)| n == name) {
                        Some((_, _, existing)) => *existing = (*existing).max(*until),
                        None => {
                            let owner = self
                                .constraint_owner(name)
                                .with_context(|| format!("Unknown constraint {}", name))?;
                            self.toggle_constraint(owner, name, false).await?;
                            disabled.push((name.clone(), owner, *until));
                        }
                    }
                }
            }

            self.apply_change(change, batch, options).await?;

            if !disable_all {
                let boundary = batch
                    .changes
                    .get(pos + 1)
                    .map(|next| next.creation_version > change.creation_version)
                    .unwrap_or(false);
                if boundary && !disabled.is_empty() {
                    let mut kept = Vec::with_capacity(disabled.len());
                    for (name, owner, until) in std::mem::take(&mut disabled) {
                        if until <= change.creation_version {
                            self.toggle_constraint(owner, &name, true).await?;
                        } else {
                            kept.push((name, owner, until));
                        }
                    }
                    disabled = kept;
                }
            }
        }

        // Every deferred constraint is enforced again before the commit.
        for (name, owner, _) in disabled {
            self.toggle_constraint(owner, &name, true).await?;
        }
        if disable_all {
            self.execute(ENABLE_ALL_CONSTRAINTS).await?;
        }

        version::set_version(self.dest, batch.to_version, self.timeout).await
    }

    async fn apply_change(
        &mut self,
        change: &Change,
        batch: &ChangeBatch,
        options: &ApplyOptions,
    ) -> Result<()> {
        let table = &self.tables[change.table];
        if self
            .debug_tables
            .iter()
            .any(|p| name_matches(p, &table.schema, &table.name))
        {
            for (name, value) in change.keys.iter().chain(change.others.iter()) {
                tracing::debug!(
                    "{:?} {}: {} = {:?}",
                    change.op,
                    table.qualified_name(),
                    name,
                    value
                );
            }
        }

        match change.op {
            Operation::Insert => self.apply_insert(change, batch, options).await,
            Operation::Update => self.apply_update(change, batch).await,
            Operation::Delete => self.apply_delete(change).await,
            Operation::Repopulate => {
                repopulate::repopulate_table(
                    self.source,
                    self.dest,
                    table,
                    self.dest_cfg,
                    self.timeout,
                )
                .await?;
                Ok(())
            }
        }
    }

    async fn apply_insert(
        &mut self,
        change: &Change,
        batch: &ChangeBatch,
        options: &ApplyOptions,
    ) -> Result<()> {
        let table = &self.tables[change.table];
        let target = self.target_table(table);
        let (columns, values) = self.columns_and_values(change, batch);
        let sql = insert_sql(&target, &columns);

        if table.has_identity {
            self.execute(&format!("SET IDENTITY_INSERT {} ON", target))
                .await?;
        }

        let result = self.execute_params(&sql, &values).await;

        if table.has_identity {
            // Best effort: the session must not keep identity-insert latched
            // onto this table even when the insert itself failed.
            if let Err(e) = self
                .execute(&format!("SET IDENTITY_INSERT {} OFF", target))
                .await
            {
                tracing::warn!("Failed to clear IDENTITY_INSERT on {}: {}", target, e);
            }
        }

        match result {
            Err(e)
                if options.ignore_duplicate_key_inserts
                    && mssql::server_error_code(&e) == Some(mssql::ERR_DUPLICATE_KEY) =>
            {
                tracing::debug!("Ignoring duplicate key on insert into {}", target);
                Ok(())
            }
            other => other.with_context(|| format!("Insert into {} failed", target)),
        }
    }

    async fn apply_update(&mut self, change: &Change, batch: &ChangeBatch) -> Result<()> {
        let table = &self.tables[change.table];
        if change.others.is_empty() && !self.dest_cfg.add_row_version_column {
            // Key-only table: there is nothing to set.
            return Ok(());
        }

        let target = self.target_table(table);
        let (columns, values) = self.columns_and_values(change, batch);
        let key_count = change.keys.len();
        let sql = update_sql(&target, &columns[..key_count], &columns[key_count..]);

        match self.execute_params(&sql, &values).await {
            Err(e) if mssql::server_error_code(&e) == Some(mssql::ERR_TYPE_CLASH) => {
                // A null bound against an image column arrives untyped as
                // nvarchar and the server rejects the conversion. Substitute
                // an empty blob for the known offender and try once more.
                let Some(position) = change
                    .others
                    .iter()
                    .position(|(name, value)| name == "Contents" && value.is_null())
                else {
                    return Err(e).with_context(|| format!("Update of {} failed", target));
                };
                tracing::warn!(
                    "Retrying update of {} with empty blob for null [Contents]",
                    target
                );
                let mut retry_values = values.clone();
                retry_values[key_count + position] = SqlValue::Binary(Vec::new());
                self.execute_params(&sql, &retry_values)
                    .await
                    .with_context(|| format!("Update of {} failed after blob retry", target))
            }
            other => other.with_context(|| format!("Update of {} failed", target)),
        }
    }

    async fn apply_delete(&mut self, change: &Change) -> Result<()> {
        let table = &self.tables[change.table];
        let target = self.target_table(table);
        let key_columns: Vec<String> = change
            .keys
            .iter()
            .map(|(name, _)| self.dest_cfg.mapped_column(&table.schema, &table.name, name))
            .collect();
        let values: Vec<SqlValue> = change.keys.iter().map(|(_, v)| v.clone()).collect();
        let sql = delete_sql(&target, &key_columns);

        self.execute_params(&sql, &values)
            .await
            .with_context(|| format!("Delete from {} failed", target))
    }

    fn target_table(&self, table: &TableDesc) -> String {
        let (schema, name) = self.dest_cfg.mapped_table(&table.schema, &table.name);
        mssql::quote_table(&schema, &name)
    }

    /// Destination-side column names and values in binding order: keys first,
    /// then the remaining columns, then the optional row-version column.
    fn columns_and_values(
        &self,
        change: &Change,
        batch: &ChangeBatch,
    ) -> (Vec<String>, Vec<SqlValue>) {
        let table = &self.tables[change.table];
        let mut columns: Vec<String> = change
            .columns()
            .iter()
            .map(|c| self.dest_cfg.mapped_column(&table.schema, &table.name, c))
            .collect();
        let mut values = change.values();

        if self.dest_cfg.add_row_version_column {
            if let Some(name) = &self.dest_cfg.row_version_column_name {
                columns.push(name.clone());
                values.push(SqlValue::BigInt(batch.to_version));
            }
        }

        (columns, values)
    }

    fn constraint_owner(&self, constraint: &str) -> Option<usize> {
        self.tables
            .iter()
            .flat_map(|t| t.foreign_keys.iter())
            .find(|fk| fk.name == constraint)
            .map(|fk| fk.table)
    }

    async fn toggle_constraint(&mut self, owner: usize, name: &str, enable: bool) -> Result<()> {
        let table = &self.tables[owner];
        let (schema, table_name) = self.dest_cfg.mapped_table(&table.schema, &table.name);
        let keyword = if enable { "CHECK" } else { "NOCHECK" };
        let sql = format!(
            "ALTER TABLE {} {} CONSTRAINT {}",
            mssql::quote_table(&schema, &table_name),
            keyword,
            mssql::quote_ident(name)
        );
        tracing::debug!(
            "{} constraint {} on '{}'",
            if enable { "Enabling" } else { "Disabling" },
            name,
            self.dest_cfg.name
        );
        self.execute(&sql).await
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        let client = &mut *self.dest;
        mssql::with_timeout(self.timeout, async move {
            client.execute(sql, &[]).await?;
            Ok(())
        })
        .await
        .with_context(|| format!("Failed to execute '{}'", sql))
    }

    async fn execute_params(&mut self, sql: &str, values: &[SqlValue]) -> Result<()> {
        let client = &mut *self.dest;
        mssql::with_timeout(self.timeout, async move {
            let params = mssql::param_refs(values);
            client.execute(sql, &params).await?;
            Ok(())
        })
        .await
    }
}

fn placeholders(from: usize, count: usize) -> Vec<String> {
    (from..from + count).map(|i| format!("@P{}", i)).collect()
}

pub(crate) fn insert_sql(table: &str, columns: &[String]) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| mssql::quote_ident(c)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        quoted.join(", "),
        placeholders(1, columns.len()).join(", ")
    )
}

/// Keys bind at positions 1..K (the WHERE clause), the remaining columns at
/// K+1 onward (the SET clause), matching the change record's value order.
pub(crate) fn update_sql(table: &str, key_columns: &[String], other_columns: &[String]) -> String {
    let assignments: Vec<String> = other_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = @P{}", mssql::quote_ident(c), key_columns.len() + i + 1))
        .collect();
    let predicate: Vec<String> = key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = @P{}", mssql::quote_ident(c), i + 1))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        table,
        assignments.join(", "),
        predicate.join(" AND ")
    )
}

pub(crate) fn delete_sql(table: &str, key_columns: &[String]) -> String {
    let predicate: Vec<String> = key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = @P{}", mssql::quote_ident(c), i + 1))
        .collect();
    format!("DELETE FROM {} WHERE {}", table, predicate.join(" AND "))
}
