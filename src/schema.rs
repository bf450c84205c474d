// ABOUTME: Schema inspector for the replicated table set
// ABOUTME: Reads catalog metadata, orders tables by FK dependency, flags untracked tables

use crate::config::name_matches;
use crate::mssql::{self, MssqlClient};
use anyhow::{bail, Context, Result};
use std::time::Duration;

/// One foreign-key column edge. Multi-column constraints appear as parallel
/// entries sharing a name. Tables are referenced by index into the
/// inspector's output list rather than by pointer.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub name: String,
    /// Index of the owning table.
    pub table: usize,
    pub column: String,
    /// Index of the referenced table.
    pub referenced_table: usize,
    pub referenced_column: String,
}

/// A unique index or constraint that is not the primary key.
#[derive(Debug, Clone)]
pub struct UniqueConstraint {
    pub name: String,
    pub columns: Vec<String>,
}

/// Everything the engine needs to know about one replicated table.
#[derive(Debug, Clone)]
pub struct TableDesc {
    pub schema: String,
    pub name: String,
    /// Primary-key columns in key order.
    pub keys: Vec<String>,
    /// Remaining non-computed, non-rowversion columns in catalog order.
    pub others: Vec<String>,
    /// Whether inserts must run under IDENTITY_INSERT.
    pub has_identity: bool,
    /// Outgoing foreign keys (this table is the owner).
    pub foreign_keys: Vec<ForeignKey>,
    pub unique_constraints: Vec<UniqueConstraint>,
    /// Oldest facility version still queryable for this table, as of inspection.
    pub min_valid_version: i64,
    /// Position in the dependency ordering; referenced tables sort lower.
    pub dependency_order: usize,
}

impl TableDesc {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn quoted_name(&self) -> String {
        mssql::quote_table(&self.schema, &self.name)
    }
}

/// A foreign-key row as read from the catalog, before tables are ordered
/// and the edge can be resolved to indices.
#[derive(Debug, Clone)]
struct RawForeignKey {
    name: String,
    owner: String,
    column: String,
    referenced: String,
    referenced_column: String,
}

/// Reads the replicated schema from the source catalog.
pub struct SchemaInspector<'a> {
    client: &'a mut MssqlClient,
    timeout: Option<Duration>,
}

impl<'a> SchemaInspector<'a> {
    pub fn new(client: &'a mut MssqlClient, timeout: Option<Duration>) -> Self {
        Self { client, timeout }
    }

    /// Produce one descriptor per tracked table in the effective set, in
    /// dependency order.
    ///
    /// `include` empty means every tracked table. Both lists match
    /// fully-qualified or table-only names with brackets stripped. A table in
    /// the effective set without change tracking is fatal; the error carries
    /// the ALTER statements an operator would run to enable tracking.
    pub async fn inspect(
        &mut self,
        include: &[String],
        exclude: &[String],
    ) -> Result<Vec<TableDesc>> {
        self.verify_tracking_enabled().await?;

        let tracked = self.tracked_tables().await?;
        let all_tables = self.all_tables().await?;

        let selected = select_tables(&tracked, &all_tables, include, exclude)?;
        if selected.is_empty() {
            bail!("No tracked tables matched the configured table list");
        }

        let mut tables = Vec::with_capacity(selected.len());
        for (schema, name, min_valid_version) in selected {
            let desc = self.describe_table(schema, name, min_valid_version).await?;
            tables.push(desc);
        }

        let raw_fks = self.foreign_keys().await?;
        let tables = order_by_dependency(tables, &raw_fks)?;

        tracing::info!(
            "Inspected {} tracked tables: {}",
            tables.len(),
            tables
                .iter()
                .map(|t| t.qualified_name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(tables)
    }

    async fn verify_tracking_enabled(&mut self) -> Result<()> {
        let rows = self
            .query("SELECT CHANGE_TRACKING_CURRENT_VERSION()", &[])
            .await
            .context("Failed to query the change tracking version")?;

        let enabled = rows
            .first()
            .and_then(|r| r.try_get::<i64, _>(0).ok().flatten())
            .is_some();
        if !enabled {
            bail!(
                "Change tracking is not enabled on the source database. \
                 Run: ALTER DATABASE CURRENT SET CHANGE_TRACKING = ON \
                 (CHANGE_RETENTION = 2 DAYS, AUTO_CLEANUP = ON)"
            );
        }
        Ok(())
    }

    /// Tracked tables with their minimum valid version, in catalog order.
    async fn tracked_tables(&mut self) -> Result<Vec<(String, String, i64)>> {
        let rows = self
            .query(
                "SELECT s.name, t.name, \
                        CHANGE_TRACKING_MIN_VALID_VERSION(t.object_id) \
                 FROM sys.change_tracking_tables ctt \
                 JOIN sys.tables t ON t.object_id = ctt.object_id \
                 JOIN sys.schemas s ON s.schema_id = t.schema_id \
                 ORDER BY t.object_id",
                &[],
            )
            .await
            .context("Failed to list change-tracked tables")?;

        Ok(rows
            .iter()
            .map(|r| {
                (
                    r.get::<&str, _>(0).unwrap_or_default().to_string(),
                    r.get::<&str, _>(1).unwrap_or_default().to_string(),
                    r.try_get::<i64, _>(2).ok().flatten().unwrap_or(0),
                )
            })
            .collect())
    }

    async fn all_tables(&mut self) -> Result<Vec<(String, String)>> {
        let rows = self
            .query(
                "SELECT s.name, t.name \
                 FROM sys.tables t \
                 JOIN sys.schemas s ON s.schema_id = t.schema_id \
                 ORDER BY t.object_id",
                &[],
            )
            .await
            .context("Failed to list tables")?;

        Ok(rows
            .iter()
            .map(|r| {
                (
                    r.get::<&str, _>(0).unwrap_or_default().to_string(),
                    r.get::<&str, _>(1).unwrap_or_default().to_string(),
                )
            })
            .collect())
    }

    async fn describe_table(
        &mut self,
        schema: String,
        name: String,
        min_valid_version: i64,
    ) -> Result<TableDesc> {
        let qualified = format!("{}.{}", schema, name);

        let key_rows = self
            .query(
                "SELECT c.name \
                 FROM sys.indexes i \
                 JOIN sys.index_columns ic \
                   ON ic.object_id = i.object_id AND ic.index_id = i.index_id \
                 JOIN sys.columns c \
                   ON c.object_id = ic.object_id AND c.column_id = ic.column_id \
                 WHERE i.object_id = OBJECT_ID(@P1) AND i.is_primary_key = 1 \
                 ORDER BY ic.key_ordinal",
                &[&qualified.as_str()],
            )
            .await
            .with_context(|| format!("Failed to read primary key of {}", qualified))?;
        let keys: Vec<String> = key_rows
            .iter()
            .filter_map(|r| r.get::<&str, _>(0).map(str::to_string))
            .collect();
        if keys.is_empty() {
            bail!("Table {} has no primary key", qualified);
        }

        // Computed columns and rowversion columns cannot be written and are
        // left out of the replicated column set.
        let column_rows = self
            .query(
                "SELECT c.name, c.is_identity \
                 FROM sys.columns c \
                 JOIN sys.types ty ON ty.user_type_id = c.user_type_id \
                 WHERE c.object_id = OBJECT_ID(@P1) \
                   AND c.is_computed = 0 \
                   AND ty.name NOT IN (N'timestamp', N'rowversion') \
                 ORDER BY c.column_id",
                &[&qualified.as_str()],
            )
            .await
            .with_context(|| format!("Failed to read columns of {}", qualified))?;

        let mut others = Vec::new();
        let mut has_identity = false;
        for row in &column_rows {
            let column = row.get::<&str, _>(0).unwrap_or_default().to_string();
            if row.try_get::<bool, _>(1).ok().flatten().unwrap_or(false) {
                has_identity = true;
            }
            if !keys.iter().any(|k| k.eq_ignore_ascii_case(&column)) {
                others.push(column);
            }
        }

        let unique_rows = self
            .query(
                "SELECT i.name, c.name \
                 FROM sys.indexes i \
                 JOIN sys.index_columns ic \
                   ON ic.object_id = i.object_id AND ic.index_id = i.index_id \
                 JOIN sys.columns c \
                   ON c.object_id = ic.object_id AND c.column_id = ic.column_id \
                 WHERE i.object_id = OBJECT_ID(@P1) \
                   AND i.is_unique = 1 AND i.is_primary_key = 0 \
                 ORDER BY i.index_id, ic.key_ordinal",
                &[&qualified.as_str()],
            )
            .await
            .with_context(|| format!("Failed to read unique indexes of {}", qualified))?;

        let mut unique_constraints: Vec<UniqueConstraint> = Vec::new();
        for row in &unique_rows {
            let index = row.get::<&str, _>(0).unwrap_or_default().to_string();
            let column = row.get::<&str, _>(1).unwrap_or_default().to_string();
            match unique_constraints.iter_mut().find(|u| u.name == index) {
                Some(u) => u.columns.push(column),
                None => unique_constraints.push(UniqueConstraint {
                    name: index,
                    columns: vec![column],
                }),
            }
        }

        Ok(TableDesc {
            schema,
            name,
            keys,
            others,
            has_identity,
            foreign_keys: Vec::new(),
            unique_constraints,
            min_valid_version,
            dependency_order: 0,
        })
    }

    /// Enabled foreign-key column edges across the whole database.
    /// Disabled constraints carry no enforcement and are left out.
    async fn foreign_keys(&mut self) -> Result<Vec<RawForeignKey>> {
        let rows = self
            .query(
                "SELECT fk.name, \
                        ss.name + N'.' + st.name, sc.name, \
                        rs.name + N'.' + rt.name, rc.name \
                 FROM sys.foreign_keys fk \
                 JOIN sys.foreign_key_columns fkc \
                   ON fkc.constraint_object_id = fk.object_id \
                 JOIN sys.tables st ON st.object_id = fk.parent_object_id \
                 JOIN sys.schemas ss ON ss.schema_id = st.schema_id \
                 JOIN sys.columns sc \
                   ON sc.object_id = fkc.parent_object_id \
                  AND sc.column_id = fkc.parent_column_id \
                 JOIN sys.tables rt ON rt.object_id = fk.referenced_object_id \
                 JOIN sys.schemas rs ON rs.schema_id = rt.schema_id \
                 JOIN sys.columns rc \
                   ON rc.object_id = fkc.referenced_object_id \
                  AND rc.column_id = fkc.referenced_column_id \
                 WHERE fk.is_disabled = 0 \
                 ORDER BY fk.name, fkc.constraint_column_id",
                &[],
            )
            .await
            .context("Failed to read foreign keys")?;

        Ok(rows
            .iter()
            .map(|r| RawForeignKey {
                name: r.get::<&str, _>(0).unwrap_or_default().to_string(),
                owner: r.get::<&str, _>(1).unwrap_or_default().to_string(),
                column: r.get::<&str, _>(2).unwrap_or_default().to_string(),
                referenced: r.get::<&str, _>(3).unwrap_or_default().to_string(),
                referenced_column: r.get::<&str, _>(4).unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[&dyn tiberius::ToSql],
    ) -> Result<Vec<tiberius::Row>> {
        let client = &mut *self.client;
        mssql::with_timeout(self.timeout, async move {
            Ok(client.query(sql, params).await?.into_first_result().await?)
        })
        .await
    }
}

/// Apply include/exclude lists and surface untracked tables as a fatal error
/// carrying remediation statements.
fn select_tables(
    tracked: &[(String, String, i64)],
    all_tables: &[(String, String)],
    include: &[String],
    exclude: &[String],
) -> Result<Vec<(String, String, i64)>> {
    let excluded = |schema: &str, table: &str| {
        exclude.iter().any(|p| name_matches(p, schema, table))
    };

    if include.is_empty() {
        return Ok(tracked
            .iter()
            .filter(|(s, t, _)| !excluded(s, t))
            .cloned()
            .collect());
    }

    let mut selected = Vec::new();
    let mut untracked = Vec::new();
    for pattern in include {
        let mut matched = false;
        for (schema, table) in all_tables {
            if !name_matches(pattern, schema, table) || excluded(schema, table) {
                continue;
            }
            matched = true;
            match tracked
                .iter()
                .find(|(s, t, _)| s == schema && t == table)
            {
                Some(entry) => {
                    if !selected
                        .iter()
                        .any(|(s, t, _): &(String, String, i64)| s == schema && t == table)
                    {
                        selected.push(entry.clone());
                    }
                }
                None => untracked.push((schema.clone(), table.clone())),
            }
        }
        if !matched {
            tracing::warn!("Configured table '{}' matched no table on the source", pattern);
        }
    }

    if !untracked.is_empty() {
        let remediation: Vec<String> = untracked
            .iter()
            .map(|(s, t)| {
                format!(
                    "ALTER TABLE {} ENABLE CHANGE_TRACKING WITH (TRACK_COLUMNS_UPDATED = OFF)",
                    mssql::quote_table(s, t)
                )
            })
            .collect();
        bail!(
            "Change tracking is not enabled on {} configured table(s). To enable:\n{}",
            untracked.len(),
            remediation.join("\n")
        );
    }

    Ok(selected)
}

/// Order tables so that every referenced table precedes its referencing
/// tables, assign `dependency_order`, and resolve FK edges to indices.
///
/// Each table is inserted just before the leftmost already-placed table that
/// references it, which keeps the ordering stable for unrelated tables. A
/// cycle in the FK graph cannot satisfy the ordering and is fatal.
fn order_by_dependency(
    tables: Vec<TableDesc>,
    raw_fks: &[RawForeignKey],
) -> Result<Vec<TableDesc>> {
    // x references t when x owns an FK pointing at t.
    let references = |x: &TableDesc, t: &TableDesc| {
        raw_fks
            .iter()
            .any(|fk| fk.owner == x.qualified_name() && fk.referenced == t.qualified_name())
    };

    let mut ordered: Vec<TableDesc> = Vec::with_capacity(tables.len());
    for table in tables {
        let position = ordered.iter().position(|placed| references(placed, &table));
        match position {
            Some(idx) => ordered.insert(idx, table),
            None => ordered.push(table),
        }
    }

    for (idx, table) in ordered.iter_mut().enumerate() {
        table.dependency_order = idx;
    }

    // Resolve edges whose endpoints are both in the replicated set.
    let index_of = |qualified: &str| {
        ordered
            .iter()
            .position(|t| t.qualified_name() == qualified)
    };
    let mut resolved: Vec<ForeignKey> = Vec::new();
    for fk in raw_fks {
        let (Some(owner), Some(referenced)) = (index_of(&fk.owner), index_of(&fk.referenced))
        else {
            continue;
        };
        if ordered[owner].dependency_order <= ordered[referenced].dependency_order {
            bail!(
                "Foreign key cycle detected in the replicated schema involving \
                 constraint {} ({} -> {})",
                fk.name,
                fk.owner,
                fk.referenced
            );
        }
        resolved.push(ForeignKey {
            name: fk.name.clone(),
            table: owner,
            column: fk.column.clone(),
            referenced_table: referenced,
            referenced_column: fk.referenced_column.clone(),
        });
    }
    for fk in resolved {
        ordered[fk.table].foreign_keys.push(fk);
    }

    Ok(ordered)
}
