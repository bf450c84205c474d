// ABOUTME: Repopulate engine - truncate-and-reseed for destinations behind the history horizon
// ABOUTME: Full sweep delete, then re-insert every source row in creation-biased order

use crate::config::DatabaseInfo;
use crate::mssql::{self, MssqlClient, SqlValue};
use crate::schema::TableDesc;
use anyhow::{Context, Result};
use std::time::Duration;

/// Wipe one destination table and reseed it from the source.
///
/// Runs inside the applier's transaction, with every destination constraint
/// already disabled for the span of the flush. Ordering by `CreatedOn` when
/// the table has such a column biases inserts toward creation order, which
/// keeps most parent rows ahead of their children.
pub async fn repopulate_table(
    source: &mut MssqlClient,
    dest: &mut MssqlClient,
    table: &TableDesc,
    dest_cfg: &DatabaseInfo,
    timeout: Option<Duration>,
) -> Result<u64> {
    let (target_schema, target_name) = dest_cfg.mapped_table(&table.schema, &table.name);
    let target = mssql::quote_table(&target_schema, &target_name);

    tracing::info!(
        "Repopulating {} on '{}' from {}",
        target,
        dest_cfg.name,
        table.qualified_name()
    );

    mssql::with_timeout(timeout, async {
        dest.execute(format!("DELETE FROM {}", target).as_str(), &[])
            .await?;
        Ok(())
    })
    .await
    .with_context(|| format!("Failed to clear {}", target))?;

    if table.has_identity {
        mssql::with_timeout(timeout, async {
            dest.execute(format!("SET IDENTITY_INSERT {} ON", target).as_str(), &[])
                .await?;
            Ok(())
        })
        .await?;
    }

    let result = copy_rows(source, dest, table, dest_cfg, &target, timeout).await;

    if table.has_identity {
        let off = mssql::with_timeout(timeout, async {
            dest.execute(format!("SET IDENTITY_INSERT {} OFF", target).as_str(), &[])
                .await?;
            Ok(())
        })
        .await;
        if let Err(e) = off {
            tracing::warn!("Failed to clear IDENTITY_INSERT on {}: {}", target, e);
        }
    }

    let inserted = result?;
    tracing::info!("Repopulated {} with {} row(s)", target, inserted);
    Ok(inserted)
}

async fn copy_rows(
    source: &mut MssqlClient,
    dest: &mut MssqlClient,
    table: &TableDesc,
    dest_cfg: &DatabaseInfo,
    target: &str,
    timeout: Option<Duration>,
) -> Result<u64> {
    let select = select_sql(table);
    let rows = mssql::with_timeout(timeout, async {
        Ok(source
            .query(select.as_str(), &[])
            .await?
            .into_first_result()
            .await?)
    })
    .await
    .with_context(|| format!("Failed to read {} for repopulation", table.qualified_name()))?;

    let columns: Vec<String> = table
        .keys
        .iter()
        .chain(table.others.iter())
        .map(|c| dest_cfg.mapped_column(&table.schema, &table.name, c))
        .collect();
    let insert = crate::applier::insert_sql(target, &columns);

    let mut inserted = 0u64;
    for row in &rows {
        let values: Vec<SqlValue> = (0..columns.len())
            .map(|idx| SqlValue::from_row(row, idx))
            .collect();
        mssql::with_timeout(timeout, async {
            let params = mssql::param_refs(&values);
            dest.execute(insert.as_str(), &params).await?;
            Ok(())
        })
        .await
        .with_context(|| format!("Failed to reseed a row into {}", target))?;
        inserted += 1;
    }

    Ok(inserted)
}

/// All replicated columns of the source table, keys first, ordered for
/// creation-biased insertion.
fn select_sql(table: &TableDesc) -> String {
    let columns: Vec<String> = table
        .keys
        .iter()
        .chain(table.others.iter())
        .map(|c| mssql::quote_ident(c))
        .collect();

    let mut order_by: Vec<String> = Vec::new();
    if table
        .others
        .iter()
        .chain(table.keys.iter())
        .any(|c| c.eq_ignore_ascii_case("CreatedOn"))
    {
        order_by.push("[CreatedOn]".to_string());
    }
    order_by.extend(table.keys.iter().map(|c| mssql::quote_ident(c)));

    format!(
        "SELECT {} FROM {} ORDER BY {}",
        columns.join(", "),
        table.quoted_name(),
        order_by.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::table;

    #[test]
    fn test_select_orders_by_keys() {
        let mut t = table("dbo", "Orders", 0);
        t.others = vec!["Total".to_string()];
        assert_eq!(
            select_sql(&t),
            "SELECT [Id], [Total] FROM [dbo].[Orders] ORDER BY [Id]"
        );
    }

    #[test]
    fn test_select_prefers_created_on() {
        let mut t = table("dbo", "Orders", 0);
        t.others = vec!["CreatedOn".to_string(), "Total".to_string()];
        assert_eq!(
            select_sql(&t),
            "SELECT [Id], [CreatedOn], [Total] FROM [dbo].[Orders] ORDER BY [CreatedOn], [Id]"
        );
    }
}
