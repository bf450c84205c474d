// ABOUTME: Version oracle - where a database currently stands in replication
// ABOUTME: Reads and writes the one-row SyncInfo marker, falling back to the facility version

use crate::mssql::{self, MssqlClient};
use anyhow::{Context, Result};
use std::time::Duration;

/// The destination's persistent version marker. One row, created lazily on
/// the first successful batch.
const SYNC_INFO_DDL: &str = "IF OBJECT_ID(N'dbo.SyncInfo') IS NULL \
     CREATE TABLE dbo.SyncInfo ( \
         Id int NOT NULL PRIMARY KEY DEFAULT 1 CHECK (Id = 1), \
         Version bigint NOT NULL)";

/// The replication version of a database.
///
/// Preference order: the persisted `SyncInfo` row, then the facility's
/// current version, then `-1` when neither is available (e.g. change
/// tracking disabled on a fresh destination).
pub async fn current_version(client: &mut MssqlClient, timeout: Option<Duration>) -> Result<i64> {
    let marker = mssql::with_timeout(timeout, async {
        let rows = client
            .query(
                "IF OBJECT_ID(N'dbo.SyncInfo') IS NOT NULL \
                     SELECT TOP 1 Version FROM dbo.SyncInfo \
                 ELSE \
                     SELECT CAST(NULL AS bigint)",
                &[],
            )
            .await?
            .into_first_result()
            .await?;
        Ok(rows.first().and_then(|r| r.try_get::<i64, _>(0).ok().flatten()))
    })
    .await
    .context("Failed to read the SyncInfo version marker")?;

    if let Some(version) = marker {
        return Ok(version);
    }

    let facility = mssql::with_timeout(timeout, async {
        let rows = client
            .query("SELECT CHANGE_TRACKING_CURRENT_VERSION()", &[])
            .await?
            .into_first_result()
            .await?;
        Ok(rows.first().and_then(|r| r.try_get::<i64, _>(0).ok().flatten()))
    })
    .await
    .context("Failed to read the change tracking version")?;

    Ok(facility.unwrap_or(-1))
}

/// Persist a new version marker, creating `SyncInfo` on first use.
/// Runs inside whatever transaction the caller has open, so the marker and
/// the applied batch commit or roll back together.
pub async fn set_version(
    client: &mut MssqlClient,
    version: i64,
    timeout: Option<Duration>,
) -> Result<()> {
    mssql::with_timeout(timeout, async {
        client.execute(SYNC_INFO_DDL, &[]).await?;
        client
            .execute(
                "UPDATE dbo.SyncInfo SET Version = @P1; \
                 IF @@ROWCOUNT = 0 INSERT INTO dbo.SyncInfo (Id, Version) VALUES (1, @P2)",
                &[&version, &version],
            )
            .await?;
        Ok(())
    })
    .await
    .with_context(|| format!("Failed to persist version {}", version))
}

/// The source facility's current version.
pub async fn facility_version(
    client: &mut MssqlClient,
    timeout: Option<Duration>,
) -> Result<Option<i64>> {
    mssql::with_timeout(timeout, async {
        let rows = client
            .query("SELECT CHANGE_TRACKING_CURRENT_VERSION()", &[])
            .await?
            .into_first_result()
            .await?;
        Ok(rows.first().and_then(|r| r.try_get::<i64, _>(0).ok().flatten()))
    })
    .await
    .context("Failed to read the change tracking version")
}
