use ct_replicator::config;
use std::fs;
use tempfile::tempdir;

const FULL_CONFIG: &str = r#"
Timeout = 60
Interval = 10

[[ReplicationSets]]
Name = "orders"
Tables = ["dbo.Customers", "dbo.Orders"]
ExcludeTables = ["dbo.AuditLog"]
DebugTables = ["dbo.Orders"]

[ReplicationSets.Source]
Name = "prod"
ConnectionString = "Server=src,1433;Database=app;User Id=sa;Password=secret"

[[ReplicationSets.Destinations]]
Name = "replica"
ConnectionString = "Server=dst,1433;Database=app;User Id=sa;Password=secret"
PopulateOutOfSync = true
BatchSize = 1000

[[ReplicationSets]]
Name = "billing"

[ReplicationSets.Source]
Name = "prod"
ConnectionString = "Server=src,1433;Database=billing;User Id=sa;Password=secret"

[[ReplicationSets.Destinations]]
Name = "warehouse"
ConnectionString = "Server=wh,1433;Database=billing;User Id=sa;Password=secret"
Mode = "Normal"
AddRowVersionColumn = true
RowVersionColumnName = "SyncVersion"
DisableAllConstraints = true
"#;

#[test]
fn test_load_full_config_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ct-replicator.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let config = config::load(&path).unwrap();
    assert_eq!(config.timeout, 60);
    assert_eq!(config.interval, 10);
    assert_eq!(config.replication_sets.len(), 2);

    let orders = &config.replication_sets[0];
    assert_eq!(orders.name, "orders");
    assert_eq!(orders.tables.len(), 2);
    assert_eq!(orders.exclude_tables, vec!["dbo.AuditLog"]);
    assert!(orders.destinations[0].populate_out_of_sync);
    assert_eq!(orders.destinations[0].mode, config::Mode::Slave);

    let billing = &config.replication_sets[1];
    assert!(billing.tables.is_empty());
    assert_eq!(billing.destinations[0].mode, config::Mode::Normal);
    assert!(billing.destinations[0].add_row_version_column);
    assert_eq!(
        billing.destinations[0].row_version_column_name.as_deref(),
        Some("SyncVersion")
    );
    assert_eq!(billing.destinations[0].disable_all_constraints, Some(true));
}

#[test]
fn test_load_rejects_unknown_keys() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "Intervall = 10\n").unwrap();
    assert!(config::load(&path).is_err());
}

#[test]
fn test_load_rejects_empty_document() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.toml");
    fs::write(&path, "").unwrap();

    let err = config::load(&path).unwrap_err();
    assert!(format!("{}", err).contains("no replication sets"));
}

#[test]
fn test_load_missing_file_fails_with_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = config::load(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("absent.toml"));
}
