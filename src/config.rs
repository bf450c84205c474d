// ABOUTME: Configuration document for replication sets and destinations
// ABOUTME: TOML deserialization, defaults, and cross-field validation

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

fn default_interval() -> u64 {
    30
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    /// Command timeout in seconds; 0 leaves the driver default in place.
    #[serde(default)]
    pub timeout: u64,
    /// Seconds between loop iterations.
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub replication_sets: Vec<ReplicationSet>,
}

/// One source with one or more downstream destinations.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ReplicationSet {
    pub name: String,
    pub source: DatabaseInfo,
    pub destinations: Vec<DatabaseInfo>,
    /// Include-list of tables; empty replicates every tracked table.
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub exclude_tables: Vec<String>,
    /// Tables whose applied changes are logged column by column.
    #[serde(default)]
    pub debug_tables: Vec<String>,
}

/// How a destination participates in replication.
///
/// `Slave` destinations are strictly downstream and may be truncated and
/// re-seeded when they fall out of the source's retained history. `Normal`
/// destinations refuse truncate-based flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Mode {
    Normal,
    Slave,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Slave
    }
}

/// Connection settings and per-destination behaviour for one database.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DatabaseInfo {
    pub name: String,
    pub connection_string: String,
    /// Caps the number of change rows fetched per table per batch.
    #[serde(default)]
    pub batch_size: Option<u32>,
    /// Opt in to truncate-and-reseed when the destination is older than the
    /// source's retained change history.
    #[serde(default)]
    pub populate_out_of_sync: bool,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub table_mapping: Vec<TableMapping>,
    /// When set, inserts and updates also write the batch version into the
    /// column named by `RowVersionColumnName`.
    #[serde(default)]
    pub add_row_version_column: bool,
    #[serde(default)]
    pub row_version_column_name: Option<String>,
    /// Disable every destination constraint for the span of each batch
    /// instead of the per-constraint deferral plan.
    #[serde(default)]
    pub disable_all_constraints: Option<bool>,
}

/// Renames a source table (and optionally columns) on the destination side.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct TableMapping {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub column_mappings: Vec<ColumnMapping>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
}

impl Config {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Validate cross-field rules that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.replication_sets.is_empty() {
            bail!("Configuration defines no replication sets");
        }

        let mut names: Vec<&str> = self
            .replication_sets
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.replication_sets.len() {
            bail!("Replication set names must be unique");
        }

        for set in &self.replication_sets {
            if set.destinations.is_empty() {
                bail!("Replication set '{}' has no destinations", set.name);
            }
            for db in &set.destinations {
                if db.add_row_version_column
                    && db
                        .row_version_column_name
                        .as_deref()
                        .map_or(true, str::is_empty)
                {
                    bail!(
                        "Destination '{}' enables AddRowVersionColumn without RowVersionColumnName",
                        db.name
                    );
                }
            }
        }

        Ok(())
    }
}

impl DatabaseInfo {
    /// Resolve the destination-side name of a source table.
    /// Mappings match the fully-qualified or table-only name, brackets stripped.
    pub fn mapped_table(&self, schema: &str, table: &str) -> (String, String) {
        for mapping in &self.table_mapping {
            if name_matches(&mapping.source, schema, table) {
                return split_qualified(&mapping.target, schema);
            }
        }
        (schema.to_string(), table.to_string())
    }

    /// Resolve the destination-side name of a source column.
    pub fn mapped_column(&self, schema: &str, table: &str, column: &str) -> String {
        for mapping in &self.table_mapping {
            if name_matches(&mapping.source, schema, table) {
                for cm in &mapping.column_mappings {
                    if cm.source.eq_ignore_ascii_case(column) {
                        return cm.target.clone();
                    }
                }
            }
        }
        column.to_string()
    }
}

/// Match a configured table name against a live table, tolerating brackets
/// and a missing schema qualifier.
pub fn name_matches(pattern: &str, schema: &str, table: &str) -> bool {
    let clean = pattern.replace(['[', ']'], "");
    clean.eq_ignore_ascii_case(&format!("{}.{}", schema, table))
        || clean.eq_ignore_ascii_case(table)
}

fn split_qualified(name: &str, default_schema: &str) -> (String, String) {
    let clean = name.replace(['[', ']'], "");
    match clean.split_once('.') {
        Some((s, t)) => (s.to_string(), t.to_string()),
        None => (default_schema.to_string(), clean),
    }
}

/// Load and validate a configuration file.
pub fn load(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration from {:?}", path))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse configuration from {:?}", path))?;
    config.validate()?;
    Ok(config)
}
