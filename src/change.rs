// ABOUTME: Change records materialised from the tracking facility
// ABOUTME: Operation kinds, per-batch ordering, and the deferred-FK map

use crate::mssql::SqlValue;
use crate::schema::TableDesc;
use std::cmp::Ordering as CmpOrdering;

/// What happened to a row. `Repopulate` stands in for a full
/// truncate-and-reseed of its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Repopulate,
}

impl Operation {
    pub fn from_code(code: &str) -> Option<Operation> {
        match code {
            "I" => Some(Operation::Insert),
            "U" => Some(Operation::Update),
            "D" => Some(Operation::Delete),
            "Z" => Some(Operation::Repopulate),
            _ => None,
        }
    }

    /// Position of this operation among changes sharing a creation version
    /// and dependency order. Updates run before inserts so that an existing
    /// row is rewritten before a colliding insert is attempted against the
    /// same unique target.
    fn apply_rank(self) -> u8 {
        match self {
            Operation::Repopulate => 0,
            Operation::Update => 1,
            Operation::Insert => 2,
            Operation::Delete => 3,
        }
    }
}

/// One row-level change within a batch.
///
/// `table` indexes into the inspector's descriptor list. `creation_version`
/// equals `version` for rows touched once; it is strictly smaller when a row
/// was inserted early in the batch window and updated later within it.
#[derive(Debug, Clone)]
pub struct Change {
    pub table: usize,
    pub op: Operation,
    pub version: i64,
    pub creation_version: i64,
    /// Primary-key column values, in key order.
    pub keys: Vec<(String, SqlValue)>,
    /// Remaining column values, in catalog order. Empty for deletes.
    pub others: Vec<(String, SqlValue)>,
    /// Constraints the planner marked deferred for this change, with the
    /// creation version until which each must stay disabled.
    pub deferred_constraints: Vec<(String, i64)>,
}

impl Change {
    pub fn new(
        table: usize,
        op: Operation,
        version: i64,
        creation_version: i64,
        keys: Vec<(String, SqlValue)>,
        others: Vec<(String, SqlValue)>,
    ) -> Self {
        Self {
            table,
            op,
            version,
            creation_version,
            keys,
            others,
            deferred_constraints: Vec::new(),
        }
    }

    /// A repopulate marker for a table; carries no column values.
    pub fn repopulate(table: usize, version: i64) -> Self {
        Self::new(table, Operation::Repopulate, version, version, Vec::new(), Vec::new())
    }

    /// Value of a column by name, searching keys then the rest.
    pub fn value_of(&self, column: &str) -> Option<&SqlValue> {
        self.keys
            .iter()
            .chain(self.others.iter())
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }

    /// All values in binding order: keys first, then the other columns.
    pub fn values(&self) -> Vec<SqlValue> {
        self.keys
            .iter()
            .chain(self.others.iter())
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Column names in the same order as `values()`.
    pub fn columns(&self) -> Vec<&str> {
        self.keys
            .iter()
            .chain(self.others.iter())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Record a deferral, keeping the largest until-version per constraint.
    pub fn defer_constraint(&mut self, name: &str, until_version: i64) {
        match self
            .deferred_constraints
            .iter_mut()
            .find(|(n, _)| n == name)
        {
            Some((_, until)) => *until = (*until).max(until_version),
            None => self
                .deferred_constraints
                .push((name.to_string(), until_version)),
        }
    }
}

/// The changes advancing one destination group from its version to `to_version`.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    /// Facility version this batch advances destinations to.
    pub to_version: i64,
    pub changes: Vec<Change>,
    /// Destination versions found to be older than the source's retained history.
    pub out_of_sync_versions: Vec<i64>,
    /// Destinations that opted in to repopulation when out of sync.
    pub out_of_sync_databases: Vec<String>,
}

impl ChangeBatch {
    pub fn new(to_version: i64) -> Self {
        Self {
            to_version,
            changes: Vec::new(),
            out_of_sync_versions: Vec::new(),
            out_of_sync_databases: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Order the stream for application: creation version, then the owning
    /// table's dependency order, then the operation rank.
    pub fn sort_for_apply(&mut self, tables: &[TableDesc]) {
        self.changes.sort_by(|a, b| compare_changes(a, b, tables));
    }
}

pub fn compare_changes(a: &Change, b: &Change, tables: &[TableDesc]) -> CmpOrdering {
    a.creation_version
        .cmp(&b.creation_version)
        .then_with(|| tables[a.table].dependency_order.cmp(&tables[b.table].dependency_order))
        .then_with(|| a.op.apply_rank().cmp(&b.op.apply_rank()))
}
