// ABOUTME: Constraint deferral planner for out-of-order parent/child arrival
// ABOUTME: Marks which foreign keys must stay disabled, and until which creation version

use crate::change::{ChangeBatch, Operation};
use crate::schema::TableDesc;

/// Decide which foreign-key constraints must be transiently disabled while
/// the batch is applied.
///
/// The batch is emitted in creation-version order, but a change whose row was
/// touched again later in the window (`creation_version < version`) carries
/// the row's newest state. That state can relate to rows that are inserted
/// later in the stream, in either direction: the spanning row may reference a
/// row created after its stream position, or a later insert may reference the
/// spanning row. Either way the constraint linking them cannot hold at the
/// moment the earlier change is applied, so it is deferred until the later
/// insert's creation version has been processed.
pub fn plan_deferrals(batch: &mut ChangeBatch, tables: &[TableDesc]) {
    let changes = &batch.changes;
    let mut marks: Vec<(usize, String, i64)> = Vec::new();

    for i in 0..changes.len() {
        let change = &changes[i];
        let spans_versions =
            change.creation_version < change.version || change.op == Operation::Repopulate;
        if !spans_versions {
            continue;
        }

        for later in &changes[i + 1..] {
            if later.creation_version > change.version {
                break;
            }
            if !matches!(later.op, Operation::Insert | Operation::Repopulate) {
                continue;
            }

            // The spanning change references a row the later change creates.
            for fk in &tables[change.table].foreign_keys {
                if fk.referenced_table != later.table {
                    continue;
                }
                let Some(value) = change.value_of(&fk.column) else {
                    continue;
                };
                if value.is_null() {
                    continue;
                }
                if later.value_of(&fk.referenced_column) == Some(value) {
                    marks.push((i, fk.name.clone(), later.creation_version));
                }
            }

            // The later insert references the spanning change's row.
            for fk in &tables[later.table].foreign_keys {
                if fk.referenced_table != change.table {
                    continue;
                }
                let Some(value) = later.value_of(&fk.column) else {
                    continue;
                };
                if value.is_null() {
                    continue;
                }
                if change.value_of(&fk.referenced_column) == Some(value) {
                    marks.push((i, fk.name.clone(), later.creation_version));
                }
            }
        }
    }

    for (idx, name, until) in marks {
        tracing::debug!(
            "Deferring constraint {} until creation version {}",
            name,
            until
        );
        batch.changes[idx].defer_constraint(&name, until);
    }
}
