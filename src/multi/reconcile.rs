//! # Var Axis Reconciliation
//!
//! Builds the shared var index and annotation table of a dataset, and the
//! per-member map from reconciled var positions to local ones.
//!
//! - `Inner`: labels of the first member that every member has, in the
//!   first member's order; columns present in every member.
//! - `Outer`: union of labels in first-seen order; union of columns, with
//!   missing values taken from the fill policy.
//!
//! Values for a label come from the first member that holds it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::annotated::{AnnotatedMatrix, ElementHandle, Slot};
use crate::config::{FillPolicy, JoinPolicy};
use crate::data::{AxisIndex, Column, ColumnKind, DType, Encoding, TypedTable};
use crate::error::{Result, StoreError};

/// Reconciled var axis
pub(crate) struct Reconciled {
    pub var_table: TypedTable,
    /// Per member: reconciled var position -> local var position
    pub var_maps: Vec<Vec<Option<usize>>>,
}

pub(crate) fn reconcile_var(
    members: &[&AnnotatedMatrix],
    join: JoinPolicy,
    fill: &FillPolicy,
) -> Result<Reconciled> {
    let tables = members
        .iter()
        .map(|m| m.get_var_table())
        .collect::<Result<Vec<_>>>()?;
    let index = reconcile_labels(&tables, join)?;
    let var_maps: Vec<Vec<Option<usize>>> = tables
        .iter()
        .map(|t| index.iter().map(|label| t.index().position(label)).collect())
        .collect();
    let var_table = reconcile_columns(&tables, &var_maps, index, join, fill)?;
    Ok(Reconciled {
        var_table,
        var_maps,
    })
}

fn reconcile_labels(tables: &[&TypedTable], join: JoinPolicy) -> Result<AxisIndex> {
    let Some((first, rest)) = tables.split_first() else {
        return Ok(AxisIndex::default());
    };
    let labels: Vec<Arc<str>> = match join {
        JoinPolicy::Inner => first
            .index()
            .labels()
            .iter()
            .filter(|label| rest.iter().all(|t| t.index().contains(label)))
            .cloned()
            .collect(),
        JoinPolicy::Outer => {
            let mut seen = HashSet::new();
            tables
                .iter()
                .flat_map(|t| t.index().labels().iter())
                .filter(|label| seen.insert(Arc::clone(label)))
                .cloned()
                .collect()
        }
    };
    AxisIndex::new(labels)
}

/// Column names kept under `join`, in first-seen order
pub(crate) fn joined_column_names(tables: &[&TypedTable], join: JoinPolicy) -> Vec<String> {
    let mut seen = HashSet::new();
    tables
        .iter()
        .flat_map(|t| t.column_names())
        .filter(|name| seen.insert(*name))
        .filter(|name| join == JoinPolicy::Outer || tables.iter().all(|t| t.contains(name)))
        .map(String::from)
        .collect()
}

fn reconcile_columns(
    tables: &[&TypedTable],
    var_maps: &[Vec<Option<usize>>],
    index: AxisIndex,
    join: JoinPolicy,
    fill: &FillPolicy,
) -> Result<TypedTable> {
    let n = index.len();
    let mut out = TypedTable::new(index);
    for name in joined_column_names(tables, join) {
        // concatenate the holders, then pick each label from the first one
        let mut parts = Vec::new();
        let mut positions: Vec<Option<usize>> = vec![None; n];
        let mut offset = 0;
        for (table, var_map) in tables.iter().zip(var_maps) {
            let Some(column) = table.column(&name) else {
                continue;
            };
            for (slot, local) in positions.iter_mut().zip(var_map) {
                if let (None, Some(local)) = (*slot, local) {
                    *slot = Some(offset + local);
                }
            }
            offset += column.len();
            parts.push(column);
        }
        let column = Column::concat(&parts)?.take_filled(&positions, fill)?;
        out.set_column(name, column)?;
    }
    Ok(out)
}

/// Fail with `SchemaMismatch` when a column name has different kinds
/// across members
pub(crate) fn check_column_kinds(
    ids: &[String],
    tables: &[&TypedTable],
    what: &str,
) -> Result<()> {
    let mut kinds: HashMap<&str, (ColumnKind, &str)> = HashMap::new();
    for (id, table) in ids.iter().zip(tables) {
        for (name, column) in table.iter() {
            let kind = column.kind();
            match kinds.get(name) {
                Some(&(seen, seen_id)) if seen != kind => {
                    return Err(StoreError::schema_mismatch(format!(
                        "{what} column {name:?} is {seen:?} in {seen_id:?} but {kind:?} in {id:?}"
                    )))
                }
                Some(_) => {}
                None => {
                    kinds.insert(name, (kind, id.as_str()));
                }
            }
        }
    }
    Ok(())
}

/// What must agree for one element name across members
#[derive(Clone, Debug, PartialEq)]
struct Signature {
    class: &'static str,
    dtype: Option<DType>,
    trailing: Option<Vec<usize>>,
}

impl Signature {
    fn of(handle: &ElementHandle, with_trailing: bool) -> Self {
        let class = match handle.encoding() {
            Encoding::Array => "dense",
            Encoding::SparseRow | Encoding::SparseColumn => "sparse",
            other => other.as_str(),
        };
        let trailing = if with_trailing && class != "table" {
            handle.shape().map(|s| s.iter().skip(1).copied().collect())
        } else {
            None
        };
        Self {
            class,
            dtype: handle.dtype(),
            trailing,
        }
    }
}

fn check_signatures(
    ids: &[String],
    entries: impl Iterator<Item = (usize, String, ElementHandle)>,
    with_trailing: bool,
    what: &str,
) -> Result<()> {
    let mut seen: HashMap<String, (Signature, usize)> = HashMap::new();
    for (member, name, handle) in entries {
        let signature = Signature::of(&handle, with_trailing);
        match seen.get(&name) {
            Some((first, first_member)) if *first != signature => {
                return Err(StoreError::schema_mismatch(format!(
                    "{what} {name:?} is {first:?} in {:?} but {signature:?} in {:?}",
                    ids[*first_member], ids[member]
                )))
            }
            Some(_) => {}
            None => {
                seen.insert(name, (signature, member));
            }
        }
    }
    Ok(())
}

/// Every element name that appears in more than one member must agree on
/// kind and dtype; var extras must also agree on trailing shape
pub(crate) fn check_schemas(ids: &[String], members: &[&AnnotatedMatrix]) -> Result<()> {
    let obs_tables = members
        .iter()
        .map(|m| m.get_obs_table())
        .collect::<Result<Vec<_>>>()?;
    check_column_kinds(ids, &obs_tables, "obs")?;
    let var_tables = members
        .iter()
        .map(|m| m.get_var_table())
        .collect::<Result<Vec<_>>>()?;
    check_column_kinds(ids, &var_tables, "var")?;

    let mut primaries = Vec::new();
    for (i, m) in members.iter().enumerate() {
        if m.has_primary()? {
            primaries.push((i, "primary".to_string(), m.get_primary()?));
        }
    }
    check_signatures(ids, primaries.into_iter(), false, "primary")?;

    for (slot, with_trailing) in [
        (Slot::Layers, false),
        (Slot::ObsExtras, true),
        (Slot::VarExtras, true),
    ] {
        let mut entries = Vec::new();
        for (i, m) in members.iter().enumerate() {
            for name in m.keys(slot)? {
                let handle = m.get(slot, &name)?;
                entries.push((i, name, handle));
            }
        }
        check_signatures(ids, entries.into_iter(), with_trailing, slot.as_str())?;
    }
    Ok(())
}
