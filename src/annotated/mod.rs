//! # Annotated Matrix
//!
//! The unit callers manipulate: a primary matrix with row (`obs`) and column
//! (`var`) annotation tables plus four named element collections, optionally
//! bound to an on-disk store.
//!
//! ## Invariants
//! `n_obs` is the length of the obs table's index; every obs-aligned entry
//! (`obs_extras`, `layers`, `primary`) has that leading dimension. The same
//! holds for `n_var`. Setters validate first, then write the store, then
//! update memory, so a rejected assignment leaves both untouched.
//!
//! ## Axis establishment
//! An axis of length 0 with nothing aligned to it is still open: the first
//! assignment implying a non-zero length fixes it and replaces that axis'
//! index with `"0".."n-1"`.
//!
//! ## Access strategies
//! Tables are always resident. With `AccessStrategy::Backed` the other slots
//! keep only tag/dtype/shape and getters return `ElementHandle::Backed`;
//! with `InMemory` every slot is decoded at open time.

mod access;
mod validate;

pub use access::{ElementHandle, LazyElement};
pub use validate::Slot;

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{json, Value};
use tracing::{debug, info_span, warn};

use crate::config::{AccessStrategy, OpenMode, StoreConfig};
use crate::data::{validate_name, AxisIndex, Column, Element, Encoding, Selection, TypedTable};
use crate::error::{Result, StoreError};
use crate::io::{codec, Attributes, ElementInfo, Group, Store};

use access::Resident;
use validate::{implied_axes, resolve_axis, Axis, Target};

/// Layout version written into the root attributes
pub const FORMAT_VERSION: &str = "0.1.0";

const ROOT_ENCODING: &str = "annotated-matrix";
const ROOT_ENCODING_VERSION: &str = "0.1.0";
const PRIMARY: &str = "primary";
const OBS: &str = "obs";
const VAR: &str = "var";

/// Replacement axis tables produced by a validated assignment
#[derive(Default)]
struct AxisPlan {
    obs: Option<TypedTable>,
    var: Option<TypedTable>,
}

impl AxisPlan {
    fn set(&mut self, axis: Axis, table: TypedTable) {
        match axis {
            Axis::Obs => self.obs = Some(table),
            Axis::Var => self.var = Some(table),
        }
    }
}

/// Generates the named wrappers around the generic slot accessors
macro_rules! slot_accessors {
    ($slot:expr, $what:literal, $get:ident, $set:ident, $remove:ident, $has:ident, $keys:ident) => {
        #[doc = concat!("Get a ", $what, " entry; fails with `KeyNotFound`")]
        pub fn $get(&self, name: &str) -> Result<ElementHandle> {
            self.get($slot, name)
        }

        #[doc = concat!("Assign a ", $what, " entry, validating its shape first")]
        pub fn $set(&mut self, name: &str, element: impl Into<Element>) -> Result<()> {
            self.set($slot, name, element)
        }

        #[doc = concat!("Remove a ", $what, " entry; returns whether it existed")]
        pub fn $remove(&mut self, name: &str) -> Result<bool> {
            self.remove($slot, name)
        }

        pub fn $has(&self, name: &str) -> Result<bool> {
            self.has($slot, name)
        }

        pub fn $keys(&self) -> Result<Vec<String>> {
            self.keys($slot)
        }
    };
}

/// Annotated data matrix, in memory or bound to a store
#[derive(Debug)]
pub struct AnnotatedMatrix {
    store: Option<Store>,
    strategy: AccessStrategy,
    closed: bool,
    obs: TypedTable,
    var: TypedTable,
    primary: Option<Resident>,
    slots: BTreeMap<Slot, BTreeMap<String, Resident>>,
}

impl Default for AnnotatedMatrix {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnotatedMatrix {
    /// Empty in-memory matrix (`n_obs = n_var = 0`)
    pub fn new() -> Self {
        Self::empty(None, AccessStrategy::InMemory)
    }

    fn empty(store: Option<Store>, strategy: AccessStrategy) -> Self {
        Self {
            store,
            strategy,
            closed: false,
            obs: TypedTable::default(),
            var: TypedTable::default(),
            primary: None,
            slots: Slot::ALL.iter().map(|&s| (s, BTreeMap::new())).collect(),
        }
    }

    /// Create a new store at `path` holding an empty matrix
    pub fn create(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let store = Store::create(path, config.sync_writes)?;
        let root = store.root();
        root.set_attrs(&root_attrs())?;
        let matrix = Self::empty(Some(store), config.access);
        codec::encode(&root, OBS, &Element::Table(matrix.obs.clone()))?;
        codec::encode(&root, VAR, &Element::Table(matrix.var.clone()))?;
        for slot in Slot::ALL {
            codec::create_mapping_group(&root, slot.as_str())?;
        }
        Ok(matrix)
    }

    /// Open a stored matrix, validating every slot against the axis tables
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, config: &StoreConfig) -> Result<Self> {
        if mode == OpenMode::CreateNew {
            return Self::create(path, config);
        }
        config.validate()?;
        let path = path.as_ref();
        let _span = info_span!("matrix_open", path = %path.display(), ?mode).entered();
        let store = Store::open(path, mode, config.sync_writes)?;
        let root = store.root();
        check_root_attrs(&root.attrs()?, path)?;

        let mut matrix = Self::empty(Some(store), config.access);
        matrix.obs = read_table(&root, OBS, path)?;
        matrix.var = read_table(&root, VAR, path)?;

        if root.contains(PRIMARY)? {
            let info = codec::inspect(&root, PRIMARY)?;
            matrix.check_stored(Target::Primary, &info)?;
            matrix.primary = Some(matrix.load(&root, PRIMARY, info)?);
        }
        for slot in Slot::ALL {
            if !root.contains(slot.as_str())? {
                continue;
            }
            let group = root.group(slot.as_str())?;
            for name in group.list()? {
                let info = codec::inspect(&group, &name)?;
                matrix.check_stored(Target::Entry(slot, &name), &info)?;
                let resident = matrix.load(&group, &name, info)?;
                matrix.slots.entry(slot).or_default().insert(name, resident);
            }
        }
        debug!(
            n_obs = matrix.n_obs(),
            n_var = matrix.n_var(),
            "opened annotated matrix"
        );
        Ok(matrix)
    }

    // ------------------------------------------------------------------------
    // Handle state
    // ------------------------------------------------------------------------

    pub fn n_obs(&self) -> usize {
        self.obs.n_rows()
    }

    pub fn n_var(&self) -> usize {
        self.var.n_rows()
    }

    pub fn strategy(&self) -> AccessStrategy {
        self.strategy
    }

    /// Store directory, for store-bound matrices
    pub fn location(&self) -> Option<&Path> {
        self.store.as_ref().map(Store::path)
    }

    /// Whether getters return lazy handles
    pub fn is_backed(&self) -> bool {
        self.store.is_some() && self.strategy == AccessStrategy::Backed
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.store.as_ref().is_some_and(Store::is_closed)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Flush and release the store. Every later operation fails with `Closed`.
    pub fn close(&mut self) -> Result<()> {
        self.check_open()?;
        if let Some(store) = &self.store {
            store.close()?;
        }
        self.closed = true;
        Ok(())
    }

    fn axis_len(&self, axis: Axis) -> usize {
        self.table(axis).n_rows()
    }

    fn table(&self, axis: Axis) -> &TypedTable {
        match axis {
            Axis::Obs => &self.obs,
            Axis::Var => &self.var,
        }
    }

    // ------------------------------------------------------------------------
    // Validation plumbing
    // ------------------------------------------------------------------------

    /// Whether anything other than `target` already pins `axis`
    fn occupied(&self, axis: Axis, target: Target<'_>) -> bool {
        if target != Target::Table(axis) && self.table(axis).n_columns() > 0 {
            return true;
        }
        if target != Target::Primary && self.primary.is_some() {
            return true;
        }
        self.slots
            .iter()
            .filter(|(slot, _)| slot.aligned_with(axis))
            .any(|(&slot, entries)| {
                entries
                    .keys()
                    .any(|name| target != Target::Entry(slot, name.as_str()))
            })
    }

    fn plan(&self, target: Target<'_>, info: &ElementInfo) -> Result<AxisPlan> {
        let implied = implied_axes(target, info)?;
        let what = describe(target);
        let mut plan = AxisPlan::default();
        for axis in [Axis::Obs, Axis::Var] {
            let established = resolve_axis(
                axis,
                self.axis_len(axis),
                implied.get(axis),
                self.occupied(axis, target),
                &what,
            )?;
            if let Some(len) = established {
                plan.set(axis, TypedTable::new(AxisIndex::range(len)));
            }
        }
        Ok(plan)
    }

    /// Stored entries must agree with the axes as they are
    fn check_stored(&self, target: Target<'_>, info: &ElementInfo) -> Result<()> {
        let implied = implied_axes(target, info)?;
        for axis in [Axis::Obs, Axis::Var] {
            resolve_axis(axis, self.axis_len(axis), implied.get(axis), true, &describe(target))?;
        }
        Ok(())
    }

    fn persist_plan(&self, plan: &AxisPlan) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let root = store.root();
        for (name, table) in [(OBS, &plan.obs), (VAR, &plan.var)] {
            if let Some(table) = table {
                codec::encode(&root, name, &Element::Table(table.clone()))?;
            }
        }
        Ok(())
    }

    /// Persist `plan` once the element at `parent/name` is written; the
    /// element is removed again if the axis tables cannot be written
    fn persist_plan_after(&self, plan: &AxisPlan, parent: &Group, name: &str) -> Result<()> {
        if let Err(e) = self.persist_plan(plan) {
            if let Err(cleanup) = parent.remove(name) {
                warn!(error = %cleanup, name, "failed to roll back element after axis write");
            }
            return Err(e);
        }
        Ok(())
    }

    fn apply_plan(&mut self, plan: AxisPlan) {
        if let Some(table) = plan.obs {
            debug!(n_obs = table.n_rows(), "obs axis set");
            self.obs = table;
        }
        if let Some(table) = plan.var {
            debug!(n_var = table.n_rows(), "var axis set");
            self.var = table;
        }
    }

    fn load(&self, parent: &Group, name: &str, info: ElementInfo) -> Result<Resident> {
        match self.strategy {
            AccessStrategy::InMemory => Ok(Resident::Loaded(codec::decode(parent, name)?)),
            AccessStrategy::Backed => Ok(Resident::Stored(info)),
        }
    }

    fn resident(&self, element: Element, info: ElementInfo) -> Resident {
        if self.is_backed() {
            Resident::Stored(info)
        } else {
            Resident::Loaded(element)
        }
    }

    fn handle_for(&self, parent: Option<Slot>, name: &str, resident: &Resident) -> Result<ElementHandle> {
        match resident {
            Resident::Loaded(element) => Ok(ElementHandle::Memory(element.clone())),
            Resident::Stored(info) => {
                let store = self.store.as_ref().ok_or(StoreError::Closed)?;
                let root = store.root();
                let group = match parent {
                    Some(slot) => root.group(slot.as_str())?,
                    None => root,
                };
                Ok(ElementHandle::Backed(LazyElement::new(group, name, info.clone())))
            }
        }
    }

    fn slot_group(store: &Store, slot: Slot) -> Result<Group> {
        let root = store.root();
        if root.contains(slot.as_str())? {
            root.group(slot.as_str())
        } else {
            codec::create_mapping_group(&root, slot.as_str())
        }
    }

    // ------------------------------------------------------------------------
    // Named slots
    // ------------------------------------------------------------------------

    /// Entry of a named slot; fails with `KeyNotFound`
    pub fn get(&self, slot: Slot, name: &str) -> Result<ElementHandle> {
        self.check_open()?;
        let resident = self
            .slots
            .get(&slot)
            .and_then(|entries| entries.get(name))
            .ok_or_else(|| StoreError::key_not_found(format!("{slot}/{name}")))?;
        self.handle_for(Some(slot), name, resident)
    }

    /// Assign an entry of a named slot
    pub fn set(&mut self, slot: Slot, name: &str, element: impl Into<Element>) -> Result<()> {
        self.check_open()?;
        validate_name(name)?;
        let element = element.into();
        let info = ElementInfo::of(&element);
        let plan = self.plan(Target::Entry(slot, name), &info)?;

        if let Some(store) = &self.store {
            let group = Self::slot_group(store, slot)?;
            codec::encode(&group, name, &element)?;
            self.persist_plan_after(&plan, &group, name)?;
        }
        self.apply_plan(plan);
        debug!(slot = %slot, name, encoding = %info.encoding, "assigned element");
        let resident = self.resident(element, info);
        self.slots
            .entry(slot)
            .or_default()
            .insert(name.to_string(), resident);
        Ok(())
    }

    /// Remove an entry of a named slot; returns whether it existed
    pub fn remove(&mut self, slot: Slot, name: &str) -> Result<bool> {
        self.check_open()?;
        if !self.has(slot, name)? {
            return Ok(false);
        }
        if let Some(store) = &self.store {
            Self::slot_group(store, slot)?.remove(name)?;
        }
        if let Some(entries) = self.slots.get_mut(&slot) {
            entries.remove(name);
        }
        Ok(true)
    }

    pub fn has(&self, slot: Slot, name: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self
            .slots
            .get(&slot)
            .is_some_and(|entries| entries.contains_key(name)))
    }

    /// Entry names of a named slot, sorted
    pub fn keys(&self, slot: Slot) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self
            .slots
            .get(&slot)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    slot_accessors!(
        Slot::ObsExtras,
        "row-aligned extra",
        get_obs_extra,
        set_obs_extra,
        remove_obs_extra,
        has_obs_extra,
        obs_extra_keys
    );
    slot_accessors!(
        Slot::VarExtras,
        "column-aligned extra",
        get_var_extra,
        set_var_extra,
        remove_var_extra,
        has_var_extra,
        var_extra_keys
    );
    slot_accessors!(
        Slot::Layers,
        "layer",
        get_layer,
        set_layer,
        remove_layer,
        has_layer,
        layer_keys
    );
    slot_accessors!(
        Slot::Metadata,
        "metadata",
        get_metadata,
        set_metadata,
        remove_metadata,
        has_metadata,
        metadata_keys
    );

    // ------------------------------------------------------------------------
    // Primary matrix
    // ------------------------------------------------------------------------

    pub fn has_primary(&self) -> Result<bool> {
        self.check_open()?;
        Ok(self.primary.is_some())
    }

    /// Primary matrix; fails with `KeyNotFound` when unset
    pub fn get_primary(&self) -> Result<ElementHandle> {
        self.check_open()?;
        let resident = self
            .primary
            .as_ref()
            .ok_or_else(|| StoreError::key_not_found(PRIMARY))?;
        self.handle_for(None, PRIMARY, resident)
    }

    pub fn set_primary(&mut self, element: impl Into<Element>) -> Result<()> {
        self.check_open()?;
        let element = element.into();
        let info = ElementInfo::of(&element);
        let plan = self.plan(Target::Primary, &info)?;

        if let Some(store) = &self.store {
            let root = store.root();
            codec::encode(&root, PRIMARY, &element)?;
            self.persist_plan_after(&plan, &root, PRIMARY)?;
        }
        self.apply_plan(plan);
        debug!(shape = ?info.shape, "assigned primary");
        self.primary = Some(self.resident(element, info));
        Ok(())
    }

    pub fn remove_primary(&mut self) -> Result<bool> {
        self.check_open()?;
        if self.primary.is_none() {
            return Ok(false);
        }
        if let Some(store) = &self.store {
            store.root().remove(PRIMARY)?;
        }
        self.primary = None;
        Ok(true)
    }

    /// Rows then columns of the primary matrix. Backed dense and CSR
    /// matrices read only the selected rows from disk.
    pub fn read_primary_rows(&self, obs: &Selection, var: &Selection) -> Result<Element> {
        self.get_primary()?.read_rows(obs)?.select_columns(var)
    }

    // ------------------------------------------------------------------------
    // Annotation tables
    // ------------------------------------------------------------------------

    pub fn get_obs_table(&self) -> Result<&TypedTable> {
        self.check_open()?;
        Ok(&self.obs)
    }

    pub fn get_var_table(&self) -> Result<&TypedTable> {
        self.check_open()?;
        Ok(&self.var)
    }

    pub fn obs_names(&self) -> Result<&AxisIndex> {
        Ok(self.get_obs_table()?.index())
    }

    pub fn var_names(&self) -> Result<&AxisIndex> {
        Ok(self.get_var_table()?.index())
    }

    /// Replace the obs table; its row count must match `n_obs` unless it
    /// establishes the axis
    pub fn set_obs_table(&mut self, table: TypedTable) -> Result<()> {
        self.set_table(Axis::Obs, table)
    }

    pub fn set_var_table(&mut self, table: TypedTable) -> Result<()> {
        self.set_table(Axis::Var, table)
    }

    pub fn set_obs_column(&mut self, name: &str, column: impl Into<Column>) -> Result<()> {
        let column = column.into();
        self.update_table(Axis::Obs, |table| insert_column(table, name, column))
    }

    pub fn set_var_column(&mut self, name: &str, column: impl Into<Column>) -> Result<()> {
        let column = column.into();
        self.update_table(Axis::Var, |table| insert_column(table, name, column))
    }

    pub fn drop_obs_column(&mut self, name: &str) -> Result<Column> {
        self.update_table(Axis::Obs, |table| table.drop_column(name))
    }

    pub fn drop_var_column(&mut self, name: &str) -> Result<Column> {
        self.update_table(Axis::Var, |table| table.drop_column(name))
    }

    /// Replace the obs labels; fails with `DuplicateLabel` on repeats
    pub fn set_obs_names<I, S>(&mut self, labels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::sync::Arc<str>>,
    {
        let index = AxisIndex::new(labels)?;
        self.update_table(Axis::Obs, |table| table.set_index(index))
    }

    pub fn set_var_names<I, S>(&mut self, labels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::sync::Arc<str>>,
    {
        let index = AxisIndex::new(labels)?;
        self.update_table(Axis::Var, |table| table.set_index(index))
    }

    pub fn rename_obs(&mut self, old: &str, new: &str) -> Result<()> {
        self.update_table(Axis::Obs, |table| table.rename_label(old, new))
    }

    pub fn rename_var(&mut self, old: &str, new: &str) -> Result<()> {
        self.update_table(Axis::Var, |table| table.rename_label(old, new))
    }

    fn update_table<R>(
        &mut self,
        axis: Axis,
        edit: impl FnOnce(&mut TypedTable) -> Result<R>,
    ) -> Result<R> {
        self.check_open()?;
        let mut table = self.table(axis).clone();
        let out = edit(&mut table)?;
        self.set_table(axis, table)?;
        Ok(out)
    }

    fn set_table(&mut self, axis: Axis, table: TypedTable) -> Result<()> {
        self.check_open()?;
        let info = ElementInfo {
            encoding: Encoding::Table,
            dtype: None,
            shape: Some(vec![table.n_rows(), table.n_columns()]),
        };
        let mut plan = self.plan(Target::Table(axis), &info)?;
        plan.set(axis, table);
        self.persist_plan(&plan)?;
        self.apply_plan(plan);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Whole-matrix operations
    // ------------------------------------------------------------------------

    /// Fully materialized in-memory copy
    pub fn to_memory(&self) -> Result<AnnotatedMatrix> {
        self.check_open()?;
        let mut out = Self::empty(None, AccessStrategy::InMemory);
        out.obs = self.obs.clone();
        out.var = self.var.clone();
        if let Some(primary) = &self.primary {
            let element = self.handle_for(None, PRIMARY, primary)?.into_element()?;
            out.primary = Some(Resident::Loaded(element));
        }
        for (&slot, entries) in &self.slots {
            for (name, resident) in entries {
                let element = self.handle_for(Some(slot), name, resident)?.into_element()?;
                out.slots
                    .entry(slot)
                    .or_default()
                    .insert(name.clone(), Resident::Loaded(element));
            }
        }
        Ok(out)
    }

    /// Persist the whole matrix into a new store at `path`
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        self.check_open()?;
        let path = path.as_ref();
        let _span = info_span!("matrix_write", path = %path.display()).entered();
        let mut out = Self::create(path, &StoreConfig::backed())?;
        out.set_obs_table(self.obs.clone())?;
        out.set_var_table(self.var.clone())?;
        if let Some(primary) = &self.primary {
            out.set_primary(self.handle_for(None, PRIMARY, primary)?.into_element()?)?;
        }
        for (&slot, entries) in &self.slots {
            for (name, resident) in entries {
                let element = self.handle_for(Some(slot), name, resident)?.into_element()?;
                out.set(slot, name, element)?;
            }
        }
        out.close()
    }
}

impl Drop for AnnotatedMatrix {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Some(store) = &self.store {
            if !store.is_closed() {
                if let Err(e) = store.close() {
                    warn!(error = %e, "failed to close store on drop");
                }
            }
        }
    }
}

fn insert_column(table: &mut TypedTable, name: &str, column: Column) -> Result<()> {
    // the first column on an empty, label-less table fixes its length
    if table.n_rows() == 0 && table.n_columns() == 0 && !column.is_empty() {
        table.set_index(AxisIndex::range(column.len()))?;
    }
    table.set_column(name, column)
}

fn describe(target: Target<'_>) -> String {
    match target {
        Target::Primary => PRIMARY.to_string(),
        Target::Entry(slot, name) => format!("{slot}/{name}"),
        Target::Table(Axis::Obs) => "obs table".to_string(),
        Target::Table(Axis::Var) => "var table".to_string(),
    }
}

fn root_attrs() -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("encoding-type".into(), json!(ROOT_ENCODING));
    attrs.insert("encoding-version".into(), json!(ROOT_ENCODING_VERSION));
    attrs.insert("format-version".into(), json!(FORMAT_VERSION));
    attrs
}

fn major_version(version: &str) -> Option<u64> {
    version.split('.').next()?.parse().ok()
}

fn check_root_attrs(attrs: &Attributes, path: &Path) -> Result<()> {
    if attrs.get("encoding-type").and_then(Value::as_str) != Some(ROOT_ENCODING) {
        return Err(StoreError::corrupted(path, "not an annotated matrix store"));
    }
    let found = attrs
        .get("format-version")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::corrupted(path, "missing format-version"))?;
    let found_major = major_version(found)
        .ok_or_else(|| StoreError::corrupted(path, format!("malformed format-version {found:?}")))?;
    if Some(found_major) > major_version(FORMAT_VERSION) {
        return Err(StoreError::UnsupportedVersion {
            found: found.to_string(),
            supported: FORMAT_VERSION.to_string(),
        });
    }
    Ok(())
}

fn read_table(root: &Group, name: &str, path: &Path) -> Result<TypedTable> {
    if !root.contains(name)? {
        return Err(StoreError::corrupted(path, format!("missing {name} table")));
    }
    codec::decode(root, name)?.into_table()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DenseArray, SparseFormat, SparseMatrix};
    use ndarray::{array, Array2};

    #[test]
    fn test_axis_established_by_obs_extra() {
        let mut m = AnnotatedMatrix::new();
        assert_eq!((m.n_obs(), m.n_var()), (0, 0));
        m.set_obs_extra("X_pca", array![[1.0f64, 2.0], [3.0, 4.0]]).unwrap();
        assert_eq!(m.n_obs(), 2);
        assert_eq!(m.n_var(), 0);
        assert_eq!(m.obs_names().unwrap().get(1), Some("1"));
    }

    #[test]
    fn test_fail_fast_keeps_prior_value() {
        let mut m = AnnotatedMatrix::new();
        m.set_primary(Array2::<f32>::zeros((3, 4))).unwrap();
        m.set_obs_extra("a", vec![1i32, 2, 3]).unwrap();
        let err = m.set_obs_extra("a", vec![1i32, 2]);
        assert!(matches!(err, Err(StoreError::ShapeMismatch { .. })));
        let kept = m.get_obs_extra("a").unwrap().read().unwrap();
        assert_eq!(kept, Element::from(vec![1i32, 2, 3]));

        let err = m.set_layer("counts", Array2::<f32>::zeros((3, 5)));
        assert!(matches!(err, Err(StoreError::ShapeMismatch { .. })));
        assert!(!m.has_layer("counts").unwrap());
    }

    #[test]
    fn test_axis_slots_reject_scalars() {
        let mut m = AnnotatedMatrix::new();
        let err = m.set_var_extra("x", 1.0f64);
        assert!(matches!(err, Err(StoreError::TypeMismatch { .. })));
        m.set_metadata("x", 1.0f64).unwrap();
        assert_eq!(m.metadata_keys().unwrap(), vec!["x".to_string()]);
    }

    #[test]
    fn test_empty_aligned_entry_pins_axis() {
        let mut m = AnnotatedMatrix::new();
        m.set_obs_extra("empty", DenseArray::zeros(crate::data::DType::Int8, &[0, 3]))
            .unwrap();
        let err = m.set_obs_extra("b", vec![1u8, 2]);
        assert!(matches!(err, Err(StoreError::ShapeMismatch { .. })));
        // replacing the only pinning entry is allowed
        m.set_obs_extra("empty", vec![1u8, 2]).unwrap();
        assert_eq!(m.n_obs(), 2);
    }

    #[test]
    fn test_table_mutators() {
        let mut m = AnnotatedMatrix::new();
        m.set_var_column("Count", vec![1i64, 2, 3]).unwrap();
        assert_eq!(m.n_var(), 3);
        m.set_var_names(["g1", "g2", "g3"]).unwrap();
        m.rename_var("g2", "gene2").unwrap();
        assert_eq!(m.var_names().unwrap().position("gene2"), Some(1));
        assert!(matches!(
            m.set_var_names(["a", "b"]),
            Err(StoreError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            m.rename_var("g1", "g3"),
            Err(StoreError::DuplicateLabel { .. })
        ));
        let dropped = m.drop_var_column("Count").unwrap();
        assert_eq!(dropped.to_vec::<i64>().unwrap(), vec![1, 2, 3]);
        assert_eq!(m.n_var(), 3);
    }

    #[test]
    fn test_primary_row_reads_in_memory() {
        let mut m = AnnotatedMatrix::new();
        let dense = DenseArray::from(array![[1.0f32, 0.0], [0.0, 2.0], [3.0, 0.0]]);
        let sparse = SparseMatrix::from_dense(&dense, SparseFormat::Csr).unwrap();
        m.set_primary(sparse).unwrap();
        let rows = m
            .read_primary_rows(&Selection::from(vec![2, 0]), &Selection::from(1..2))
            .unwrap();
        assert_eq!(
            rows.to_dense().unwrap(),
            DenseArray::from(array![[0.0f32], [0.0]])
        );
        assert!(m.remove_primary().unwrap());
        assert!(matches!(m.get_primary(), Err(StoreError::KeyNotFound { .. })));
    }

    #[test]
    fn test_closed_in_memory_matrix() {
        let mut m = AnnotatedMatrix::new();
        m.close().unwrap();
        assert!(matches!(m.close(), Err(StoreError::Closed)));
        assert!(matches!(m.set_metadata("a", 1i64), Err(StoreError::Closed)));
        assert!(matches!(m.get_obs_table(), Err(StoreError::Closed)));
    }

    #[test]
    fn test_failed_element_write_leaves_axes_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = AnnotatedMatrix::create(dir.path().join("s"), &StoreConfig::backed()).unwrap();
        let root = m.store.as_ref().unwrap().root();
        // a dataset where the slot group should be makes every entry write fail
        root.remove(Slot::ObsExtras.as_str()).unwrap();
        root.write_array(
            Slot::ObsExtras.as_str(),
            &DenseArray::from(vec![0u8]),
            &Attributes::new(),
        )
        .unwrap();

        let err = m.set_obs_extra("X_pca", Array2::<f32>::zeros((3, 2))).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
        assert_eq!(m.n_obs(), 0);
        let stored = codec::decode(&root, OBS).unwrap().into_table().unwrap();
        assert_eq!(stored.n_rows(), 0);

        m.set_primary(Array2::<f32>::zeros((3, 2))).unwrap();
        let stored = codec::decode(&root, OBS).unwrap().into_table().unwrap();
        assert_eq!((stored.n_rows(), m.n_obs()), (3, 3));
    }

    #[test]
    fn test_root_version_check() {
        let mut attrs = root_attrs();
        let path = Path::new("x");
        assert!(check_root_attrs(&attrs, path).is_ok());
        attrs.insert("format-version".into(), json!("7.0.0"));
        assert!(matches!(
            check_root_attrs(&attrs, path),
            Err(StoreError::UnsupportedVersion { .. })
        ));
        attrs.insert("encoding-type".into(), json!("something-else"));
        assert!(matches!(
            check_root_attrs(&attrs, path),
            Err(StoreError::Corrupted { .. })
        ));
    }
}
