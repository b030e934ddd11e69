//! # Typed Tables
//!
//! Row annotations: an `AxisIndex` plus named columns kept in insertion
//! order. Each column is either a 1-d `DenseArray` (numeric, bool or
//! string) or a `Categorical` (small integer codes into a category list).
//!
//! ## Invariants
//! - every column's length equals the index length
//! - column names are unique and never `_index`

use std::collections::{HashMap, HashSet};

use crate::config::FillPolicy;
use crate::data::array::DenseArray;
use crate::data::axis::AxisIndex;
use crate::data::dtype::{ArrayType, DType};
use crate::data::validate_name;
use crate::error::{Result, StoreError};

/// Reserved entry holding the row labels of a stored table
pub const INDEX_KEY: &str = "_index";

/// Code used for missing categorical values
pub const MISSING_CODE: i32 = -1;

/// Categorical column: `codes[i]` indexes `categories`, or is `-1` for missing
#[derive(Clone, Debug, PartialEq)]
pub struct Categorical {
    codes: Vec<i32>,
    categories: Vec<String>,
    ordered: bool,
}

impl Categorical {
    /// Create from codes and categories, validating code range and category uniqueness
    pub fn new(codes: Vec<i32>, categories: Vec<String>, ordered: bool) -> Result<Self> {
        let mut seen = HashMap::with_capacity(categories.len());
        for (i, c) in categories.iter().enumerate() {
            if seen.insert(c.as_str(), i).is_some() {
                return Err(StoreError::duplicate_label(c.as_str()));
            }
        }
        let n = categories.len();
        if let Some(&bad) = codes
            .iter()
            .find(|&&c| c < MISSING_CODE || c >= n as i32)
        {
            return Err(StoreError::type_mismatch(format!(
                "categorical code {bad} outside [-1, {n})"
            )));
        }
        Ok(Self {
            codes,
            categories,
            ordered,
        })
    }

    /// Encode string values; categories appear in order of first occurrence
    pub fn from_values<S: AsRef<str>>(values: &[S]) -> Self {
        let mut categories: Vec<String> = Vec::new();
        let mut lookup: HashMap<String, i32> = HashMap::new();
        let codes = values
            .iter()
            .map(|v| {
                let v = v.as_ref();
                *lookup.entry(v.to_string()).or_insert_with(|| {
                    categories.push(v.to_string());
                    categories.len() as i32 - 1
                })
            })
            .collect();
        Self {
            codes,
            categories,
            ordered: false,
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn codes(&self) -> &[i32] {
        &self.codes
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn ordered(&self) -> bool {
        self.ordered
    }

    /// Decoded value at a row; `None` for missing
    pub fn value(&self, row: usize) -> Option<&str> {
        let code = *self.codes.get(row)?;
        if code < 0 {
            return None;
        }
        self.categories.get(code as usize).map(String::as_str)
    }

    /// All decoded values in row order
    pub fn values(&self) -> Vec<Option<&str>> {
        (0..self.len()).map(|i| self.value(i)).collect()
    }

    fn take_filled(&self, positions: &[Option<usize>]) -> Result<Self> {
        let len = self.len();
        let codes = positions
            .iter()
            .map(|p| match *p {
                Some(i) if i >= len => Err(StoreError::OutOfBounds { index: i, len }),
                Some(i) => Ok(self.codes[i]),
                None => Ok(MISSING_CODE),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            codes,
            categories: self.categories.clone(),
            ordered: self.ordered,
        })
    }

    /// Concatenate, merging category lists in order of first appearance
    fn concat(parts: &[&Categorical]) -> Self {
        let mut categories: Vec<String> = Vec::new();
        let mut lookup: HashMap<&str, i32> = HashMap::new();
        let mut codes = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            let remap: Vec<i32> = part
                .categories
                .iter()
                .map(|c| {
                    *lookup.entry(c.as_str()).or_insert_with(|| {
                        categories.push(c.clone());
                        categories.len() as i32 - 1
                    })
                })
                .collect();
            codes.extend(part.codes.iter().map(|&c| {
                if c < 0 {
                    MISSING_CODE
                } else {
                    remap[c as usize]
                }
            }));
        }
        Self {
            codes,
            categories,
            ordered: parts.iter().all(|p| p.ordered),
        }
    }
}

/// Type of a column, used when reconciling tables
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Array(DType),
    Categorical,
}

/// One table column
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    /// 1-d array of any dtype
    Array(DenseArray),
    Categorical(Categorical),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Array(a) => a.n_rows().unwrap_or(0),
            Column::Categorical(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            Column::Array(a) => ColumnKind::Array(a.dtype()),
            Column::Categorical(_) => ColumnKind::Categorical,
        }
    }

    pub fn as_array(&self) -> Option<&DenseArray> {
        match self {
            Column::Array(a) => Some(a),
            Column::Categorical(_) => None,
        }
    }

    pub fn as_categorical(&self) -> Option<&Categorical> {
        match self {
            Column::Categorical(c) => Some(c),
            Column::Array(_) => None,
        }
    }

    /// Typed values of an array column
    pub fn to_vec<T: ArrayType>(&self) -> Result<Vec<T>> {
        match self {
            Column::Array(a) => a.to_flat_vec(),
            Column::Categorical(_) => Err(StoreError::type_mismatch(format!(
                "expected {} column, found categorical",
                T::DTYPE
            ))),
        }
    }

    /// Column of `len` fill values
    pub fn filled(kind: ColumnKind, len: usize, policy: &FillPolicy) -> Self {
        match kind {
            ColumnKind::Array(dtype) => Column::Array(DenseArray::filled(dtype, &[len], policy)),
            ColumnKind::Categorical => Column::Categorical(Categorical {
                codes: vec![MISSING_CODE; len],
                categories: Vec::new(),
                ordered: false,
            }),
        }
    }

    /// Rows at `positions`
    pub fn take(&self, positions: &[usize]) -> Result<Self> {
        let positions: Vec<Option<usize>> = positions.iter().copied().map(Some).collect();
        self.take_filled(&positions, &FillPolicy::default())
    }

    /// Rows at `positions`; `None` entries take the fill value
    pub fn take_filled(&self, positions: &[Option<usize>], policy: &FillPolicy) -> Result<Self> {
        Ok(match self {
            Column::Array(a) => Column::Array(a.take_rows_filled(positions, policy)?),
            Column::Categorical(c) => Column::Categorical(c.take_filled(positions)?),
        })
    }

    /// Concatenate columns of the same kind
    pub fn concat(parts: &[&Column]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| StoreError::shape_mismatch("cannot concatenate zero columns"))?;
        if let Some(bad) = parts.iter().find(|p| p.kind() != first.kind()) {
            return Err(StoreError::type_mismatch(format!(
                "cannot concatenate {:?} column with {:?} column",
                first.kind(),
                bad.kind()
            )));
        }
        match first {
            Column::Array(_) => {
                let arrays: Vec<DenseArray> = parts
                    .iter()
                    .filter_map(|p| p.as_array().cloned())
                    .collect();
                Ok(Column::Array(DenseArray::concat_rows(&arrays)?))
            }
            Column::Categorical(_) => {
                let cats: Vec<&Categorical> =
                    parts.iter().filter_map(|p| p.as_categorical()).collect();
                Ok(Column::Categorical(Categorical::concat(&cats)))
            }
        }
    }

    fn check_one_dimensional(&self) -> Result<()> {
        if let Column::Array(a) = self {
            if a.ndim() != 1 {
                return Err(StoreError::shape_mismatch(format!(
                    "table columns must be 1-d, got shape {:?}",
                    a.shape()
                )));
            }
        }
        Ok(())
    }
}

impl<T: ArrayType> From<Vec<T>> for Column {
    fn from(values: Vec<T>) -> Self {
        Column::Array(DenseArray::from(values))
    }
}

impl From<Vec<&str>> for Column {
    fn from(values: Vec<&str>) -> Self {
        Column::Array(DenseArray::from(values))
    }
}

impl From<DenseArray> for Column {
    fn from(values: DenseArray) -> Self {
        Column::Array(values)
    }
}

impl From<Categorical> for Column {
    fn from(values: Categorical) -> Self {
        Column::Categorical(values)
    }
}

/// Labelled rows with named, typed columns in insertion order
#[derive(Clone, Debug, Default)]
pub struct TypedTable {
    index: AxisIndex,
    columns: Vec<(String, Column)>,
    positions: HashMap<String, usize>,
}

impl TypedTable {
    /// Empty table (no columns) over an index
    pub fn new(index: AxisIndex) -> Self {
        Self {
            index,
            columns: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Table with columns, validated against the index
    pub fn with_columns<I, S, C>(index: AxisIndex, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, C)>,
        S: Into<String>,
        C: Into<Column>,
    {
        let mut table = Self::new(index);
        for (name, column) in columns {
            let name = name.into();
            if table.contains(&name) {
                return Err(StoreError::duplicate_label(name));
            }
            table.set_column(name, column)?;
        }
        Ok(table)
    }

    pub fn n_rows(&self) -> usize {
        self.index.len()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn index(&self) -> &AxisIndex {
        &self.index
    }

    /// Replace the row labels; length must match
    pub fn set_index(&mut self, index: AxisIndex) -> Result<()> {
        if index.len() != self.n_rows() && !self.columns.is_empty() {
            return Err(StoreError::shape_mismatch(format!(
                "index of length {} for table with {} rows",
                index.len(),
                self.n_rows()
            )));
        }
        self.index = index;
        Ok(())
    }

    /// Rename one row label in place
    pub fn rename_label(&mut self, old: &str, new: &str) -> Result<()> {
        self.index.rename(old, new)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.positions.get(name).map(|&i| &self.columns[i].1)
    }

    /// Column by name; fails with `KeyNotFound`
    pub fn get_column(&self, name: &str) -> Result<&Column> {
        self.column(name)
            .ok_or_else(|| StoreError::key_not_found(name))
    }

    /// Insert or replace a column; its length must equal the row count
    pub fn set_column(&mut self, name: impl Into<String>, column: impl Into<Column>) -> Result<()> {
        let name = name.into();
        let column = column.into();
        validate_name(&name)?;
        if name == INDEX_KEY {
            return Err(StoreError::invalid_name(name));
        }
        column.check_one_dimensional()?;
        if column.len() != self.n_rows() {
            return Err(StoreError::shape_mismatch(format!(
                "column `{name}` has length {} but the table has {} rows",
                column.len(),
                self.n_rows()
            )));
        }
        match self.positions.get(&name) {
            Some(&i) => self.columns[i].1 = column,
            None => {
                self.positions.insert(name.clone(), self.columns.len());
                self.columns.push((name, column));
            }
        }
        Ok(())
    }

    /// Remove a column; fails with `KeyNotFound`
    pub fn drop_column(&mut self, name: &str) -> Result<Column> {
        let i = self
            .positions
            .remove(name)
            .ok_or_else(|| StoreError::key_not_found(name))?;
        let (_, column) = self.columns.remove(i);
        for pos in self.positions.values_mut() {
            if *pos > i {
                *pos -= 1;
            }
        }
        Ok(column)
    }

    /// `(name, column)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Column)> + '_ {
        self.columns.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// New table holding the rows at `positions`
    pub fn take_rows(&self, positions: &[usize]) -> Result<Self> {
        let mut seen = HashSet::with_capacity(positions.len());
        if let Some(&p) = positions.iter().find(|&&p| !seen.insert(p)) {
            let label = self.index.get(p).unwrap_or_default();
            return Err(StoreError::duplicate_label(format!(
                "{label} (table row {p} selected more than once)"
            )));
        }
        let index = self.index.slice(positions)?;
        let mut table = Self::new(index);
        for (name, column) in self.iter() {
            table.set_column(name, column.take(positions)?)?;
        }
        Ok(table)
    }
}

impl PartialEq for TypedTable {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.columns == other.columns
    }
}
