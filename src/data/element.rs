//! # Elements
//!
//! `Element` is the closed set of storable values: dense arrays, sparse
//! matrices, typed tables, scalars and nested mappings. Every slot of an
//! annotated matrix holds one of these.
//!
//! The row algebra here (`select_rows`, `take_rows_filled`,
//! `take_columns_filled`, `concat_rows`) is shared by backed subset reads
//! and by multi-file concatenation.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use ndarray::{Array, Dimension};

use crate::config::FillPolicy;
use crate::data::array::DenseArray;
use crate::data::axis::AxisIndex;
use crate::data::dtype::{ArrayType, DType, Scalar};
use crate::data::sparse::{SparseFormat, SparseMatrix};
use crate::data::table::{Column, TypedTable};
use crate::error::{Result, StoreError};

/// Named collection of elements, nested to any depth
pub type Mapping = BTreeMap<String, Element>;

/// Persisted tag identifying which variant a stored record represents
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Encoding {
    Array,
    SparseRow,
    SparseColumn,
    Table,
    Scalar,
    Mapping,
    Categorical,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Array => "array",
            Encoding::SparseRow => "sparse-row",
            Encoding::SparseColumn => "sparse-column",
            Encoding::Table => "table",
            Encoding::Scalar => "scalar",
            Encoding::Mapping => "mapping",
            Encoding::Categorical => "categorical",
        }
    }

    /// Tag written alongside the encoding type
    pub fn version(self) -> &'static str {
        match self {
            Encoding::Array | Encoding::Scalar => "0.2.0",
            Encoding::SparseRow | Encoding::SparseColumn => "0.1.0",
            Encoding::Table => "0.2.0",
            Encoding::Mapping => "0.1.0",
            Encoding::Categorical => "0.2.0",
        }
    }

    pub fn is_sparse(self) -> bool {
        matches!(self, Encoding::SparseRow | Encoding::SparseColumn)
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "array" => Encoding::Array,
            "sparse-row" => Encoding::SparseRow,
            "sparse-column" => Encoding::SparseColumn,
            "table" => Encoding::Table,
            "scalar" => Encoding::Scalar,
            "mapping" => Encoding::Mapping,
            "categorical" => Encoding::Categorical,
            other => {
                return Err(StoreError::type_mismatch(format!(
                    "unknown encoding-type `{other}`"
                )))
            }
        })
    }
}

impl From<SparseFormat> for Encoding {
    fn from(format: SparseFormat) -> Self {
        match format {
            SparseFormat::Csr => Encoding::SparseRow,
            SparseFormat::Csc => Encoding::SparseColumn,
        }
    }
}

/// Positions along one axis
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Selection {
    /// Every position
    #[default]
    All,
    /// Contiguous range
    Range(Range<usize>),
    /// Arbitrary positions; order is kept and repeats are allowed, except
    /// for rows of a table, whose labels must stay unique (`DuplicateLabel`)
    Indices(Vec<usize>),
}

impl Selection {
    /// Number of selected positions on an axis of `extent`
    pub fn len(&self, extent: usize) -> usize {
        match self {
            Selection::All => extent,
            Selection::Range(r) => r.len(),
            Selection::Indices(idx) => idx.len(),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Selection::All)
    }

    /// Explicit positions, bounds-checked against `extent`
    pub fn resolve(&self, extent: usize) -> Result<Vec<usize>> {
        match self {
            Selection::All => Ok((0..extent).collect()),
            Selection::Range(r) => {
                if r.start > r.end || r.end > extent {
                    return Err(StoreError::OutOfBounds {
                        index: r.end,
                        len: extent,
                    });
                }
                Ok(r.clone().collect())
            }
            Selection::Indices(idx) => match idx.iter().find(|&&i| i >= extent) {
                Some(&index) => Err(StoreError::OutOfBounds { index, len: extent }),
                None => Ok(idx.clone()),
            },
        }
    }

    /// Contiguous range equivalent, when one exists
    pub fn as_range(&self, extent: usize) -> Option<Range<usize>> {
        match self {
            Selection::All => Some(0..extent),
            Selection::Range(r) => Some(r.clone()),
            Selection::Indices(_) => None,
        }
    }
}

impl From<Range<usize>> for Selection {
    fn from(range: Range<usize>) -> Self {
        Selection::Range(range)
    }
}

impl From<Vec<usize>> for Selection {
    fn from(indices: Vec<usize>) -> Self {
        Selection::Indices(indices)
    }
}

impl From<&[usize]> for Selection {
    fn from(indices: &[usize]) -> Self {
        Selection::Indices(indices.to_vec())
    }
}

/// A storable value
#[derive(Clone, Debug, PartialEq)]
pub enum Element {
    Array(DenseArray),
    Sparse(SparseMatrix),
    Table(TypedTable),
    Scalar(Scalar),
    Mapping(Mapping),
}

impl Element {
    /// Tag this element is persisted under
    pub fn encoding(&self) -> Encoding {
        match self {
            Element::Array(_) => Encoding::Array,
            Element::Sparse(m) => m.format().into(),
            Element::Table(_) => Encoding::Table,
            Element::Scalar(_) => Encoding::Scalar,
            Element::Mapping(_) => Encoding::Mapping,
        }
    }

    /// Shape for array-like kinds; tables report `[rows, columns]`
    pub fn shape(&self) -> Option<Vec<usize>> {
        match self {
            Element::Array(a) => Some(a.shape().to_vec()),
            Element::Sparse(m) => Some(m.shape().to_vec()),
            Element::Table(t) => Some(vec![t.n_rows(), t.n_columns()]),
            Element::Scalar(_) | Element::Mapping(_) => None,
        }
    }

    /// Leading dimension, for kinds that have one
    pub fn n_rows(&self) -> Option<usize> {
        match self {
            Element::Array(a) => a.n_rows(),
            Element::Sparse(m) => Some(m.n_rows()),
            Element::Table(t) => Some(t.n_rows()),
            Element::Scalar(_) | Element::Mapping(_) => None,
        }
    }

    pub fn dtype(&self) -> Option<DType> {
        match self {
            Element::Array(a) => Some(a.dtype()),
            Element::Sparse(m) => Some(m.dtype()),
            Element::Scalar(s) => Some(s.dtype()),
            Element::Table(_) | Element::Mapping(_) => None,
        }
    }

    pub fn as_array(&self) -> Option<&DenseArray> {
        match self {
            Element::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_sparse(&self) -> Option<&SparseMatrix> {
        match self {
            Element::Sparse(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TypedTable> {
        match self {
            Element::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Element::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            Element::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_array(self) -> Result<DenseArray> {
        match self {
            Element::Array(a) => Ok(a),
            other => Err(other.kind_error("array")),
        }
    }

    pub fn into_sparse(self) -> Result<SparseMatrix> {
        match self {
            Element::Sparse(m) => Ok(m),
            other => Err(other.kind_error("sparse matrix")),
        }
    }

    pub fn into_table(self) -> Result<TypedTable> {
        match self {
            Element::Table(t) => Ok(t),
            other => Err(other.kind_error("table")),
        }
    }

    pub fn into_mapping(self) -> Result<Mapping> {
        match self {
            Element::Mapping(m) => Ok(m),
            other => Err(other.kind_error("mapping")),
        }
    }

    /// Typed value of a scalar element
    pub fn scalar_value<T: ArrayType>(&self) -> Result<T> {
        self.as_scalar()
            .and_then(|s| s.get::<T>())
            .ok_or_else(|| self.kind_error(T::DTYPE.as_str()))
    }

    /// Dense view of an array or sparse element
    pub fn to_dense(&self) -> Result<DenseArray> {
        match self {
            Element::Array(a) => Ok(a.clone()),
            Element::Sparse(m) => m.to_dense(),
            other => Err(other.kind_error("array or sparse matrix")),
        }
    }

    fn kind_error(&self, expected: &str) -> StoreError {
        StoreError::type_mismatch(format!("expected {expected}, found {}", self.encoding()))
    }

    /// Rows along the leading axis
    pub fn select_rows(&self, rows: &Selection) -> Result<Element> {
        if rows.is_all() {
            return Ok(self.clone());
        }
        let extent = self
            .n_rows()
            .ok_or_else(|| self.kind_error("element with a leading dimension"))?;
        if let (Some(range), Element::Array(a)) = (rows.as_range(extent), self) {
            return Ok(Element::Array(a.slice_rows(range)?));
        }
        let positions = rows.resolve(extent)?;
        match self {
            Element::Array(a) => Ok(Element::Array(a.take_rows(&positions)?)),
            Element::Sparse(m) => {
                let positions: Vec<Option<usize>> = positions.into_iter().map(Some).collect();
                Ok(Element::Sparse(m.take_rows(&positions)?))
            }
            Element::Table(t) => Ok(Element::Table(t.take_rows(&positions)?)),
            _ => Err(self.kind_error("element with a leading dimension")),
        }
    }

    /// Columns of a matrix-shaped element
    pub fn select_columns(&self, cols: &Selection) -> Result<Element> {
        if cols.is_all() {
            return Ok(self.clone());
        }
        let extent = match self.shape() {
            Some(shape) if shape.len() >= 2 => shape[1],
            _ => return Err(self.kind_error("matrix")),
        };
        let positions: Vec<Option<usize>> = cols.resolve(extent)?.into_iter().map(Some).collect();
        self.take_columns_filled(&positions, &FillPolicy::default())
    }

    /// Rows at `positions`; `None` entries become fill rows (empty rows for sparse)
    pub fn take_rows_filled(&self, positions: &[Option<usize>], policy: &FillPolicy) -> Result<Element> {
        match self {
            Element::Array(a) => Ok(Element::Array(a.take_rows_filled(positions, policy)?)),
            Element::Sparse(m) => Ok(Element::Sparse(m.take_rows(positions)?)),
            Element::Table(t) => {
                let positions = positions
                    .iter()
                    .map(|p| p.ok_or_else(|| StoreError::type_mismatch("tables cannot take fill rows")))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Element::Table(t.take_rows(&positions)?))
            }
            _ => Err(self.kind_error("element with a leading dimension")),
        }
    }

    /// Columns at `positions` of a matrix; `None` entries become fill columns
    pub fn take_columns_filled(
        &self,
        positions: &[Option<usize>],
        policy: &FillPolicy,
    ) -> Result<Element> {
        match self {
            Element::Array(a) => Ok(Element::Array(a.take_columns_filled(positions, policy)?)),
            Element::Sparse(m) => Ok(Element::Sparse(m.take_columns(positions)?)),
            _ => Err(self.kind_error("matrix")),
        }
    }

    /// Stack elements of one kind along the leading axis
    pub fn concat_rows(parts: &[Element]) -> Result<Element> {
        let first = parts
            .first()
            .ok_or_else(|| StoreError::shape_mismatch("cannot concatenate zero elements"))?;
        match first {
            Element::Array(_) => {
                let arrays = parts
                    .iter()
                    .map(|p| p.clone().into_array())
                    .collect::<Result<Vec<_>>>()?;
                Ok(Element::Array(DenseArray::concat_rows(&arrays)?))
            }
            Element::Sparse(_) => {
                let matrices = parts
                    .iter()
                    .map(|p| p.clone().into_sparse())
                    .collect::<Result<Vec<_>>>()?;
                Ok(Element::Sparse(SparseMatrix::concat_rows(&matrices)?))
            }
            Element::Table(_) => {
                let tables = parts
                    .iter()
                    .map(|p| p.as_table().ok_or_else(|| p.kind_error("table")))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Element::Table(concat_tables(&tables)?))
            }
            other => Err(other.kind_error("element with a leading dimension")),
        }
    }
}

/// Stack tables with identical column names and kinds; labels must stay unique
fn concat_tables(tables: &[&TypedTable]) -> Result<TypedTable> {
    let first = tables
        .first()
        .ok_or_else(|| StoreError::shape_mismatch("cannot concatenate zero tables"))?;
    let names: Vec<&str> = first.column_names().collect();
    let labels = tables
        .iter()
        .flat_map(|t| t.index().labels().iter().cloned())
        .collect::<Vec<_>>();
    let mut out = TypedTable::new(AxisIndex::new(labels)?);
    for name in names {
        let parts = tables
            .iter()
            .map(|t| t.get_column(name))
            .collect::<Result<Vec<&Column>>>()?;
        out.set_column(name, Column::concat(&parts)?)?;
    }
    Ok(out)
}

impl From<DenseArray> for Element {
    fn from(value: DenseArray) -> Self {
        Element::Array(value)
    }
}

impl From<SparseMatrix> for Element {
    fn from(value: SparseMatrix) -> Self {
        Element::Sparse(value)
    }
}

impl From<TypedTable> for Element {
    fn from(value: TypedTable) -> Self {
        Element::Table(value)
    }
}

impl From<Scalar> for Element {
    fn from(value: Scalar) -> Self {
        Element::Scalar(value)
    }
}

impl From<Mapping> for Element {
    fn from(value: Mapping) -> Self {
        Element::Mapping(value)
    }
}

impl<T: ArrayType, D: Dimension> From<Array<T, D>> for Element {
    fn from(value: Array<T, D>) -> Self {
        Element::Array(value.into())
    }
}

impl<T: ArrayType> From<Vec<T>> for Element {
    fn from(value: Vec<T>) -> Self {
        Element::Array(value.into())
    }
}

macro_rules! impl_element_from_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Element {
                fn from(value: $ty) -> Self {
                    Element::Scalar(Scalar::from(value))
                }
            }
        )*
    };
}

impl_element_from_scalar!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, bool, String, &str);
