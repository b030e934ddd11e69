//! # Element Codec
//!
//! Tagged serializer/deserializer between `Element` values and the backing
//! store. Every stored element carries `encoding-type` and
//! `encoding-version` attributes, plus `shape` for array, sparse and table
//! kinds. Decoding reads the tag first and dispatches; an absent or unknown
//! tag fails with `TypeMismatch`.
//!
//! ## Layout per encoding
//! - `array`, `scalar`: one dataset (a scalar is a 0-d array)
//! - `sparse-row` / `sparse-column`: group with `data`, `indices`,
//!   `index-pointers`
//! - `table`: group with `_index` (row labels), one entry per column and a
//!   `column-order` attribute; categorical columns are `categorical` groups
//!   holding `codes` and `categories`
//! - `mapping`: group with one entry per key, recursively
//!
//! Top-level group writes are staged and swapped in atomically; nested
//! children are written directly into the staging directory.

use std::ops::Range;

use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::data::table::INDEX_KEY;
use crate::data::{
    validate_name, AxisIndex, Categorical, Column, DType, DenseArray, Element, Encoding, Mapping,
    Selection, SparseFormat, SparseMatrix, TypedTable,
};
use crate::error::{Result, StoreError};
use crate::io::array_file::{consecutive_runs, Dataset};
use crate::io::store::{Attributes, Group, Node};

const ENCODING_TYPE: &str = "encoding-type";
const ENCODING_VERSION: &str = "encoding-version";
const SHAPE: &str = "shape";
const COLUMN_ORDER: &str = "column-order";
const ORDERED: &str = "ordered";

const SPARSE_DATA: &str = "data";
const SPARSE_INDICES: &str = "indices";
const SPARSE_INDPTR: &str = "index-pointers";
const CAT_CODES: &str = "codes";
const CAT_CATEGORIES: &str = "categories";

/// Tag, dtype and shape of a stored element, read without its payload
#[derive(Clone, Debug, PartialEq)]
pub struct ElementInfo {
    pub encoding: Encoding,
    pub dtype: Option<DType>,
    pub shape: Option<Vec<usize>>,
}

impl ElementInfo {
    /// Describe an in-memory element
    pub fn of(element: &Element) -> Self {
        Self {
            encoding: element.encoding(),
            dtype: element.dtype(),
            shape: element.shape(),
        }
    }

    /// Leading dimension, for kinds that have one
    pub fn n_rows(&self) -> Option<usize> {
        self.shape.as_ref().and_then(|s| s.first().copied())
    }
}

fn element_attrs(encoding: Encoding, shape: Option<&[usize]>) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert(ENCODING_TYPE.into(), json!(encoding.as_str()));
    attrs.insert(ENCODING_VERSION.into(), json!(encoding.version()));
    if let Some(shape) = shape {
        attrs.insert(SHAPE.into(), json!(shape));
    }
    attrs
}

fn read_encoding(attrs: &Attributes, location: &str) -> Result<Encoding> {
    let tag = match attrs.get(ENCODING_TYPE) {
        Some(Value::String(tag)) => tag,
        Some(_) => {
            return Err(StoreError::type_mismatch(format!(
                "{location}: encoding-type is not a string"
            )))
        }
        None => {
            return Err(StoreError::type_mismatch(format!(
                "{location}: missing encoding-type"
            )))
        }
    };
    let encoding: Encoding = tag.parse()?;
    let version = attrs
        .get(ENCODING_VERSION)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            StoreError::type_mismatch(format!("{location}: missing encoding-version"))
        })?;
    if major(version) != major(encoding.version()) {
        return Err(StoreError::type_mismatch(format!(
            "{location}: unsupported {encoding} encoding-version {version}"
        )));
    }
    Ok(encoding)
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

fn read_shape(attrs: &Attributes, location: &str) -> Result<Vec<usize>> {
    let values = attrs
        .get(SHAPE)
        .and_then(Value::as_array)
        .ok_or_else(|| StoreError::type_mismatch(format!("{location}: missing shape attribute")))?;
    values
        .iter()
        .map(|v| {
            v.as_u64().map(|n| n as usize).ok_or_else(|| {
                StoreError::type_mismatch(format!("{location}: malformed shape attribute"))
            })
        })
        .collect()
}

/// Fail with `TypeMismatch` unless the `shape` attribute equals `actual`
fn check_declared_shape(attrs: &Attributes, location: &str, actual: &[usize]) -> Result<()> {
    let declared = read_shape(attrs, location)?;
    if declared != actual {
        return Err(StoreError::type_mismatch(format!(
            "{location}: shape attribute {declared:?} disagrees with payload {actual:?}"
        )));
    }
    Ok(())
}

/// Rows and columns of a stored table, from its `_index` and column list
fn table_extent(group: &Group, attrs: &Attributes, location: &str) -> Result<[usize; 2]> {
    let rows = match group.dataset(INDEX_KEY)?.shape() {
        &[n] => n,
        other => {
            return Err(StoreError::type_mismatch(format!(
                "{location}: _index must be 1-d, got {other:?}"
            )))
        }
    };
    let columns = match attrs.get(COLUMN_ORDER).and_then(Value::as_array) {
        Some(order) => order.len(),
        None => group.list()?.iter().filter(|n| *n != INDEX_KEY).count(),
    };
    Ok([rows, columns])
}

// ============================================================================
// Encoding
// ============================================================================

/// Write `element` under `parent/name`, replacing any previous entry
#[instrument(skip(parent, element), fields(group = %parent.name(), encoding = %element.encoding()))]
pub fn encode(parent: &Group, name: &str, element: &Element) -> Result<()> {
    validate_name(name)?;
    match element {
        Element::Array(_) | Element::Scalar(_) => write_leaf(parent, name, element),
        _ => {
            let staged = parent.stage_group(name)?;
            write_group_body(staged.group(), element)?;
            staged.commit()?;
            debug!(name, "committed element group");
            Ok(())
        }
    }
}

/// Create an empty `mapping` group that children are encoded into one by one
pub fn create_mapping_group(parent: &Group, name: &str) -> Result<Group> {
    let group = parent.create_group(name)?;
    group.set_attrs(&element_attrs(Encoding::Mapping, None))?;
    Ok(group)
}

fn write_nested(parent: &Group, name: &str, element: &Element) -> Result<()> {
    match element {
        Element::Array(_) | Element::Scalar(_) => write_leaf(parent, name, element),
        _ => {
            let group = parent.create_group(name)?;
            write_group_body(&group, element)
        }
    }
}

fn write_leaf(parent: &Group, name: &str, element: &Element) -> Result<()> {
    match element {
        Element::Array(a) => {
            parent.write_array(name, a, &element_attrs(Encoding::Array, Some(a.shape())))
        }
        Element::Scalar(s) => parent.write_array(
            name,
            &s.clone().into_array(),
            &element_attrs(Encoding::Scalar, None),
        ),
        other => Err(StoreError::type_mismatch(format!(
            "{} is not a leaf encoding",
            other.encoding()
        ))),
    }
}

fn write_group_body(group: &Group, element: &Element) -> Result<()> {
    match element {
        Element::Sparse(m) => write_sparse(group, m),
        Element::Table(t) => write_table(group, t),
        Element::Mapping(entries) => {
            group.set_attrs(&element_attrs(Encoding::Mapping, None))?;
            for (key, value) in entries {
                write_nested(group, key, value)?;
            }
            Ok(())
        }
        other => Err(StoreError::type_mismatch(format!(
            "{} is not a group encoding",
            other.encoding()
        ))),
    }
}

fn write_index_array(group: &Group, name: &str, values: &[usize]) -> Result<()> {
    let values: Vec<i64> = values.iter().map(|&v| v as i64).collect();
    let array = DenseArray::from(values);
    group.write_array(name, &array, &element_attrs(Encoding::Array, Some(array.shape())))
}

fn write_sparse(group: &Group, matrix: &SparseMatrix) -> Result<()> {
    let shape = matrix.shape();
    group.set_attrs(&element_attrs(matrix.format().into(), Some(&shape)))?;
    let data = matrix.data();
    group.write_array(
        SPARSE_DATA,
        data,
        &element_attrs(Encoding::Array, Some(data.shape())),
    )?;
    write_index_array(group, SPARSE_INDICES, matrix.indices())?;
    write_index_array(group, SPARSE_INDPTR, matrix.indptr())
}

fn write_table(group: &Group, table: &TypedTable) -> Result<()> {
    let shape = [table.n_rows(), table.n_columns()];
    let mut attrs = element_attrs(Encoding::Table, Some(&shape));
    let order: Vec<&str> = table.column_names().collect();
    attrs.insert(COLUMN_ORDER.into(), json!(order));
    group.set_attrs(&attrs)?;

    let labels = DenseArray::from(table.index().to_strings());
    group.write_array(
        INDEX_KEY,
        &labels,
        &element_attrs(Encoding::Array, Some(labels.shape())),
    )?;
    for (name, column) in table.iter() {
        match column {
            Column::Array(a) => {
                group.write_array(name, a, &element_attrs(Encoding::Array, Some(a.shape())))?
            }
            Column::Categorical(c) => write_categorical(group, name, c)?,
        }
    }
    Ok(())
}

fn write_categorical(parent: &Group, name: &str, cat: &Categorical) -> Result<()> {
    let group = parent.create_group(name)?;
    let mut attrs = element_attrs(Encoding::Categorical, Some(&[cat.len()]));
    attrs.insert(ORDERED.into(), json!(cat.ordered()));
    group.set_attrs(&attrs)?;

    // narrowest signed width that holds every code
    let n = cat.categories().len();
    let codes = if n <= i8::MAX as usize {
        DenseArray::from(cat.codes().iter().map(|&c| c as i8).collect::<Vec<_>>())
    } else if n <= i16::MAX as usize {
        DenseArray::from(cat.codes().iter().map(|&c| c as i16).collect::<Vec<_>>())
    } else {
        DenseArray::from(cat.codes().to_vec())
    };
    group.write_array(
        CAT_CODES,
        &codes,
        &element_attrs(Encoding::Array, Some(codes.shape())),
    )?;
    let categories = DenseArray::from(cat.categories().to_vec());
    group.write_array(
        CAT_CATEGORIES,
        &categories,
        &element_attrs(Encoding::Array, Some(categories.shape())),
    )
}

// ============================================================================
// Decoding
// ============================================================================

/// Read the element stored under `parent/name`
#[instrument(skip(parent), fields(group = %parent.name()))]
pub fn decode(parent: &Group, name: &str) -> Result<Element> {
    let node = require(parent, name)?;
    decode_node(&node)
}

/// Read tag, dtype and shape of `parent/name` without its payload
pub fn inspect(parent: &Group, name: &str) -> Result<ElementInfo> {
    match require(parent, name)? {
        Node::Dataset(ds) => {
            let location = ds.path().display().to_string();
            match read_encoding(ds.attrs(), &location)? {
                Encoding::Array => {
                    check_declared_shape(ds.attrs(), &location, ds.shape())?;
                    Ok(ElementInfo {
                        encoding: Encoding::Array,
                        dtype: Some(ds.dtype()),
                        shape: Some(ds.shape().to_vec()),
                    })
                }
                Encoding::Scalar => Ok(ElementInfo {
                    encoding: Encoding::Scalar,
                    dtype: Some(ds.dtype()),
                    shape: None,
                }),
                other => Err(misplaced(other, &location)),
            }
        }
        Node::Group(g) => {
            let location = g.name();
            let attrs = g.attrs()?;
            let encoding = read_encoding(&attrs, &location)?;
            match encoding {
                Encoding::SparseRow | Encoding::SparseColumn => {
                    let [n_rows, n_cols] = sparse_shape(&attrs, &location)?;
                    let major = if encoding == Encoding::SparseRow { n_rows } else { n_cols };
                    if g.dataset(SPARSE_INDPTR)?.shape() != [major + 1].as_slice() {
                        return Err(StoreError::type_mismatch(format!(
                            "{location}: index pointers disagree with shape [{n_rows}, {n_cols}]"
                        )));
                    }
                    Ok(ElementInfo {
                        encoding,
                        dtype: Some(g.dataset(SPARSE_DATA)?.dtype()),
                        shape: Some(vec![n_rows, n_cols]),
                    })
                }
                Encoding::Table => {
                    let extent = table_extent(&g, &attrs, &location)?;
                    check_declared_shape(&attrs, &location, &extent)?;
                    Ok(ElementInfo {
                        encoding,
                        dtype: None,
                        shape: Some(extent.to_vec()),
                    })
                }
                Encoding::Mapping => Ok(ElementInfo {
                    encoding,
                    dtype: None,
                    shape: None,
                }),
                other => Err(misplaced(other, &location)),
            }
        }
    }
}

/// Read a subset of rows of `parent/name`.
///
/// Dense arrays and row-compressed matrices read only the requested byte
/// ranges; other kinds are decoded fully and then subset.
#[instrument(skip(parent, rows), fields(group = %parent.name()))]
pub fn decode_rows(parent: &Group, name: &str, rows: &Selection) -> Result<Element> {
    let node = require(parent, name)?;
    match &node {
        Node::Dataset(ds) => {
            let location = ds.path().display().to_string();
            match read_encoding(ds.attrs(), &location)? {
                Encoding::Array => {
                    check_declared_shape(ds.attrs(), &location, ds.shape())?;
                    let n_rows = ds.shape().first().copied().ok_or_else(|| {
                        StoreError::shape_mismatch(format!("{location}: 0-d array has no rows"))
                    })?;
                    let array = match rows {
                        Selection::All => ds.read()?,
                        Selection::Range(r) => ds.read_rows(r.clone())?,
                        Selection::Indices(_) => ds.read_row_indices(&rows.resolve(n_rows)?)?,
                    };
                    Ok(Element::Array(array))
                }
                Encoding::Scalar => Err(StoreError::type_mismatch(format!(
                    "{location}: scalars have no rows"
                ))),
                other => Err(misplaced(other, &location)),
            }
        }
        Node::Group(g) => {
            let attrs = g.attrs()?;
            if read_encoding(&attrs, &g.name())? == Encoding::SparseRow && !rows.is_all() {
                return Ok(Element::Sparse(read_csr_rows(g, &attrs, rows)?));
            }
            decode_node(&node)?.select_rows(rows)
        }
    }
}

fn require(parent: &Group, name: &str) -> Result<Node> {
    parent.node(name)?.ok_or_else(|| {
        StoreError::key_not_found(format!("{}/{name}", parent.name().trim_end_matches('/')))
    })
}

fn misplaced(encoding: Encoding, location: &str) -> StoreError {
    StoreError::type_mismatch(format!("{location}: unexpected {encoding} entry here"))
}

fn decode_node(node: &Node) -> Result<Element> {
    match node {
        Node::Dataset(ds) => decode_dataset(ds),
        Node::Group(g) => {
            let location = g.name();
            let attrs = g.attrs()?;
            match read_encoding(&attrs, &location)? {
                Encoding::SparseRow => Ok(Element::Sparse(decode_sparse(g, &attrs, SparseFormat::Csr)?)),
                Encoding::SparseColumn => {
                    Ok(Element::Sparse(decode_sparse(g, &attrs, SparseFormat::Csc)?))
                }
                Encoding::Table => Ok(Element::Table(decode_table(g, &attrs)?)),
                Encoding::Mapping => {
                    let mut entries = Mapping::new();
                    for key in g.list()? {
                        let child = require(g, &key)?;
                        entries.insert(key, decode_node(&child)?);
                    }
                    Ok(Element::Mapping(entries))
                }
                other => Err(misplaced(other, &location)),
            }
        }
    }
}

fn decode_dataset(ds: &Dataset) -> Result<Element> {
    let location = ds.path().display().to_string();
    match read_encoding(ds.attrs(), &location)? {
        Encoding::Array => {
            check_declared_shape(ds.attrs(), &location, ds.shape())?;
            Ok(Element::Array(ds.read()?))
        }
        Encoding::Scalar => Ok(Element::Scalar(
            ds.read()?
                .into_scalar()
                .map_err(|e| StoreError::type_mismatch(format!("{location}: {e}")))?,
        )),
        other => Err(misplaced(other, &location)),
    }
}

/// Any integer array as non-negative positions
fn to_positions(array: DenseArray, location: &str) -> Result<Vec<usize>> {
    let bad = || StoreError::type_mismatch(format!("{location}: expected non-negative integers"));
    macro_rules! convert {
        ($a:expr) => {
            $a.iter()
                .map(|&v| usize::try_from(v).map_err(|_| bad()))
                .collect()
        };
    }
    match array {
        DenseArray::I8(a) => convert!(a),
        DenseArray::I16(a) => convert!(a),
        DenseArray::I32(a) => convert!(a),
        DenseArray::I64(a) => convert!(a),
        DenseArray::U8(a) => convert!(a),
        DenseArray::U16(a) => convert!(a),
        DenseArray::U32(a) => convert!(a),
        DenseArray::U64(a) => convert!(a),
        _ => Err(bad()),
    }
}

fn read_index_entry(group: &Group, name: &str, range: Option<Range<usize>>) -> Result<Vec<usize>> {
    let ds = group.dataset(name)?;
    let location = ds.path().display().to_string();
    if ds.shape().len() != 1 {
        return Err(StoreError::type_mismatch(format!("{location}: expected a 1-d array")));
    }
    let array = match range {
        Some(r) => ds.read_rows(r)?,
        None => ds.read()?,
    };
    to_positions(array, &location)
}

fn sparse_shape(attrs: &Attributes, location: &str) -> Result<[usize; 2]> {
    match read_shape(attrs, location)?.as_slice() {
        &[r, c] => Ok([r, c]),
        other => Err(StoreError::type_mismatch(format!(
            "{location}: sparse shape must be 2-d, got {other:?}"
        ))),
    }
}

fn decode_sparse(group: &Group, attrs: &Attributes, format: SparseFormat) -> Result<SparseMatrix> {
    let location = group.name();
    let shape = sparse_shape(attrs, &location)?;
    let data = group.dataset(SPARSE_DATA)?.read()?;
    let indices = read_index_entry(group, SPARSE_INDICES, None)?;
    let indptr = read_index_entry(group, SPARSE_INDPTR, None)?;
    SparseMatrix::new(format, shape, data, indices, indptr)
        .map_err(|e| StoreError::type_mismatch(format!("{location}: {e}")))
}

fn read_csr_rows(group: &Group, attrs: &Attributes, rows: &Selection) -> Result<SparseMatrix> {
    let location = group.name();
    let [n_rows, n_cols] = sparse_shape(attrs, &location)?;
    let positions = rows.resolve(n_rows)?;
    let indptr = read_index_entry(group, SPARSE_INDPTR, None)?;
    if indptr.len() != n_rows + 1 {
        return Err(StoreError::type_mismatch(format!(
            "{location}: index pointers disagree with shape"
        )));
    }
    let data_ds = group.dataset(SPARSE_DATA)?;

    let mut new_indptr = vec![0usize];
    let mut data_parts = Vec::new();
    let mut indices = Vec::new();
    for run in consecutive_runs(&positions) {
        let window = &indptr[run.start..=run.end];
        if window.windows(2).any(|w| w[0] > w[1]) {
            return Err(StoreError::type_mismatch(format!(
                "{location}: index pointers must be non-decreasing"
            )));
        }
        let (k0, k1) = (window[0], window[window.len() - 1]);
        data_parts.push(data_ds.read_rows(k0..k1)?);
        indices.extend(read_index_entry(group, SPARSE_INDICES, Some(k0..k1))?);
        let base = *new_indptr.last().unwrap_or(&0);
        new_indptr.extend(run.map(|r| base + indptr[r + 1] - k0));
    }
    let data = if data_parts.is_empty() {
        DenseArray::zeros(data_ds.dtype(), &[0])
    } else {
        DenseArray::concat_rows(&data_parts)?
    };
    SparseMatrix::new(SparseFormat::Csr, [positions.len(), n_cols], data, indices, new_indptr)
        .map_err(|e| StoreError::type_mismatch(format!("{location}: {e}")))
}

fn decode_table(group: &Group, attrs: &Attributes) -> Result<TypedTable> {
    let location = group.name();
    let labels = group.dataset(INDEX_KEY)?.read()?;
    if labels.ndim() != 1 {
        return Err(StoreError::type_mismatch(format!("{location}: _index must be 1-d")));
    }
    let labels: Vec<String> = labels.to_flat_vec()?;
    let mut table = TypedTable::new(AxisIndex::new(labels)?);

    let order: Vec<String> = match attrs.get(COLUMN_ORDER) {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| StoreError::type_mismatch(format!("{location}: bad column-order: {e}")))?,
        None => group
            .list()?
            .into_iter()
            .filter(|n| n != INDEX_KEY)
            .collect(),
    };
    for name in order {
        let column = match require(group, &name)? {
            Node::Dataset(ds) => match decode_dataset(&ds)? {
                Element::Array(a) => Column::Array(a),
                other => return Err(misplaced(other.encoding(), &ds.path().display().to_string())),
            },
            Node::Group(g) => Column::Categorical(decode_categorical(&g)?),
        };
        table
            .set_column(name, column)
            .map_err(|e| StoreError::type_mismatch(format!("{location}: {e}")))?;
    }
    check_declared_shape(attrs, &location, &[table.n_rows(), table.n_columns()])?;
    Ok(table)
}

fn decode_categorical(group: &Group) -> Result<Categorical> {
    let location = group.name();
    let attrs = group.attrs()?;
    let encoding = read_encoding(&attrs, &location)?;
    if encoding != Encoding::Categorical {
        return Err(misplaced(encoding, &location));
    }
    let ordered = attrs.get(ORDERED).and_then(Value::as_bool).unwrap_or(false);
    let codes: Vec<i32> = match group.dataset(CAT_CODES)?.read()? {
        DenseArray::I8(a) => a.iter().map(|&c| c as i32).collect(),
        DenseArray::I16(a) => a.iter().map(|&c| c as i32).collect(),
        DenseArray::I32(a) => a.iter().copied().collect(),
        other => {
            return Err(StoreError::type_mismatch(format!(
                "{location}: categorical codes must be signed, found {}",
                other.dtype()
            )))
        }
    };
    check_declared_shape(&attrs, &location, &[codes.len()])?;
    let categories: Vec<String> = group.dataset(CAT_CATEGORIES)?.read()?.to_flat_vec()?;
    Categorical::new(codes, categories, ordered)
        .map_err(|e| StoreError::type_mismatch(format!("{location}: {e}")))
}
