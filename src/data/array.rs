//! # Dense Arrays
//!
//! `DenseArray` is an n-dimensional array with one variant per dtype, each
//! backed by `ndarray::ArrayD`. Row-wise helpers (`take_rows`,
//! `concat_rows`, ...) are the building blocks for subset reads and for
//! multi-file concatenation.
//!
//! Equality treats NaN as equal to NaN so round-trips of float payloads
//! compare cleanly.

use std::ops::Range;

use ndarray::{Array, ArrayD, Axis, Dimension, IxDyn, Slice};

use crate::config::FillPolicy;
use crate::data::dtype::{with_dtype, ArrayType, DType, Scalar};
use crate::error::{Result, StoreError};

/// Dense n-dimensional array of a single dtype
#[derive(Clone, Debug)]
pub enum DenseArray {
    I8(ArrayD<i8>),
    I16(ArrayD<i16>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    U64(ArrayD<u64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    Bool(ArrayD<bool>),
    String(ArrayD<String>),
}

/// Evaluate `$body` with `$a` bound to the inner array, whatever the variant
macro_rules! dispatch {
    ($value:expr, $a:ident => $body:expr) => {
        match $value {
            DenseArray::I8($a) => $body,
            DenseArray::I16($a) => $body,
            DenseArray::I32($a) => $body,
            DenseArray::I64($a) => $body,
            DenseArray::U8($a) => $body,
            DenseArray::U16($a) => $body,
            DenseArray::U32($a) => $body,
            DenseArray::U64($a) => $body,
            DenseArray::F32($a) => $body,
            DenseArray::F64($a) => $body,
            DenseArray::Bool($a) => $body,
            DenseArray::String($a) => $body,
        }
    };
}

/// Like `dispatch!`, rewrapping the result in the same variant
macro_rules! map_same {
    ($value:expr, $a:ident => $body:expr) => {
        match $value {
            DenseArray::I8($a) => DenseArray::I8($body),
            DenseArray::I16($a) => DenseArray::I16($body),
            DenseArray::I32($a) => DenseArray::I32($body),
            DenseArray::I64($a) => DenseArray::I64($body),
            DenseArray::U8($a) => DenseArray::U8($body),
            DenseArray::U16($a) => DenseArray::U16($body),
            DenseArray::U32($a) => DenseArray::U32($body),
            DenseArray::U64($a) => DenseArray::U64($body),
            DenseArray::F32($a) => DenseArray::F32($body),
            DenseArray::F64($a) => DenseArray::F64($body),
            DenseArray::Bool($a) => DenseArray::Bool($body),
            DenseArray::String($a) => DenseArray::String($body),
        }
    };
}

impl DenseArray {
    /// Build from a flat C-order buffer and a shape
    pub fn from_shape_vec<T: ArrayType>(shape: &[usize], data: Vec<T>) -> Result<Self> {
        let array = ArrayD::from_shape_vec(IxDyn(shape), data)
            .map_err(|e| StoreError::shape_mismatch(format!("shape {shape:?}: {e}")))?;
        Ok(T::wrap(array))
    }

    /// Array of `shape` where every element is the policy's fill for `dtype`
    pub fn filled(dtype: DType, shape: &[usize], policy: &FillPolicy) -> Self {
        with_dtype!(dtype, T => T::wrap(ArrayD::from_elem(IxDyn(shape), T::fill_value(policy))))
    }

    /// Array of `shape` holding the dtype's zero value
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        Self::filled(dtype, shape, &FillPolicy::zeros())
    }

    pub fn dtype(&self) -> DType {
        match self {
            DenseArray::I8(_) => DType::Int8,
            DenseArray::I16(_) => DType::Int16,
            DenseArray::I32(_) => DType::Int32,
            DenseArray::I64(_) => DType::Int64,
            DenseArray::U8(_) => DType::UInt8,
            DenseArray::U16(_) => DType::UInt16,
            DenseArray::U32(_) => DType::UInt32,
            DenseArray::U64(_) => DType::UInt64,
            DenseArray::F32(_) => DType::Float32,
            DenseArray::F64(_) => DType::Float64,
            DenseArray::Bool(_) => DType::Bool,
            DenseArray::String(_) => DType::String,
        }
    }

    pub fn shape(&self) -> &[usize] {
        dispatch!(self, a => a.shape())
    }

    pub fn ndim(&self) -> usize {
        dispatch!(self, a => a.ndim())
    }

    /// Total number of elements
    pub fn len(&self) -> usize {
        dispatch!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extent of the first axis; `None` for 0-d arrays
    pub fn n_rows(&self) -> Option<usize> {
        self.shape().first().copied()
    }

    /// Borrow as a typed array
    pub fn as_typed<T: ArrayType>(&self) -> Result<&ArrayD<T>> {
        T::unwrap_ref(self).ok_or_else(|| {
            StoreError::type_mismatch(format!("expected {} array, found {}", T::DTYPE, self.dtype()))
        })
    }

    /// Convert into a typed array
    pub fn into_typed<T: ArrayType>(self) -> Result<ArrayD<T>> {
        T::unwrap(self).map_err(|other| {
            StoreError::type_mismatch(format!(
                "expected {} array, found {}",
                T::DTYPE,
                other.dtype()
            ))
        })
    }

    /// Typed array with a fixed dimensionality
    pub fn into_dimensionality<T: ArrayType, D: Dimension>(self) -> Result<Array<T, D>> {
        self.into_typed::<T>()?
            .into_dimensionality::<D>()
            .map_err(|e| StoreError::shape_mismatch(e.to_string()))
    }

    /// Extract the value of a 0-d array
    pub fn into_scalar(self) -> Result<Scalar> {
        if self.ndim() != 0 {
            return Err(StoreError::shape_mismatch(format!(
                "expected 0-d array for scalar, found shape {:?}",
                self.shape()
            )));
        }
        dispatch!(self, a => {
            a.into_iter()
                .next()
                .map(ArrayType::into_scalar)
                .ok_or_else(|| StoreError::shape_mismatch("empty 0-d array"))
        })
    }

    /// Elements in logical (C) order
    pub fn to_flat_vec<T: ArrayType>(&self) -> Result<Vec<T>> {
        Ok(self.as_typed::<T>()?.iter().cloned().collect())
    }

    /// Rows at `positions`, in the given order (repeats allowed)
    pub fn take_rows(&self, positions: &[usize]) -> Result<Self> {
        self.check_axis(0)?;
        let len = self.shape()[0];
        check_positions(positions, len)?;
        Ok(map_same!(self, a => a.select(Axis(0), positions)))
    }

    /// Rows at `positions`; `None` entries become fill rows
    pub fn take_rows_filled(&self, positions: &[Option<usize>], policy: &FillPolicy) -> Result<Self> {
        self.take_axis_filled(Axis(0), positions, policy)
    }

    /// Columns of a matrix at `positions`; `None` entries become fill columns
    pub fn take_columns_filled(
        &self,
        positions: &[Option<usize>],
        policy: &FillPolicy,
    ) -> Result<Self> {
        self.take_axis_filled(Axis(1), positions, policy)
    }

    /// Contiguous row range
    pub fn slice_rows(&self, rows: Range<usize>) -> Result<Self> {
        self.check_axis(0)?;
        let len = self.shape()[0];
        if rows.start > rows.end || rows.end > len {
            return Err(StoreError::OutOfBounds {
                index: rows.end,
                len,
            });
        }
        Ok(map_same!(self, a => a.slice_axis(Axis(0), Slice::from(rows.clone())).to_owned()))
    }

    /// Stack arrays along the first axis; dtypes and trailing shapes must agree
    pub fn concat_rows(parts: &[DenseArray]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| StoreError::shape_mismatch("cannot concatenate zero arrays"))?;
        with_dtype!(first.dtype(), T => concat_typed::<T>(parts))
    }

    fn take_axis_filled(
        &self,
        axis: Axis,
        positions: &[Option<usize>],
        policy: &FillPolicy,
    ) -> Result<Self> {
        self.check_axis(axis.index())?;
        let len = self.shape()[axis.index()];
        for &p in positions.iter().flatten() {
            if p >= len {
                return Err(StoreError::OutOfBounds { index: p, len });
            }
        }
        Ok(map_same!(self, a => take_filled(a, axis, positions, policy)))
    }

    fn check_axis(&self, axis: usize) -> Result<()> {
        if self.ndim() <= axis {
            return Err(StoreError::shape_mismatch(format!(
                "array of shape {:?} has no axis {axis}",
                self.shape()
            )));
        }
        Ok(())
    }
}

fn check_positions(positions: &[usize], len: usize) -> Result<()> {
    match positions.iter().find(|&&p| p >= len) {
        Some(&index) => Err(StoreError::OutOfBounds { index, len }),
        None => Ok(()),
    }
}

fn take_filled<T: ArrayType>(
    a: &ArrayD<T>,
    axis: Axis,
    positions: &[Option<usize>],
    policy: &FillPolicy,
) -> ArrayD<T> {
    let mut shape = a.shape().to_vec();
    shape[axis.index()] = positions.len();
    let mut out = ArrayD::from_elem(IxDyn(&shape), T::fill_value(policy));
    for (i, src) in positions.iter().enumerate() {
        if let Some(s) = *src {
            out.index_axis_mut(axis, i).assign(&a.index_axis(axis, s));
        }
    }
    out
}

fn concat_typed<T: ArrayType>(parts: &[DenseArray]) -> Result<DenseArray> {
    let views = parts
        .iter()
        .map(|p| p.as_typed::<T>().map(|a| a.view()))
        .collect::<Result<Vec<_>>>()?;
    let joined = ndarray::concatenate(Axis(0), &views)
        .map_err(|e| StoreError::shape_mismatch(format!("cannot concatenate rows: {e}")))?;
    Ok(T::wrap(joined))
}

fn arrays_eq<T: ArrayType>(a: &ArrayD<T>, b: &ArrayD<T>) -> bool {
    a.shape() == b.shape() && a.iter().zip(b.iter()).all(|(x, y)| x.nan_eq(y))
}

impl PartialEq for DenseArray {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DenseArray::I8(a), DenseArray::I8(b)) => arrays_eq(a, b),
            (DenseArray::I16(a), DenseArray::I16(b)) => arrays_eq(a, b),
            (DenseArray::I32(a), DenseArray::I32(b)) => arrays_eq(a, b),
            (DenseArray::I64(a), DenseArray::I64(b)) => arrays_eq(a, b),
            (DenseArray::U8(a), DenseArray::U8(b)) => arrays_eq(a, b),
            (DenseArray::U16(a), DenseArray::U16(b)) => arrays_eq(a, b),
            (DenseArray::U32(a), DenseArray::U32(b)) => arrays_eq(a, b),
            (DenseArray::U64(a), DenseArray::U64(b)) => arrays_eq(a, b),
            (DenseArray::F32(a), DenseArray::F32(b)) => arrays_eq(a, b),
            (DenseArray::F64(a), DenseArray::F64(b)) => arrays_eq(a, b),
            (DenseArray::Bool(a), DenseArray::Bool(b)) => arrays_eq(a, b),
            (DenseArray::String(a), DenseArray::String(b)) => arrays_eq(a, b),
            _ => false,
        }
    }
}

impl<T: ArrayType, D: Dimension> From<Array<T, D>> for DenseArray {
    fn from(array: Array<T, D>) -> Self {
        T::wrap(array.into_dyn())
    }
}

impl<T: ArrayType> From<Vec<T>> for DenseArray {
    fn from(values: Vec<T>) -> Self {
        T::wrap(Array::from_vec(values).into_dyn())
    }
}

impl From<Vec<&str>> for DenseArray {
    fn from(values: Vec<&str>) -> Self {
        values
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_shape_and_dtype() {
        let a = DenseArray::from(array![[1i32, 2, 3], [4, 5, 6]]);
        assert_eq!(a.dtype(), DType::Int32);
        assert_eq!(a.shape(), &[2, 3]);
        assert_eq!(a.n_rows(), Some(2));
        assert_eq!(a.len(), 6);
    }

    #[test]
    fn test_nan_equality() {
        let a = DenseArray::from(vec![1.0f64, f64::NAN]);
        let b = DenseArray::from(vec![1.0f64, f64::NAN]);
        assert_eq!(a, b);
        let c = DenseArray::from(vec![1.0f32, f32::NAN]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_take_rows() {
        let a = DenseArray::from(array![[1u8, 2], [3, 4], [5, 6]]);
        let taken = a.take_rows(&[2, 0, 2]).unwrap();
        assert_eq!(taken, DenseArray::from(array![[5u8, 6], [1, 2], [5, 6]]));
        assert!(matches!(
            a.take_rows(&[3]),
            Err(StoreError::OutOfBounds { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_take_filled() {
        let a = DenseArray::from(array![[1.0f64, 2.0], [3.0, 4.0]]);
        let policy = FillPolicy::default();
        let cols = a.take_columns_filled(&[Some(1), None], &policy).unwrap();
        let cols: Array2<f64> = cols.into_dimensionality().unwrap();
        assert_eq!(cols[[0, 0]], 2.0);
        assert!(cols[[1, 1]].is_nan());

        let rows = a
            .take_rows_filled(&[None, Some(0)], &FillPolicy::zeros())
            .unwrap();
        assert_eq!(rows, DenseArray::from(array![[0.0f64, 0.0], [1.0, 2.0]]));
    }

    #[test]
    fn test_concat_rows() {
        let a = DenseArray::from(array![[1i64, 2]]);
        let b = DenseArray::from(array![[3i64, 4], [5, 6]]);
        let joined = DenseArray::concat_rows(&[a.clone(), b]).unwrap();
        assert_eq!(joined.shape(), &[3, 2]);

        let wrong_dtype = DenseArray::from(array![[1i32, 2]]);
        assert!(matches!(
            DenseArray::concat_rows(&[a.clone(), wrong_dtype]),
            Err(StoreError::TypeMismatch { .. })
        ));
        let wrong_width = DenseArray::from(array![[1i64, 2, 3]]);
        assert!(matches!(
            DenseArray::concat_rows(&[a, wrong_width]),
            Err(StoreError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_slice_rows_and_strings() {
        let a = DenseArray::from(vec!["a", "b", "c"]);
        assert_eq!(a.dtype(), DType::String);
        assert_eq!(a.slice_rows(1..3).unwrap(), DenseArray::from(vec!["b", "c"]));
        assert!(a.slice_rows(2..4).is_err());
    }

    #[test]
    fn test_scalar_rejects_non_zero_dim() {
        let a = DenseArray::from(vec![1i32]);
        assert!(matches!(a.into_scalar(), Err(StoreError::ShapeMismatch { .. })));
    }
}
