//! # Sparse Matrices
//!
//! Compressed sparse row (CSR) and column (CSC) matrices. The three
//! co-located sequences follow the usual convention:
//!
//! - `data`: non-zero values, a 1-d `DenseArray` of any numeric or bool dtype
//! - `indices`: minor-axis position of each value
//! - `indptr`: `major_len + 1` offsets into `data`/`indices`
//!
//! For CSR the major axis is rows; for CSC it is columns. Row and column
//! selection reduce to `select_major` / `select_minor` on the right axis.

use std::ops::Range;

use ndarray::{Array2, Ix2};

use crate::config::FillPolicy;
use crate::data::array::DenseArray;
use crate::data::dtype::{with_dtype, ArrayType, DType};
use crate::error::{Result, StoreError};

/// Compression axis
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SparseFormat {
    /// Row-compressed
    Csr,
    /// Column-compressed
    Csc,
}

/// Compressed sparse matrix
#[derive(Clone, Debug, PartialEq)]
pub struct SparseMatrix {
    format: SparseFormat,
    shape: [usize; 2],
    data: DenseArray,
    indices: Vec<usize>,
    indptr: Vec<usize>,
}

impl SparseMatrix {
    /// Assemble from raw parts, validating the structure
    pub fn new(
        format: SparseFormat,
        shape: [usize; 2],
        data: DenseArray,
        indices: Vec<usize>,
        indptr: Vec<usize>,
    ) -> Result<Self> {
        let matrix = Self {
            format,
            shape,
            data,
            indices,
            indptr,
        };
        matrix.validate()?;
        Ok(matrix)
    }

    /// Empty matrix with no stored values
    pub fn empty(format: SparseFormat, shape: [usize; 2], dtype: DType) -> Self {
        let major = match format {
            SparseFormat::Csr => shape[0],
            SparseFormat::Csc => shape[1],
        };
        Self {
            format,
            shape,
            data: DenseArray::zeros(dtype, &[0]),
            indices: Vec::new(),
            indptr: vec![0; major + 1],
        }
    }

    /// Build from coordinate triplets; for repeated coordinates the last value wins
    pub fn from_triplets(
        format: SparseFormat,
        shape: [usize; 2],
        rows: &[usize],
        cols: &[usize],
        data: DenseArray,
    ) -> Result<Self> {
        if data.ndim() != 1 || rows.len() != data.len() || cols.len() != data.len() {
            return Err(StoreError::shape_mismatch(format!(
                "triplets need equal-length rows/cols/data, got {}/{}/{:?}",
                rows.len(),
                cols.len(),
                data.shape()
            )));
        }
        for (&r, &c) in rows.iter().zip(cols) {
            if r >= shape[0] {
                return Err(StoreError::OutOfBounds {
                    index: r,
                    len: shape[0],
                });
            }
            if c >= shape[1] {
                return Err(StoreError::OutOfBounds {
                    index: c,
                    len: shape[1],
                });
            }
        }

        let (major, minor) = match format {
            SparseFormat::Csr => (rows, cols),
            SparseFormat::Csc => (cols, rows),
        };
        let mut order: Vec<usize> = (0..data.len()).collect();
        order.sort_by_key(|&k| (major[k], minor[k]));

        // Keep the last occurrence of each coordinate (stable sort preserves input order)
        let mut kept = Vec::with_capacity(order.len());
        for (i, &k) in order.iter().enumerate() {
            let shadowed = order
                .get(i + 1)
                .is_some_and(|&next| (major[next], minor[next]) == (major[k], minor[k]));
            if !shadowed {
                kept.push(k);
            }
        }

        let major_len = match format {
            SparseFormat::Csr => shape[0],
            SparseFormat::Csc => shape[1],
        };
        let mut indptr = vec![0usize; major_len + 1];
        for &k in &kept {
            indptr[major[k] + 1] += 1;
        }
        for i in 0..major_len {
            indptr[i + 1] += indptr[i];
        }
        let indices = kept.iter().map(|&k| minor[k]).collect();
        let data = data.take_rows(&kept)?;
        Self::new(format, shape, data, indices, indptr)
    }

    /// Compress a 2-d dense array, dropping zero (or `false`/empty) values
    pub fn from_dense(dense: &DenseArray, format: SparseFormat) -> Result<Self> {
        if dense.ndim() != 2 {
            return Err(StoreError::shape_mismatch(format!(
                "sparse matrices are 2-d, got shape {:?}",
                dense.shape()
            )));
        }
        let shape = [dense.shape()[0], dense.shape()[1]];
        let (rows, cols, values) =
            with_dtype!(dense.dtype(), T => nonzero_triplets::<T>(dense, format)?);
        Self::from_triplets(format, shape, &rows, &cols, values)
    }

    /// Expand into a dense 2-d array
    pub fn to_dense(&self) -> Result<DenseArray> {
        with_dtype!(self.dtype(), T => self.to_dense_typed::<T>())
    }

    fn to_dense_typed<T: ArrayType>(&self) -> Result<DenseArray> {
        let values: Vec<T> = self.data.to_flat_vec()?;
        let mut out = Array2::from_elem(
            (self.shape[0], self.shape[1]),
            T::fill_value(&FillPolicy::zeros()),
        );
        for major in 0..self.major_len() {
            for k in self.indptr[major]..self.indptr[major + 1] {
                let (r, c) = match self.format {
                    SparseFormat::Csr => (major, self.indices[k]),
                    SparseFormat::Csc => (self.indices[k], major),
                };
                out[[r, c]] = values[k].clone();
            }
        }
        Ok(DenseArray::from(out))
    }

    /// Check indptr monotonicity and index bounds
    pub fn validate(&self) -> Result<()> {
        if self.data.ndim() != 1 {
            return Err(StoreError::shape_mismatch(format!(
                "sparse data must be 1-d, got shape {:?}",
                self.data.shape()
            )));
        }
        if self.data.dtype() == DType::String {
            return Err(StoreError::type_mismatch(
                "sparse matrices cannot hold strings",
            ));
        }
        if self.data.len() != self.indices.len() {
            return Err(StoreError::shape_mismatch(format!(
                "data has {} values but indices has {}",
                self.data.len(),
                self.indices.len()
            )));
        }
        if self.indptr.len() != self.major_len() + 1 {
            return Err(StoreError::shape_mismatch(format!(
                "index pointers have length {}, expected {}",
                self.indptr.len(),
                self.major_len() + 1
            )));
        }
        if self.indptr.first() != Some(&0) || self.indptr.last() != Some(&self.indices.len()) {
            return Err(StoreError::shape_mismatch(
                "index pointers must start at 0 and end at nnz",
            ));
        }
        if self.indptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(StoreError::shape_mismatch(
                "index pointers must be non-decreasing",
            ));
        }
        let minor = self.minor_len();
        if let Some(&bad) = self.indices.iter().find(|&&i| i >= minor) {
            return Err(StoreError::OutOfBounds {
                index: bad,
                len: minor,
            });
        }
        Ok(())
    }

    pub fn format(&self) -> SparseFormat {
        self.format
    }

    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    pub fn n_rows(&self) -> usize {
        self.shape[0]
    }

    pub fn n_cols(&self) -> usize {
        self.shape[1]
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Number of stored values
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn data(&self) -> &DenseArray {
        &self.data
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }

    /// Decompose into `(format, shape, data, indices, indptr)`
    pub fn into_parts(self) -> (SparseFormat, [usize; 2], DenseArray, Vec<usize>, Vec<usize>) {
        (self.format, self.shape, self.data, self.indices, self.indptr)
    }

    fn major_len(&self) -> usize {
        match self.format {
            SparseFormat::Csr => self.shape[0],
            SparseFormat::Csc => self.shape[1],
        }
    }

    fn minor_len(&self) -> usize {
        match self.format {
            SparseFormat::Csr => self.shape[1],
            SparseFormat::Csc => self.shape[0],
        }
    }

    /// Rows at `positions`; `None` entries become empty rows
    pub fn take_rows(&self, positions: &[Option<usize>]) -> Result<Self> {
        match self.format {
            SparseFormat::Csr => self.select_major(positions),
            SparseFormat::Csc => self.select_minor(positions),
        }
    }

    /// Columns at `positions`; `None` entries become empty columns
    pub fn take_columns(&self, positions: &[Option<usize>]) -> Result<Self> {
        match self.format {
            SparseFormat::Csr => self.select_minor(positions),
            SparseFormat::Csc => self.select_major(positions),
        }
    }

    /// Contiguous row range
    pub fn slice_rows(&self, rows: Range<usize>) -> Result<Self> {
        if rows.start > rows.end || rows.end > self.shape[0] {
            return Err(StoreError::OutOfBounds {
                index: rows.end,
                len: self.shape[0],
            });
        }
        let positions: Vec<Option<usize>> = rows.map(Some).collect();
        self.take_rows(&positions)
    }

    /// Same matrix in the other compression format
    pub fn to_format(&self, format: SparseFormat) -> Result<Self> {
        if format == self.format {
            return Ok(self.clone());
        }
        let mut rows = Vec::with_capacity(self.nnz());
        let mut cols = Vec::with_capacity(self.nnz());
        for major in 0..self.major_len() {
            for k in self.indptr[major]..self.indptr[major + 1] {
                match self.format {
                    SparseFormat::Csr => {
                        rows.push(major);
                        cols.push(self.indices[k]);
                    }
                    SparseFormat::Csc => {
                        rows.push(self.indices[k]);
                        cols.push(major);
                    }
                }
            }
        }
        Self::from_triplets(format, self.shape, &rows, &cols, self.data.clone())
    }

    /// Stack matrices vertically. The result takes the first part's format;
    /// dtypes and column counts must agree.
    pub fn concat_rows(parts: &[SparseMatrix]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| StoreError::shape_mismatch("cannot concatenate zero matrices"))?;
        let n_cols = first.n_cols();
        if let Some(bad) = parts.iter().find(|p| p.n_cols() != n_cols) {
            return Err(StoreError::shape_mismatch(format!(
                "cannot stack matrices with {} and {} columns",
                n_cols,
                bad.n_cols()
            )));
        }
        let parts = parts
            .iter()
            .map(|p| p.to_format(first.format))
            .collect::<Result<Vec<_>>>()?;
        let n_rows: usize = parts.iter().map(|p| p.n_rows()).sum();
        let datas: Vec<DenseArray> = parts.iter().map(|p| p.data.clone()).collect();
        let data = DenseArray::concat_rows(&datas)?;

        match first.format {
            SparseFormat::Csr => {
                let mut indptr = vec![0usize];
                let mut indices = Vec::with_capacity(data.len());
                for part in &parts {
                    let base = indices.len();
                    indptr.extend(part.indptr[1..].iter().map(|&p| p + base));
                    indices.extend_from_slice(&part.indices);
                }
                Self::new(SparseFormat::Csr, [n_rows, n_cols], data, indices, indptr)
            }
            SparseFormat::Csc => {
                let mut data_offsets = Vec::with_capacity(parts.len());
                let mut row_offsets = Vec::with_capacity(parts.len());
                let (mut d, mut r) = (0, 0);
                for part in &parts {
                    data_offsets.push(d);
                    row_offsets.push(r);
                    d += part.nnz();
                    r += part.n_rows();
                }
                let mut indptr = vec![0usize];
                let mut indices = Vec::with_capacity(data.len());
                let mut gather = Vec::with_capacity(data.len());
                for col in 0..n_cols {
                    for (p, part) in parts.iter().enumerate() {
                        for k in part.indptr[col]..part.indptr[col + 1] {
                            indices.push(part.indices[k] + row_offsets[p]);
                            gather.push(data_offsets[p] + k);
                        }
                    }
                    indptr.push(indices.len());
                }
                let data = data.take_rows(&gather)?;
                Self::new(SparseFormat::Csc, [n_rows, n_cols], data, indices, indptr)
            }
        }
    }

    fn select_major(&self, positions: &[Option<usize>]) -> Result<Self> {
        let major_len = self.major_len();
        let mut indptr = Vec::with_capacity(positions.len() + 1);
        indptr.push(0);
        let mut gather = Vec::new();
        for &pos in positions {
            if let Some(m) = pos {
                if m >= major_len {
                    return Err(StoreError::OutOfBounds {
                        index: m,
                        len: major_len,
                    });
                }
                gather.extend(self.indptr[m]..self.indptr[m + 1]);
            }
            indptr.push(gather.len());
        }
        let indices = gather.iter().map(|&k| self.indices[k]).collect();
        let data = self.data.take_rows(&gather)?;
        let shape = match self.format {
            SparseFormat::Csr => [positions.len(), self.shape[1]],
            SparseFormat::Csc => [self.shape[0], positions.len()],
        };
        Self::new(self.format, shape, data, indices, indptr)
    }

    fn select_minor(&self, positions: &[Option<usize>]) -> Result<Self> {
        let minor_len = self.minor_len();
        // old minor position -> new positions it is copied to
        let mut targets: Vec<Vec<usize>> = vec![Vec::new(); minor_len];
        for (new, &pos) in positions.iter().enumerate() {
            if let Some(m) = pos {
                if m >= minor_len {
                    return Err(StoreError::OutOfBounds {
                        index: m,
                        len: minor_len,
                    });
                }
                targets[m].push(new);
            }
        }

        let mut indptr = Vec::with_capacity(self.major_len() + 1);
        indptr.push(0);
        let mut indices = Vec::new();
        let mut gather = Vec::new();
        let mut segment: Vec<(usize, usize)> = Vec::new();
        for major in 0..self.major_len() {
            segment.clear();
            for k in self.indptr[major]..self.indptr[major + 1] {
                for &new in &targets[self.indices[k]] {
                    segment.push((new, k));
                }
            }
            segment.sort_unstable();
            for &(new, k) in &segment {
                indices.push(new);
                gather.push(k);
            }
            indptr.push(indices.len());
        }
        let data = self.data.take_rows(&gather)?;
        let shape = match self.format {
            SparseFormat::Csr => [self.shape[0], positions.len()],
            SparseFormat::Csc => [positions.len(), self.shape[1]],
        };
        Self::new(self.format, shape, data, indices, indptr)
    }
}

type Triplets = (Vec<usize>, Vec<usize>, DenseArray);

fn nonzero_triplets<T: ArrayType>(dense: &DenseArray, format: SparseFormat) -> Result<Triplets> {
    let array = dense
        .as_typed::<T>()?
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| StoreError::shape_mismatch(e.to_string()))?;
    let (n_rows, n_cols) = array.dim();
    let (outer, inner) = match format {
        SparseFormat::Csr => (n_rows, n_cols),
        SparseFormat::Csc => (n_cols, n_rows),
    };
    let (mut rows, mut cols, mut values) = (Vec::new(), Vec::new(), Vec::new());
    for i in 0..outer {
        for j in 0..inner {
            let (r, c) = match format {
                SparseFormat::Csr => (i, j),
                SparseFormat::Csc => (j, i),
            };
            let v = &array[[r, c]];
            if !v.is_zero() {
                rows.push(r);
                cols.push(c);
                values.push(v.clone());
            }
        }
    }
    Ok((rows, cols, DenseArray::from(values)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample_dense() -> DenseArray {
        DenseArray::from(array![[0i32, 1, 0], [2, 0, 3], [0, 0, 0], [4, 0, 5]])
    }

    #[test]
    fn test_from_dense_csr() {
        let m = SparseMatrix::from_dense(&sample_dense(), SparseFormat::Csr).unwrap();
        assert_eq!(m.nnz(), 5);
        assert_eq!(m.indptr(), &[0, 1, 3, 3, 5]);
        assert_eq!(m.indices(), &[1, 0, 2, 0, 2]);
        assert_eq!(m.to_dense().unwrap(), sample_dense());
    }

    #[test]
    fn test_from_dense_csc() {
        let m = SparseMatrix::from_dense(&sample_dense(), SparseFormat::Csc).unwrap();
        assert_eq!(m.indptr(), &[0, 2, 3, 5]);
        assert_eq!(m.indices(), &[1, 3, 0, 1, 3]);
        assert_eq!(m.to_dense().unwrap(), sample_dense());
    }

    #[test]
    fn test_triplets_last_wins() {
        let m = SparseMatrix::from_triplets(
            SparseFormat::Csr,
            [2, 2],
            &[0, 1, 0],
            &[1, 0, 1],
            DenseArray::from(vec![1.0f64, 2.0, 3.0]),
        )
        .unwrap();
        assert_eq!(m.nnz(), 2);
        assert_eq!(m.to_dense().unwrap(), DenseArray::from(array![[0.0f64, 3.0], [2.0, 0.0]]));
    }

    #[test]
    fn test_validate_rejects_bad_structure() {
        let data = DenseArray::from(vec![1u8, 2]);
        let err = SparseMatrix::new(SparseFormat::Csr, [2, 2], data.clone(), vec![0, 5], vec![0, 1, 2])
            .unwrap_err();
        assert!(matches!(err, StoreError::OutOfBounds { index: 5, len: 2 }));
        let err = SparseMatrix::new(SparseFormat::Csr, [2, 2], data, vec![0, 1], vec![0, 2, 1])
            .unwrap_err();
        assert!(matches!(err, StoreError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_take_rows_and_columns_both_formats() {
        let dense = sample_dense();
        let rows = [Some(3), None, Some(1), Some(3)];
        let cols = [Some(2), Some(2), None, Some(0)];
        let expected_rows = dense
            .take_rows_filled(&rows, &FillPolicy::zeros())
            .unwrap();
        let expected_cols = dense
            .take_columns_filled(&cols, &FillPolicy::zeros())
            .unwrap();
        for format in [SparseFormat::Csr, SparseFormat::Csc] {
            let m = SparseMatrix::from_dense(&dense, format).unwrap();
            assert_eq!(m.take_rows(&rows).unwrap().to_dense().unwrap(), expected_rows);
            assert_eq!(m.take_columns(&cols).unwrap().to_dense().unwrap(), expected_cols);
        }
    }

    #[test]
    fn test_concat_rows_mixed_formats() {
        let dense = sample_dense();
        let a = SparseMatrix::from_dense(&dense, SparseFormat::Csc).unwrap();
        let b = SparseMatrix::from_dense(&dense, SparseFormat::Csr).unwrap();
        let joined = SparseMatrix::concat_rows(&[a, b]).unwrap();
        assert_eq!(joined.format(), SparseFormat::Csc);
        assert_eq!(joined.shape(), [8, 3]);
        let expected = DenseArray::concat_rows(&[dense.clone(), dense]).unwrap();
        assert_eq!(joined.to_dense().unwrap(), expected);
    }

    #[test]
    fn test_empty_and_bool() {
        let m = SparseMatrix::empty(SparseFormat::Csr, [3, 2], DType::Bool);
        assert_eq!(m.nnz(), 0);
        assert_eq!(m.to_dense().unwrap(), DenseArray::zeros(DType::Bool, &[3, 2]));

        let dense = DenseArray::from(array![[true, false], [false, true]]);
        let m = SparseMatrix::from_dense(&dense, SparseFormat::Csr).unwrap();
        assert_eq!(m.nnz(), 2);
        assert_eq!(
            m.slice_rows(1..2).unwrap().to_dense().unwrap(),
            DenseArray::from(array![[false, true]])
        );
    }
}
