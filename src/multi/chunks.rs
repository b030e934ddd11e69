//! # Lazy Chunk Reads
//!
//! A row selection over the global obs axis is split into per-member
//! segments. `ChunkIter` reads one segment per `next()`; nothing is read
//! when the iterator is created.

use rayon::prelude::*;

use crate::config::FillPolicy;
use crate::data::{DType, DenseArray, Element, Encoding, Selection, SparseFormat, SparseMatrix};
use crate::error::{Result, StoreError};

use super::MultiFileDataset;

/// What a chunk iterator reads from each member
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ChunkSource {
    Primary,
    Layer(String),
    ObsExtra(String),
}

impl ChunkSource {
    /// Matrix sources are reindexed onto the reconciled var axis
    pub(crate) fn is_matrix(&self) -> bool {
        !matches!(self, ChunkSource::ObsExtra(_))
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            ChunkSource::Primary => "primary".to_string(),
            ChunkSource::Layer(name) => format!("layers/{name}"),
            ChunkSource::ObsExtra(name) => format!("obs_extras/{name}"),
        }
    }
}

/// Local rows of one member
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Segment {
    pub member: usize,
    pub rows: Selection,
}

/// Kind, dtype and trailing shape used to fill members that lack an element
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Template {
    pub encoding: Encoding,
    pub dtype: Option<DType>,
    pub trailing: Vec<usize>,
}

impl Template {
    pub(crate) fn fill(&self, n_rows: usize, policy: &FillPolicy) -> Result<Element> {
        let dtype = self.dtype.ok_or_else(|| {
            StoreError::type_mismatch(format!("cannot fill rows of a {} element", self.encoding))
        })?;
        match self.encoding {
            Encoding::Array => {
                let mut shape = vec![n_rows];
                shape.extend(&self.trailing);
                Ok(Element::Array(DenseArray::filled(dtype, &shape, policy)))
            }
            Encoding::SparseRow | Encoding::SparseColumn => {
                let n_cols = self.trailing.first().copied().unwrap_or(0);
                Ok(Element::Sparse(SparseMatrix::empty(
                    SparseFormat::Csr,
                    [n_rows, n_cols],
                    dtype,
                )))
            }
            other => Err(StoreError::type_mismatch(format!(
                "cannot fill rows of a {other} element"
            ))),
        }
    }
}

/// One member's share of a row-sliced read
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    /// Member position in the dataset
    pub member: usize,
    pub element: Element,
}

/// Single-pass iterator over per-member chunks.
///
/// Every `*_chunks` call on the dataset returns a fresh iterator, so a read
/// can be restarted by asking again.
pub struct ChunkIter<'a> {
    pub(crate) dataset: &'a MultiFileDataset,
    pub(crate) source: ChunkSource,
    pub(crate) var: Selection,
    pub(crate) template: Template,
    pub(crate) segments: std::vec::IntoIter<Segment>,
}

impl ChunkIter<'_> {
    /// Number of chunks not yet read
    pub fn remaining(&self) -> usize {
        self.segments.len()
    }

    /// Read every remaining chunk and stack them along rows
    pub fn materialize(self) -> Result<Element> {
        let chunks: Vec<Chunk> = if self.dataset.config().parallel_reads {
            let segments: Vec<Segment> = self.segments.collect();
            let (dataset, source, var, template) =
                (self.dataset, &self.source, &self.var, &self.template);
            segments
                .par_iter()
                .map(|segment| dataset.read_segment(source, segment, var, template))
                .collect::<Result<Vec<_>>>()?
        } else {
            self.collect::<Result<Vec<_>>>()?
        };
        let elements: Vec<Element> = chunks.into_iter().map(|c| c.element).collect();
        Element::concat_rows(&elements)
    }
}

impl Iterator for ChunkIter<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let segment = self.segments.next()?;
        Some(
            self.dataset
                .read_segment(&self.source, &segment, &self.var, &self.template),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.segments.size_hint()
    }
}

impl ExactSizeIterator for ChunkIter<'_> {}

/// Collapse ascending consecutive positions into a range
pub(crate) fn compact(rows: Vec<usize>) -> Selection {
    match (rows.first(), rows.last()) {
        (Some(&first), Some(&last))
            if rows.windows(2).all(|w| w[1] == w[0] + 1) =>
        {
            Selection::Range(first..last + 1)
        }
        _ => Selection::Indices(rows),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact() {
        assert_eq!(compact(vec![4, 5, 6]), Selection::Range(4..7));
        assert_eq!(compact(vec![4, 6]), Selection::Indices(vec![4, 6]));
        assert_eq!(compact(vec![3, 3]), Selection::Indices(vec![3, 3]));
        assert_eq!(compact(vec![]), Selection::Indices(vec![]));
    }

    #[test]
    fn test_template_fill() {
        let dense = Template {
            encoding: Encoding::Array,
            dtype: Some(DType::Float64),
            trailing: vec![2],
        };
        let filled = dense.fill(3, &FillPolicy::zeros()).unwrap();
        assert_eq!(filled.shape(), Some(vec![3, 2]));
        let sparse = Template {
            encoding: Encoding::SparseColumn,
            dtype: Some(DType::Int32),
            trailing: vec![4],
        };
        let filled = sparse.fill(2, &FillPolicy::default()).unwrap();
        assert_eq!(filled.as_sparse().map(|m| m.nnz()), Some(0));
        let table = Template {
            encoding: Encoding::Table,
            dtype: None,
            trailing: vec![],
        };
        assert!(matches!(
            table.fill(1, &FillPolicy::default()),
            Err(StoreError::TypeMismatch { .. })
        ));
    }
}
