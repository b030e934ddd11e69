//! # annstore
//!
//! Typed, hierarchical on-disk storage for annotated data matrices: a
//! primary matrix (observations × variables) with row and column annotation
//! tables, aligned extras, layers and free-form metadata.
//!
//! ## Modules
//! - `config`: open modes, access strategies, join and fill policies
//! - `data`: in-memory element model (arrays, sparse matrices, tables)
//! - `error`: error types and result alias
//! - `io`: directory-backed store, leaf array files, element codec
//! - `annotated`: the annotated matrix and its slot invariants
//! - `multi`: several matrices presented as one row-concatenated dataset
//! - `utils`: tracing setup

pub mod annotated;
pub mod config;
pub mod data;
pub mod error;
pub mod io;
pub mod multi;
pub mod utils;

// Re-export commonly used types
pub use annotated::{AnnotatedMatrix, ElementHandle, LazyElement, Slot};
pub use config::{AccessStrategy, DatasetConfig, FillPolicy, JoinPolicy, OpenMode, StoreConfig};
pub use data::{
    AxisIndex, Categorical, Column, ColumnKind, DType, DenseArray, Element, Encoding, Mapping,
    Scalar, Selection, SparseFormat, SparseMatrix, TypedTable,
};
pub use error::{Result, StoreError};
pub use io::{ElementInfo, Store};
pub use multi::{Chunk, ChunkIter, MultiFileDataset, RowLocation};
