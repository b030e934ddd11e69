//! # Data Module
//!
//! In-memory representations of stored values. This is the core "Model" layer.
//!
//! ## Design
//! - **Enum-based polymorphism:** `DenseArray` has one variant per dtype and
//!   `Element` one variant per storable kind, so every value is a single
//!   stack-allocated enum with exhaustive matching.
//! - **Closed type set:** `ArrayType` is sealed; values outside the twelve
//!   supported element types are rejected at the boundary.
//! - **NaN-aware equality:** float payloads compare NaN == NaN.

pub mod array;
pub mod axis;
pub mod dtype;
pub mod element;
pub mod sparse;
pub mod table;

// Re-export commonly used types
pub use array::DenseArray;
pub use axis::AxisIndex;
pub use dtype::{ArrayType, DType, Scalar};
pub use element::{Element, Encoding, Mapping, Selection};
pub use sparse::{SparseFormat, SparseMatrix};
pub use table::{Categorical, Column, ColumnKind, TypedTable};

use crate::error::{Result, StoreError};

/// Check that a name can be used as a container entry.
///
/// Names must be non-empty, contain no `/` or `\`, and not start with `.`
/// (dot-prefixed entries are reserved for attributes and staging).
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(StoreError::invalid_name(name));
    }
    Ok(())
}
