//! # Centralized Error Handling
//!
//! Unified error types for the entire crate using `thiserror`.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O errors (file missing, permission denied, read/write failures)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural damage in the container (missing required entries, bad magic)
    #[error("Corrupted store at {path}: {message}")]
    Corrupted { path: PathBuf, message: String },

    /// An assignment disagrees with a fixed axis length or declared shape
    #[error("Shape mismatch: {message}")]
    ShapeMismatch { message: String },

    /// Unknown encoding tag or dtype, or payload inconsistent with its header
    #[error("Type mismatch: {message}")]
    TypeMismatch { message: String },

    /// Requested slot, column, label or member is absent
    #[error("Key not found: {key}")]
    KeyNotFound { key: String },

    /// Non-unique axis labels on construction or rename
    #[error("Duplicate label: {label}")]
    DuplicateLabel { label: String },

    /// Multi-file reconciliation failure across members
    #[error("Schema mismatch: {message}")]
    SchemaMismatch { message: String },

    /// A conflicting handle already holds the store
    #[error("Store is locked: {path}")]
    Locked { path: PathBuf },

    /// Operation on a handle that has been closed
    #[error("Store handle has been closed")]
    Closed,

    /// Write attempted through a read-only handle
    #[error("Store is opened read-only: {path}")]
    ReadOnly { path: PathBuf },

    /// Positional access beyond an axis
    #[error("Index {index} out of bounds for axis of length {len}")]
    OutOfBounds { index: usize, len: usize },

    /// Entry name that cannot be represented in the container
    #[error("Invalid entry name: {name:?}")]
    InvalidName { name: String },

    /// On-disk format version newer than this build understands
    #[error("Unsupported format version {found} (supported: {supported})")]
    UnsupportedVersion { found: String, supported: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// JSON (attributes, headers, manifests) errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type alias for Results using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Create a corruption error for an on-disk path
    pub fn corrupted(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(message: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            message: message.into(),
        }
    }

    /// Create a type mismatch error
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
        }
    }

    /// Create a key-not-found error
    pub fn key_not_found(key: impl Into<String>) -> Self {
        Self::KeyNotFound { key: key.into() }
    }

    /// Create a duplicate label error
    pub fn duplicate_label(label: impl Into<String>) -> Self {
        Self::DuplicateLabel {
            label: label.into(),
        }
    }

    /// Create a schema mismatch error
    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    /// Create an invalid name error
    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName { name: name.into() }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True for the I/O class (`Io` and `Corrupted`)
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Corrupted { .. })
    }
}
