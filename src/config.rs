//! # Configuration
//!
//! Open modes, access strategies and multi-file reconciliation settings.
//!
//! All structs derive `Serialize`/`Deserialize` so callers can keep them in
//! JSON alongside their data; `validate()` is run by every `from_json_str`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// How a store location is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpenMode {
    /// Shared access, no mutation
    ReadOnly,
    /// Exclusive access to an existing store
    ReadWrite,
    /// Exclusive access to a store created at a fresh location
    CreateNew,
}

impl OpenMode {
    /// Whether this mode takes the exclusive lock
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// How element payloads are served by getters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessStrategy {
    /// Every element is loaded at open and served from memory
    InMemory,
    /// Payloads stay in the store and are read on demand
    #[default]
    Backed,
}

/// Settings for opening a single annotated matrix store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Access strategy selected at open time
    pub access: AccessStrategy,
    /// fsync leaf files before they are renamed into place
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            access: AccessStrategy::Backed,
            sync_writes: true,
        }
    }
}

impl StoreConfig {
    /// In-memory strategy with default write settings
    pub fn in_memory() -> Self {
        Self {
            access: AccessStrategy::InMemory,
            ..Self::default()
        }
    }

    /// Backed strategy with default write settings
    pub fn backed() -> Self {
        Self::default()
    }

    /// Parse from JSON and validate
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Rule for reconciling the shared var axis across dataset members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinPolicy {
    /// Keep only labels present in every member
    #[default]
    Inner,
    /// Keep the union of labels, filling absent entries
    Outer,
}

/// Values written where an outer join has no source data.
///
/// Categorical columns always use the missing code `-1` and sparse matrices
/// always use structural zeros; the fields below cover dense payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillPolicy {
    /// Fill for signed integer dtypes (cast to the target width)
    pub integer: i64,
    /// Fill for unsigned integer dtypes (cast to the target width)
    pub unsigned: u64,
    /// Fill for float dtypes; `None` means NaN
    pub float: Option<f64>,
    /// Fill for bool dtype
    pub boolean: bool,
    /// Fill for string dtype
    pub string: String,
}

impl Default for FillPolicy {
    fn default() -> Self {
        Self {
            integer: 0,
            unsigned: 0,
            float: None,
            boolean: false,
            string: String::new(),
        }
    }
}

impl FillPolicy {
    /// Float fill value with `None` resolved to NaN
    pub fn float_value(&self) -> f64 {
        self.float.unwrap_or(f64::NAN)
    }

    /// All-zero policy (zero numerics, false, empty string)
    pub fn zeros() -> Self {
        Self {
            float: Some(0.0),
            ..Self::default()
        }
    }
}

/// Settings for building a multi-file dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Var axis reconciliation rule
    pub join: JoinPolicy,
    /// Fill values for outer joins
    pub fill: FillPolicy,
    /// When set, obs annotations gain a categorical column of member ids
    pub source_key: Option<String>,
    /// Materialize member chunks on the rayon pool
    pub parallel_reads: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            join: JoinPolicy::Inner,
            fill: FillPolicy::default(),
            source_key: None,
            parallel_reads: false,
        }
    }
}

impl DatasetConfig {
    /// Parse from JSON and validate
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_join(mut self, join: JoinPolicy) -> Self {
        self.join = join;
        self
    }

    pub fn with_fill(mut self, fill: FillPolicy) -> Self {
        self.fill = fill;
        self
    }

    pub fn with_source_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = Some(key.into());
        self
    }

    pub fn with_parallel_reads(mut self, parallel: bool) -> Self {
        self.parallel_reads = parallel;
        self
    }

    /// Reject settings that cannot be honoured
    pub fn validate(&self) -> Result<()> {
        if let Some(key) = &self.source_key {
            if key.is_empty() {
                return Err(StoreError::config("source_key must not be empty"));
            }
            if key == "_index" {
                return Err(StoreError::config("source_key `_index` is reserved"));
            }
        }
        Ok(())
    }
}
