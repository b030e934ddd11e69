//! # Element Access
//!
//! Uniform accessor over the two access strategies. In-memory slots hand
//! out a materialized copy; backed slots hand out a `LazyElement` that keeps
//! only tag, dtype and shape and reads the payload on request.

use crate::data::{DType, Element, Encoding, Selection};
use crate::error::Result;
use crate::io::{codec, ElementInfo, Group};

/// Slot entry as held by an annotated matrix
#[derive(Clone, Debug)]
pub(crate) enum Resident {
    Loaded(Element),
    Stored(ElementInfo),
}

impl Resident {
    pub(crate) fn info(&self) -> ElementInfo {
        match self {
            Resident::Loaded(e) => ElementInfo::of(e),
            Resident::Stored(info) => info.clone(),
        }
    }
}

/// Element stored in a group, read on demand
#[derive(Clone, Debug)]
pub struct LazyElement {
    group: Group,
    name: String,
    info: ElementInfo,
}

impl LazyElement {
    pub(crate) fn new(group: Group, name: impl Into<String>, info: ElementInfo) -> Self {
        Self {
            group,
            name: name.into(),
            info,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> &ElementInfo {
        &self.info
    }

    /// Decode the full element
    pub fn read(&self) -> Result<Element> {
        codec::decode(&self.group, &self.name)
    }

    /// Decode only the selected rows
    pub fn read_rows(&self, rows: &Selection) -> Result<Element> {
        codec::decode_rows(&self.group, &self.name, rows)
    }
}

/// Handle returned by every slot getter
#[derive(Clone, Debug)]
pub enum ElementHandle {
    Memory(Element),
    Backed(LazyElement),
}

impl ElementHandle {
    pub fn encoding(&self) -> Encoding {
        match self {
            ElementHandle::Memory(e) => e.encoding(),
            ElementHandle::Backed(lazy) => lazy.info.encoding,
        }
    }

    pub fn dtype(&self) -> Option<DType> {
        match self {
            ElementHandle::Memory(e) => e.dtype(),
            ElementHandle::Backed(lazy) => lazy.info.dtype,
        }
    }

    pub fn shape(&self) -> Option<Vec<usize>> {
        match self {
            ElementHandle::Memory(e) => e.shape(),
            ElementHandle::Backed(lazy) => lazy.info.shape.clone(),
        }
    }

    pub fn is_backed(&self) -> bool {
        matches!(self, ElementHandle::Backed(_))
    }

    /// Materialize the whole element
    pub fn read(&self) -> Result<Element> {
        match self {
            ElementHandle::Memory(e) => Ok(e.clone()),
            ElementHandle::Backed(lazy) => lazy.read(),
        }
    }

    /// Materialize a subset of rows
    pub fn read_rows(&self, rows: &Selection) -> Result<Element> {
        match self {
            ElementHandle::Memory(e) => e.select_rows(rows),
            ElementHandle::Backed(lazy) => lazy.read_rows(rows),
        }
    }

    /// Consume the handle into an owned element
    pub fn into_element(self) -> Result<Element> {
        match self {
            ElementHandle::Memory(e) => Ok(e),
            ElementHandle::Backed(lazy) => lazy.read(),
        }
    }
}
