//! # Axis Index
//!
//! Ordered, unique labels for one axis (observations or variables) with
//! O(1) label lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, StoreError};

/// Ordered unique labels for one axis
#[derive(Clone, Debug, Default)]
pub struct AxisIndex {
    /// Labels in axis order
    labels: Vec<Arc<str>>,
    /// Map from label to position for fast lookup
    positions: HashMap<Arc<str>, usize>,
}

impl AxisIndex {
    /// Create from labels; fails with `DuplicateLabel` if any label repeats
    pub fn new<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        let labels: Vec<Arc<str>> = labels.into_iter().map(Into::into).collect();
        let mut positions = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            if positions.insert(label.clone(), i).is_some() {
                return Err(StoreError::duplicate_label(label.as_ref()));
            }
        }
        Ok(Self { labels, positions })
    }

    /// Labels `"0"`, `"1"`, ... `"n-1"`
    pub fn range(n: usize) -> Self {
        let labels: Vec<Arc<str>> = (0..n).map(|i| Arc::from(i.to_string())).collect();
        let positions = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i))
            .collect();
        Self { labels, positions }
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Position of a label, if present
    pub fn position(&self, label: &str) -> Option<usize> {
        self.positions.get(label).copied()
    }

    /// Position of a label; fails with `KeyNotFound`
    pub fn lookup(&self, label: &str) -> Result<usize> {
        self.position(label)
            .ok_or_else(|| StoreError::key_not_found(label))
    }

    pub fn contains(&self, label: &str) -> bool {
        self.positions.contains_key(label)
    }

    /// Label at a position
    pub fn get(&self, position: usize) -> Option<&str> {
        self.labels.get(position).map(|l| l.as_ref())
    }

    pub fn labels(&self) -> &[Arc<str>] {
        &self.labels
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &str> + '_ {
        self.labels.iter().map(|l| l.as_ref())
    }

    /// Replace `old` with `new` in place, keeping its position
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let position = self.lookup(old)?;
        if old == new {
            return Ok(());
        }
        if self.positions.contains_key(new) {
            return Err(StoreError::duplicate_label(new));
        }
        let label: Arc<str> = Arc::from(new);
        self.positions.remove(old);
        self.positions.insert(label.clone(), position);
        self.labels[position] = label;
        Ok(())
    }

    /// New index holding the labels at `positions`, in that order.
    ///
    /// Repeated positions would repeat labels and fail with `DuplicateLabel`.
    pub fn slice(&self, positions: &[usize]) -> Result<Self> {
        let len = self.len();
        let labels = positions
            .iter()
            .map(|&p| {
                self.labels
                    .get(p)
                    .cloned()
                    .ok_or(StoreError::OutOfBounds { index: p, len })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(labels)
    }

    /// Owned copies of the labels
    pub fn to_strings(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.to_string()).collect()
    }
}

impl PartialEq for AxisIndex {
    fn eq(&self, other: &Self) -> bool {
        self.labels == other.labels
    }
}

impl std::ops::Index<usize> for AxisIndex {
    type Output = str;

    fn index(&self, position: usize) -> &Self::Output {
        &self.labels[position]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let index = AxisIndex::new(["a", "b", "c"]).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.lookup("b").unwrap(), 1);
        assert_eq!(&index[2], "c");
        assert!(matches!(
            index.lookup("z"),
            Err(StoreError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let err = AxisIndex::new(["a", "b", "a"]).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateLabel { label } if label == "a"));
    }

    #[test]
    fn test_rename() {
        let mut index = AxisIndex::new(["a", "b", "c"]).unwrap();
        index.rename("b", "x").unwrap();
        assert_eq!(index.lookup("x").unwrap(), 1);
        assert!(!index.contains("b"));
        assert!(matches!(
            index.rename("x", "c"),
            Err(StoreError::DuplicateLabel { .. })
        ));
        assert_eq!(index.to_strings(), vec!["a", "x", "c"]);
        index.rename("a", "a").unwrap();
    }

    #[test]
    fn test_slice_preserves_order() {
        let index = AxisIndex::new(["a", "b", "c", "d"]).unwrap();
        let sliced = index.slice(&[3, 1]).unwrap();
        assert_eq!(sliced.to_strings(), vec!["d", "b"]);
        assert_eq!(sliced.lookup("b").unwrap(), 1);
        assert!(index.slice(&[0, 0]).is_err());
        assert!(matches!(
            index.slice(&[9]),
            Err(StoreError::OutOfBounds { index: 9, len: 4 })
        ));
    }

    #[test]
    fn test_range_labels() {
        let index = AxisIndex::range(3);
        assert_eq!(index.to_strings(), vec!["0", "1", "2"]);
        assert_eq!(AxisIndex::range(0), AxisIndex::default());
    }
}
