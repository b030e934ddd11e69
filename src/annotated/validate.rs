//! # Slot Validation
//!
//! Shape rules for every slot of an annotated matrix. The same checks run on
//! assignment and when a stored matrix is opened.
//!
//! | Slot | Accepted kinds | Constraint |
//! |---|---|---|
//! | `primary`, `layers` | array, sparse | 2-d, `(n_obs, n_var)` |
//! | `obs_extras` | array (ndim ≥ 1), sparse, table | leading dim `n_obs` |
//! | `var_extras` | array (ndim ≥ 1), sparse, table | leading dim `n_var` |
//! | `metadata` | any | none |

use std::fmt;

use crate::data::Encoding;
use crate::error::{Result, StoreError};
use crate::io::ElementInfo;

/// Named element collections of an annotated matrix
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    ObsExtras,
    VarExtras,
    Layers,
    Metadata,
}

impl Slot {
    pub const ALL: [Slot; 4] = [Slot::ObsExtras, Slot::VarExtras, Slot::Layers, Slot::Metadata];

    /// Group name in the store
    pub fn as_str(self) -> &'static str {
        match self {
            Slot::ObsExtras => "obs_extras",
            Slot::VarExtras => "var_extras",
            Slot::Layers => "layers",
            Slot::Metadata => "metadata",
        }
    }

    /// Whether entries of this slot are aligned with `axis`
    pub(crate) fn aligned_with(self, axis: Axis) -> bool {
        matches!(
            (self, axis),
            (Slot::Layers, _) | (Slot::ObsExtras, Axis::Obs) | (Slot::VarExtras, Axis::Var)
        )
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Axis {
    Obs,
    Var,
}

impl Axis {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Axis::Obs => "n_obs",
            Axis::Var => "n_var",
        }
    }
}

/// What an assignment writes to; used to exclude the entry being replaced
/// when deciding whether an axis is still free to be established
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Target<'a> {
    Primary,
    Entry(Slot, &'a str),
    Table(Axis),
}

/// Axis lengths an element implies when placed in `target`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Implied {
    pub obs: Option<usize>,
    pub var: Option<usize>,
}

impl Implied {
    pub(crate) fn get(&self, axis: Axis) -> Option<usize> {
        match axis {
            Axis::Obs => self.obs,
            Axis::Var => self.var,
        }
    }
}

fn matrix_shape(info: &ElementInfo, what: &str) -> Result<(usize, usize)> {
    match info.encoding {
        Encoding::Array | Encoding::SparseRow | Encoding::SparseColumn => {}
        other => {
            return Err(StoreError::type_mismatch(format!(
                "{what} must be an array or sparse matrix, got {other}"
            )))
        }
    }
    match info.shape.as_deref() {
        Some(&[rows, cols]) => Ok((rows, cols)),
        other => Err(StoreError::shape_mismatch(format!(
            "{what} must be 2-d, got shape {other:?}"
        ))),
    }
}

fn leading_dim(info: &ElementInfo, what: &str) -> Result<usize> {
    match info.encoding {
        Encoding::Array | Encoding::SparseRow | Encoding::SparseColumn | Encoding::Table => {}
        other => {
            return Err(StoreError::type_mismatch(format!(
                "{what} must have a leading dimension, got {other}"
            )))
        }
    }
    info.n_rows().ok_or_else(|| {
        StoreError::shape_mismatch(format!("{what} must have at least one dimension"))
    })
}

/// Axis lengths implied by placing `info` into `target`
pub(crate) fn implied_axes(target: Target<'_>, info: &ElementInfo) -> Result<Implied> {
    match target {
        Target::Primary => {
            let (rows, cols) = matrix_shape(info, "primary")?;
            Ok(Implied {
                obs: Some(rows),
                var: Some(cols),
            })
        }
        Target::Entry(Slot::Layers, name) => {
            let (rows, cols) = matrix_shape(info, &format!("layer {name:?}"))?;
            Ok(Implied {
                obs: Some(rows),
                var: Some(cols),
            })
        }
        Target::Entry(Slot::ObsExtras, name) => Ok(Implied {
            obs: Some(leading_dim(info, &format!("obs extra {name:?}"))?),
            var: None,
        }),
        Target::Entry(Slot::VarExtras, name) => Ok(Implied {
            obs: None,
            var: Some(leading_dim(info, &format!("var extra {name:?}"))?),
        }),
        Target::Entry(Slot::Metadata, _) => Ok(Implied::default()),
        Target::Table(axis) => {
            let rows = leading_dim(info, "annotation table")?;
            Ok(match axis {
                Axis::Obs => Implied {
                    obs: Some(rows),
                    var: None,
                },
                Axis::Var => Implied {
                    obs: None,
                    var: Some(rows),
                },
            })
        }
    }
}

/// Check an implied axis length against the current one.
///
/// Returns `Some(len)` when the assignment establishes the axis (current
/// length 0, nothing else aligned with it yet), `None` when it matches.
pub(crate) fn resolve_axis(
    axis: Axis,
    current: usize,
    implied: Option<usize>,
    occupied: bool,
    what: &str,
) -> Result<Option<usize>> {
    match implied {
        None => Ok(None),
        Some(len) if len == current => Ok(None),
        Some(len) if current == 0 && !occupied => Ok(Some(len)),
        Some(len) => Err(StoreError::shape_mismatch(format!(
            "{what} has length {len} along {} but {} = {current}",
            axis.as_str(),
            axis.as_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DType;

    fn info(encoding: Encoding, shape: Option<Vec<usize>>) -> ElementInfo {
        ElementInfo {
            encoding,
            dtype: Some(DType::Float32),
            shape,
        }
    }

    #[test]
    fn test_matrix_slots_require_2d() {
        let ok = implied_axes(Target::Primary, &info(Encoding::SparseRow, Some(vec![3, 4]))).unwrap();
        assert_eq!((ok.obs, ok.var), (Some(3), Some(4)));
        let err = implied_axes(
            Target::Entry(Slot::Layers, "counts"),
            &info(Encoding::Array, Some(vec![3])),
        );
        assert!(matches!(err, Err(StoreError::ShapeMismatch { .. })));
        let err = implied_axes(Target::Primary, &info(Encoding::Scalar, None));
        assert!(matches!(err, Err(StoreError::TypeMismatch { .. })));
    }

    #[test]
    fn test_axis_slots_check_leading_dim() {
        let t = implied_axes(
            Target::Entry(Slot::VarExtras, "pcs"),
            &info(Encoding::Array, Some(vec![5, 2, 2])),
        )
        .unwrap();
        assert_eq!((t.obs, t.var), (None, Some(5)));
        let err = implied_axes(
            Target::Entry(Slot::ObsExtras, "m"),
            &info(Encoding::Mapping, None),
        );
        assert!(matches!(err, Err(StoreError::TypeMismatch { .. })));
        let any = implied_axes(Target::Entry(Slot::Metadata, "m"), &info(Encoding::Mapping, None));
        assert_eq!(any.unwrap(), Implied::default());
    }

    #[test]
    fn test_resolve_axis() {
        assert_eq!(resolve_axis(Axis::Obs, 0, Some(2), false, "x").unwrap(), Some(2));
        assert_eq!(resolve_axis(Axis::Obs, 2, Some(2), false, "x").unwrap(), None);
        assert_eq!(resolve_axis(Axis::Obs, 0, None, true, "x").unwrap(), None);
        assert!(matches!(
            resolve_axis(Axis::Obs, 3, Some(2), false, "x"),
            Err(StoreError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            resolve_axis(Axis::Var, 0, Some(2), true, "x"),
            Err(StoreError::ShapeMismatch { .. })
        ));
    }
}
