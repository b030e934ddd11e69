//! # Multi-File Dataset
//!
//! Several annotated matrices presented as one row-concatenated matrix.
//!
//! ## Layout
//! - `var`: reconciled once at build time under the join policy; each member
//!   keeps a map from reconciled var positions to its local ones
//! - `obs`: the members' obs axes back to back; labels may repeat across
//!   members and are told apart by `(member, local)` routing
//! - reads: row selections are split per member and served lazily through
//!   `ChunkIter`; nothing is concatenated unless `materialize` is called

mod chunks;
mod manifest;
mod reconcile;

pub use chunks::{Chunk, ChunkIter};

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, info_span};

use crate::annotated::{AnnotatedMatrix, ElementHandle};
use crate::config::{DatasetConfig, JoinPolicy, OpenMode, StoreConfig};
use crate::data::{AxisIndex, Categorical, Column, Element, Selection, TypedTable};
use crate::error::{Result, StoreError};

use chunks::{compact, ChunkSource, Segment, Template};

/// Position of a global row inside its member
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RowLocation {
    pub member: usize,
    pub local: usize,
}

#[derive(Debug)]
struct Member {
    id: String,
    matrix: AnnotatedMatrix,
    /// Reconciled var position -> local var position
    var_map: Vec<Option<usize>>,
    /// Reconciled var axis equals the local one
    identity: bool,
}

/// Ordered collection of annotated matrices sharing a reconciled var axis
#[derive(Debug)]
pub struct MultiFileDataset {
    members: Vec<Member>,
    config: DatasetConfig,
    var_table: TypedTable,
    /// `offsets[i]` is the first global row of member `i`; last entry is `n_obs`
    offsets: Vec<usize>,
}

impl MultiFileDataset {
    /// Reconcile `members` (id, matrix) into one dataset.
    ///
    /// Fails with `DuplicateLabel` on repeated ids and `SchemaMismatch` when
    /// members disagree on the kind or dtype of a shared name.
    pub fn build(members: Vec<(String, AnnotatedMatrix)>, config: DatasetConfig) -> Result<Self> {
        config.validate()?;
        let _span = info_span!(
            "dataset_build",
            n_members = members.len(),
            join = ?config.join
        )
        .entered();
        if members.is_empty() {
            return Err(StoreError::schema_mismatch("a dataset needs at least one member"));
        }
        let mut seen = HashSet::new();
        if let Some((id, _)) = members.iter().find(|(id, _)| !seen.insert(id.as_str())) {
            return Err(StoreError::duplicate_label(id.as_str()));
        }

        let ids: Vec<String> = members.iter().map(|(id, _)| id.clone()).collect();
        let matrices: Vec<&AnnotatedMatrix> = members.iter().map(|(_, m)| m).collect();
        if let Some(key) = &config.source_key {
            for (id, m) in ids.iter().zip(&matrices) {
                if m.get_obs_table()?.contains(key) {
                    return Err(StoreError::schema_mismatch(format!(
                        "source key {key:?} collides with an obs column of {id:?}"
                    )));
                }
            }
        }
        reconcile::check_schemas(&ids, &matrices)?;
        let reconciled = reconcile::reconcile_var(&matrices, config.join, &config.fill)?;

        let mut offsets = Vec::with_capacity(members.len() + 1);
        offsets.push(0);
        for m in &matrices {
            offsets.push(offsets[offsets.len() - 1] + m.n_obs());
        }

        let members: Vec<Member> = members
            .into_iter()
            .zip(reconciled.var_maps)
            .map(|((id, matrix), var_map)| {
                let identity = var_map.len() == matrix.n_var()
                    && var_map.iter().enumerate().all(|(i, p)| *p == Some(i));
                Member {
                    id,
                    matrix,
                    var_map,
                    identity,
                }
            })
            .collect();
        let dataset = Self {
            members,
            config,
            var_table: reconciled.var_table,
            offsets,
        };
        debug!(
            n_obs = dataset.n_obs(),
            n_var = dataset.n_var(),
            "built dataset"
        );
        Ok(dataset)
    }

    /// Save a JSON manifest listing every member's store
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        manifest::save(self, path.as_ref())
    }

    /// Reopen every member listed in a manifest and rebuild
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, store_config: &StoreConfig) -> Result<Self> {
        manifest::open(path.as_ref(), mode, store_config)
    }

    // ------------------------------------------------------------------------
    // Shape and routing
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn n_obs(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn n_var(&self) -> usize {
        self.var_table.n_rows()
    }

    pub fn n_members(&self) -> usize {
        self.members.len()
    }

    pub fn member_ids(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.id.as_str()).collect()
    }

    pub fn member(&self, index: usize) -> Result<&AnnotatedMatrix> {
        self.members
            .get(index)
            .map(|m| &m.matrix)
            .ok_or(StoreError::OutOfBounds {
                index,
                len: self.members.len(),
            })
    }

    /// Member by id; fails with `KeyNotFound`
    pub fn member_by_id(&self, id: &str) -> Result<&AnnotatedMatrix> {
        self.members
            .iter()
            .find(|m| m.id == id)
            .map(|m| &m.matrix)
            .ok_or_else(|| StoreError::key_not_found(id))
    }

    /// Route a global row to its member
    pub fn locate(&self, row: usize) -> Result<RowLocation> {
        if row >= self.n_obs() {
            return Err(StoreError::OutOfBounds {
                index: row,
                len: self.n_obs(),
            });
        }
        // last member whose first row is <= row; skips empty members
        let member = self.offsets.partition_point(|&start| start <= row) - 1;
        Ok(RowLocation {
            member,
            local: row - self.offsets[member],
        })
    }

    /// Close every member store
    pub fn close(&mut self) -> Result<()> {
        for m in &mut self.members {
            m.matrix.close()?;
        }
        Ok(())
    }

    /// Give the members back
    pub fn into_members(self) -> Vec<(String, AnnotatedMatrix)> {
        self.members.into_iter().map(|m| (m.id, m.matrix)).collect()
    }

    // ------------------------------------------------------------------------
    // Annotations
    // ------------------------------------------------------------------------

    pub fn var_names(&self) -> &AxisIndex {
        self.var_table.index()
    }

    /// Reconciled var annotation table
    pub fn var_table(&self) -> &TypedTable {
        &self.var_table
    }

    /// Global obs labels in row order; may contain repeats across members
    pub fn obs_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(self.n_obs());
        for m in &self.members {
            names.extend(m.matrix.obs_names()?.iter().map(String::from));
        }
        Ok(names)
    }

    /// Obs column names available under the join policy, plus the source key
    pub fn obs_column_names(&self) -> Result<Vec<String>> {
        let tables = self
            .members
            .iter()
            .map(|m| m.matrix.get_obs_table())
            .collect::<Result<Vec<_>>>()?;
        let mut names = reconcile::joined_column_names(&tables, self.config.join);
        if let Some(key) = &self.config.source_key {
            names.push(key.clone());
        }
        Ok(names)
    }

    /// Obs column concatenated across members. Under an outer join, members
    /// without the column contribute fill values. The source key (if set)
    /// names a categorical column of member ids.
    pub fn obs_column(&self, name: &str) -> Result<Column> {
        if self.config.source_key.as_deref() == Some(name) {
            return self.source_column();
        }
        let tables = self
            .members
            .iter()
            .map(|m| m.matrix.get_obs_table())
            .collect::<Result<Vec<_>>>()?;
        let kind = tables
            .iter()
            .find_map(|t| t.column(name))
            .map(Column::kind)
            .ok_or_else(|| StoreError::key_not_found(format!("obs/{name}")))?;

        let mut fills = Vec::new();
        let mut parts: Vec<&Column> = Vec::with_capacity(tables.len());
        // fills are built up front so `parts` can borrow them
        for (m, table) in self.members.iter().zip(&tables) {
            if table.column(name).is_none() {
                if self.config.join == JoinPolicy::Inner {
                    return Err(StoreError::key_not_found(format!("obs/{name} in {:?}", m.id)));
                }
                fills.push(Column::filled(kind, table.n_rows(), &self.config.fill));
            }
        }
        let mut fills = fills.iter();
        for table in &tables {
            match table.column(name) {
                Some(column) => parts.push(column),
                None => parts.extend(fills.next()),
            }
        }
        Column::concat(&parts)
    }

    fn source_column(&self) -> Result<Column> {
        let mut codes = Vec::with_capacity(self.n_obs());
        for (i, m) in self.members.iter().enumerate() {
            let code = i32::try_from(i)
                .map_err(|_| StoreError::shape_mismatch("too many members for a categorical"))?;
            codes.extend(std::iter::repeat(code).take(m.matrix.n_obs()));
        }
        let categories = self.members.iter().map(|m| m.id.clone()).collect();
        Ok(Column::Categorical(Categorical::new(codes, categories, false)?))
    }

    /// Var extra reconciled onto the dataset's var axis: each label's row
    /// comes from the first member holding both the label and the element
    pub fn var_extra(&self, name: &str) -> Result<Element> {
        let mut parts = Vec::new();
        let mut positions: Vec<Option<usize>> = vec![None; self.n_var()];
        let mut offset = 0;
        for m in &self.members {
            if !m.matrix.has_var_extra(name)? {
                if self.config.join == JoinPolicy::Inner {
                    return Err(StoreError::key_not_found(format!(
                        "var_extras/{name} in {:?}",
                        m.id
                    )));
                }
                continue;
            }
            let element = m.matrix.get_var_extra(name)?.read()?;
            for (slot, local) in positions.iter_mut().zip(&m.var_map) {
                if let (None, Some(local)) = (*slot, local) {
                    *slot = Some(offset + local);
                }
            }
            offset += element.n_rows().unwrap_or(0);
            parts.push(element);
        }
        if parts.is_empty() {
            return Err(StoreError::key_not_found(format!("var_extras/{name}")));
        }
        let stacked = if parts.len() == 1 {
            parts.remove(0)
        } else {
            Element::concat_rows(&parts)?
        };
        stacked.take_rows_filled(&positions, &self.config.fill)
    }

    // ------------------------------------------------------------------------
    // Chunked reads
    // ------------------------------------------------------------------------

    /// Lazy per-member chunks of the primary matrix
    pub fn primary_chunks(&self, obs: &Selection, var: &Selection) -> Result<ChunkIter<'_>> {
        self.chunk_iter(ChunkSource::Primary, obs, var.clone())
    }

    /// Lazy per-member chunks of a layer
    pub fn layer_chunks(&self, name: &str, obs: &Selection, var: &Selection) -> Result<ChunkIter<'_>> {
        self.chunk_iter(ChunkSource::Layer(name.to_string()), obs, var.clone())
    }

    /// Lazy per-member chunks of an obs extra
    pub fn obs_extra_chunks(&self, name: &str, obs: &Selection) -> Result<ChunkIter<'_>> {
        self.chunk_iter(ChunkSource::ObsExtra(name.to_string()), obs, Selection::All)
    }

    /// Primary matrix rows and columns, concatenated
    pub fn read_primary(&self, obs: &Selection, var: &Selection) -> Result<Element> {
        self.primary_chunks(obs, var)?.materialize()
    }

    fn handle(&self, member: usize, source: &ChunkSource) -> Result<ElementHandle> {
        let matrix = &self.members[member].matrix;
        match source {
            ChunkSource::Primary => matrix.get_primary(),
            ChunkSource::Layer(name) => matrix.get_layer(name),
            ChunkSource::ObsExtra(name) => matrix.get_obs_extra(name),
        }
    }

    fn chunk_iter(&self, source: ChunkSource, obs: &Selection, var: Selection) -> Result<ChunkIter<'_>> {
        let var_len = var.resolve(self.n_var())?.len();
        let mut template = None;
        for (i, m) in self.members.iter().enumerate() {
            match self.handle(i, &source) {
                Ok(handle) => {
                    if template.is_none() {
                        let trailing = if source.is_matrix() {
                            vec![var_len]
                        } else {
                            handle
                                .shape()
                                .map(|s| s.iter().skip(1).copied().collect())
                                .unwrap_or_default()
                        };
                        template = Some(Template {
                            encoding: handle.encoding(),
                            dtype: handle.dtype(),
                            trailing,
                        });
                    }
                }
                Err(StoreError::KeyNotFound { .. }) if self.config.join == JoinPolicy::Outer => {}
                Err(StoreError::KeyNotFound { .. }) => {
                    return Err(StoreError::key_not_found(format!(
                        "{} in {:?}",
                        source.describe(),
                        m.id
                    )))
                }
                Err(e) => return Err(e),
            }
        }
        let template = template.ok_or_else(|| StoreError::key_not_found(source.describe()))?;
        let segments = self.segments(obs)?;
        debug!(
            source = %source.describe(),
            n_chunks = segments.len(),
            "planned chunked read"
        );
        Ok(ChunkIter {
            dataset: self,
            source,
            var,
            template,
            segments: segments.into_iter(),
        })
    }

    /// Split a global row selection into per-member local selections, in
    /// the order the rows were requested
    fn segments(&self, obs: &Selection) -> Result<Vec<Segment>> {
        let n_obs = self.n_obs();
        let mut out = Vec::new();
        match obs {
            Selection::All => {
                out.extend((0..self.members.len()).map(|member| Segment {
                    member,
                    rows: Selection::All,
                }));
            }
            Selection::Range(r) => {
                if r.start > r.end || r.end > n_obs {
                    return Err(StoreError::OutOfBounds {
                        index: r.end,
                        len: n_obs,
                    });
                }
                for member in 0..self.members.len() {
                    let (lo, hi) = (self.offsets[member], self.offsets[member + 1]);
                    let (start, end) = (r.start.max(lo), r.end.min(hi));
                    if start < end {
                        out.push(Segment {
                            member,
                            rows: Selection::Range(start - lo..end - lo),
                        });
                    }
                }
            }
            Selection::Indices(rows) => {
                let mut runs: Vec<(usize, Vec<usize>)> = Vec::new();
                for &row in rows {
                    let loc = self.locate(row)?;
                    match runs.last_mut() {
                        Some((member, locals)) if *member == loc.member => locals.push(loc.local),
                        _ => runs.push((loc.member, vec![loc.local])),
                    }
                }
                out.extend(runs.into_iter().map(|(member, locals)| Segment {
                    member,
                    rows: compact(locals),
                }));
            }
        }
        if out.is_empty() {
            out.push(Segment {
                member: 0,
                rows: Selection::Range(0..0),
            });
        }
        Ok(out)
    }

    /// Read one segment and project it onto the selected reconciled vars
    pub(crate) fn read_segment(
        &self,
        source: &ChunkSource,
        segment: &Segment,
        var: &Selection,
        template: &Template,
    ) -> Result<Chunk> {
        let member = &self.members[segment.member];
        let n_rows = segment.rows.len(member.matrix.n_obs());
        let element = match self.handle(segment.member, source) {
            Ok(handle) => {
                let rows = handle.read_rows(&segment.rows)?;
                if source.is_matrix() && !(var.is_all() && member.identity) {
                    let columns: Vec<Option<usize>> = var
                        .resolve(self.n_var())?
                        .into_iter()
                        .map(|j| member.var_map[j])
                        .collect();
                    rows.take_columns_filled(&columns, &self.config.fill)?
                } else {
                    rows
                }
            }
            Err(StoreError::KeyNotFound { .. }) => template.fill(n_rows, &self.config.fill)?,
            Err(e) => return Err(e),
        };
        Ok(Chunk {
            member: segment.member,
            element,
        })
    }
}
