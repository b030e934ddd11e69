//! # Backing Store
//!
//! Hierarchical container of named groups, leaf datasets and small JSON
//! attributes, laid out on the filesystem:
//!
//! - a group is a directory; its attributes live in `.attrs.json`
//! - a dataset is a single file (see [`crate::io::array_file`])
//! - dot-prefixed names are reserved (attributes, lock, staging)
//!
//! ## Locking
//! Every store directory holds a `.lock` file. Write-mode handles take an
//! exclusive lock, read-only handles a shared one; contention fails with
//! `Locked` instead of blocking. The lock is released on `close` or when the
//! last handle is dropped.
//!
//! ## Atomic replacement
//! Datasets are written to a dot-prefixed temporary file and renamed into
//! place. Group elements are built in a dot-prefixed staging directory
//! ([`StagedGroup`]) and swapped in on commit. Readers never observe a
//! partially written entry.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info_span, warn};

use crate::config::OpenMode;
use crate::data::{validate_name, DenseArray};
use crate::error::{Result, StoreError};
use crate::io::array_file::{self, Dataset};

/// Attribute map attached to groups and datasets
pub type Attributes = serde_json::Map<String, serde_json::Value>;

const ATTRS_FILE: &str = ".attrs.json";
const LOCK_FILE: &str = ".lock";
const TEMP_PREFIX: &str = ".tmp-";
const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".old-";

/// State shared by every handle derived from one open store
#[derive(Debug)]
pub(crate) struct StoreInner {
    root: PathBuf,
    writable: bool,
    sync_writes: bool,
    closed: AtomicBool,
    lock: Mutex<Option<File>>,
    scratch_counter: AtomicU64,
}

impl StoreInner {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(StoreError::ReadOnly {
                path: self.root.clone(),
            });
        }
        Ok(())
    }

    fn scratch_name(&self, prefix: &str, name: &str) -> String {
        let n = self.scratch_counter.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}{name}-{}-{n}", std::process::id())
    }

    fn logical(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
            Ok(rel) => format!("/{}", rel.to_string_lossy()),
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }

    /// Write a file next to `target` and rename it into place
    fn write_file_atomic(
        &self,
        target: &Path,
        write: impl FnOnce(&mut BufWriter<File>) -> Result<()>,
    ) -> Result<()> {
        let (dir, name) = split_target(target)?;
        let tmp = dir.join(self.scratch_name(TEMP_PREFIX, name));
        let result: Result<()> = (|| {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            write(&mut writer)?;
            writer.flush()?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            if self.sync_writes {
                file.sync_all()?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        self.swap_into_place(&tmp, target)
    }

    /// Move `staged` over `target`, retiring whatever was there
    fn swap_into_place(&self, staged: &Path, target: &Path) -> Result<()> {
        let existing = fs::symlink_metadata(target).ok();
        let staged_is_dir = fs::symlink_metadata(staged)?.is_dir();
        match existing {
            Some(meta) if meta.is_dir() || staged_is_dir => {
                let (dir, name) = split_target(target)?;
                let retired = dir.join(self.scratch_name(RETIRED_PREFIX, name));
                fs::rename(target, &retired)?;
                if let Err(e) = fs::rename(staged, target) {
                    let _ = fs::rename(&retired, target);
                    return Err(e.into());
                }
                // the new entry is in place; a leftover is swept on the next write open
                discard_retired(&retired, meta.is_dir());
            }
            _ => fs::rename(staged, target)?,
        }
        Ok(())
    }
}

/// Best-effort removal of a replaced entry
fn discard_retired(path: &Path, is_dir: bool) {
    let result = if is_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "could not remove replaced entry");
    }
}

fn split_target(target: &Path) -> Result<(&Path, &str)> {
    let dir = target
        .parent()
        .ok_or_else(|| StoreError::invalid_name(target.to_string_lossy()))?;
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::invalid_name(target.to_string_lossy()))?;
    Ok((dir, name))
}

/// An open store: the root of the hierarchy plus its lock
#[derive(Clone, Debug)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Create a new, empty store directory and lock it for writing
    pub fn create(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref();
        let _span = info_span!("store_create", path = %path.display()).entered();
        fs::create_dir(path)?;
        let lock = acquire_lock(path, true)?;
        let store = Self::from_parts(path, true, sync_writes, lock);
        store.root().set_attrs(&Attributes::new())?;
        debug!("created store");
        Ok(store)
    }

    /// Open an existing store directory
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, sync_writes: bool) -> Result<Self> {
        if mode == OpenMode::CreateNew {
            return Self::create(path, sync_writes);
        }
        let path = path.as_ref();
        let _span = info_span!("store_open", path = %path.display(), ?mode).entered();
        let meta = fs::metadata(path)?;
        if !meta.is_dir() {
            return Err(StoreError::corrupted(path, "store location is not a directory"));
        }
        if !path.join(ATTRS_FILE).is_file() {
            return Err(StoreError::corrupted(path, "missing root attributes"));
        }
        let writable = mode.is_writable();
        let lock = acquire_lock(path, writable)?;
        if writable {
            sweep_scratch(path)?;
        }
        debug!(writable, "opened store");
        Ok(Self::from_parts(path, writable, sync_writes, lock))
    }

    fn from_parts(path: &Path, writable: bool, sync_writes: bool, lock: File) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                root: path.to_path_buf(),
                writable,
                sync_writes,
                closed: AtomicBool::new(false),
                lock: Mutex::new(Some(lock)),
                scratch_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Root group
    pub fn root(&self) -> Group {
        Group {
            inner: Arc::clone(&self.inner),
            path: self.inner.root.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.root
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Flush and release the lock. Every handle derived from this store
    /// fails with `Closed` afterwards.
    pub fn close(&self) -> Result<()> {
        let _span = info_span!("store_close", path = %self.inner.root.display()).entered();
        self.inner.check_open()?;
        if self.inner.writable && self.inner.sync_writes {
            // directory entries of renamed files
            File::open(&self.inner.root)?.sync_all()?;
        }
        self.inner.closed.store(true, Ordering::Release);
        let lock = match self.inner.lock.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(lock);
        debug!("closed store");
        Ok(())
    }
}

fn acquire_lock(root: &Path, exclusive: bool) -> Result<File> {
    let path = root.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    let attempt = if exclusive {
        file.try_lock()
    } else {
        file.try_lock_shared()
    };
    match attempt {
        Ok(()) => {
            debug!(exclusive, "acquired store lock");
            Ok(file)
        }
        Err(TryLockError::WouldBlock) => Err(StoreError::Locked {
            path: root.to_path_buf(),
        }),
        Err(TryLockError::Error(e)) => Err(e.into()),
    }
}

/// Remove staging leftovers from an interrupted writer
fn sweep_scratch(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let file_type = entry.file_type()?;
        let scratch = [TEMP_PREFIX, STAGING_PREFIX, RETIRED_PREFIX]
            .iter()
            .any(|p| name.starts_with(p));
        if scratch {
            warn!(entry = %entry.path().display(), "removing stale staging entry");
            if file_type.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        } else if file_type.is_dir() {
            sweep_scratch(&entry.path())?;
        }
    }
    Ok(())
}

/// A child entry of a group
#[derive(Debug)]
pub enum Node {
    Group(Group),
    Dataset(Dataset),
}

/// Handle to a group (directory) inside an open store
#[derive(Clone, Debug)]
pub struct Group {
    inner: Arc<StoreInner>,
    path: PathBuf,
}

impl Group {
    /// Logical path from the store root, e.g. `/obs_extras/X_pca`
    pub fn name(&self) -> String {
        self.inner.logical(&self.path)
    }

    /// Filesystem path of this group
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn inner(&self) -> &Arc<StoreInner> {
        &self.inner
    }

    pub fn attrs(&self) -> Result<Attributes> {
        self.inner.check_open()?;
        let path = self.path.join(ATTRS_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::corrupted(&self.path, "group has no attributes"))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::corrupted(&path, format!("bad attributes: {e}")))
    }

    pub fn set_attrs(&self, attrs: &Attributes) -> Result<()> {
        self.inner.check_writable()?;
        let bytes = serde_json::to_vec_pretty(attrs)?;
        self.inner
            .write_file_atomic(&self.path.join(ATTRS_FILE), |w| Ok(w.write_all(&bytes)?))
    }

    /// Child names in lexical order
    pub fn list(&self) -> Result<Vec<String>> {
        self.inner.check_open()?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let name = entry?.file_name();
            match name.to_str() {
                Some(n) if !n.starts_with('.') => names.push(n.to_string()),
                Some(_) => {}
                None => {
                    return Err(StoreError::corrupted(
                        &self.path,
                        format!("non UTF-8 entry {name:?}"),
                    ))
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        self.inner.check_open()?;
        validate_name(name)?;
        Ok(fs::symlink_metadata(self.path.join(name)).is_ok())
    }

    /// Child entry, or `None` if absent
    pub fn node(&self, name: &str) -> Result<Option<Node>> {
        self.inner.check_open()?;
        validate_name(name)?;
        let path = self.path.join(name);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            Ok(Some(Node::Group(Group {
                inner: Arc::clone(&self.inner),
                path,
            })))
        } else {
            Ok(Some(Node::Dataset(Dataset::open(Arc::clone(&self.inner), path)?)))
        }
    }

    /// Child group; fails with `KeyNotFound` if absent
    pub fn group(&self, name: &str) -> Result<Group> {
        match self.node(name)? {
            Some(Node::Group(g)) => Ok(g),
            Some(Node::Dataset(_)) => Err(StoreError::type_mismatch(format!(
                "{}/{name} is a dataset, expected a group",
                self.name().trim_end_matches('/')
            ))),
            None => Err(StoreError::key_not_found(self.child_name(name))),
        }
    }

    /// Child dataset; fails with `KeyNotFound` if absent
    pub fn dataset(&self, name: &str) -> Result<Dataset> {
        match self.node(name)? {
            Some(Node::Dataset(d)) => Ok(d),
            Some(Node::Group(_)) => Err(StoreError::type_mismatch(format!(
                "{} is a group, expected a dataset",
                self.child_name(name)
            ))),
            None => Err(StoreError::key_not_found(self.child_name(name))),
        }
    }

    /// Create an empty child group in place, with empty attributes
    pub fn create_group(&self, name: &str) -> Result<Group> {
        self.inner.check_writable()?;
        validate_name(name)?;
        let path = self.path.join(name);
        fs::create_dir(&path)?;
        let group = Group {
            inner: Arc::clone(&self.inner),
            path,
        };
        group.set_attrs(&Attributes::new())?;
        Ok(group)
    }

    /// Write (or atomically replace) a leaf dataset
    pub fn write_array(&self, name: &str, array: &DenseArray, attrs: &Attributes) -> Result<()> {
        self.inner.check_writable()?;
        validate_name(name)?;
        debug!(
            path = %self.child_name(name),
            dtype = %array.dtype(),
            shape = ?array.shape(),
            "writing dataset"
        );
        self.inner
            .write_file_atomic(&self.path.join(name), |w| array_file::write(w, array, attrs))
    }

    /// Start building a child group that replaces `name` on commit
    pub fn stage_group(&self, name: &str) -> Result<StagedGroup> {
        self.inner.check_writable()?;
        validate_name(name)?;
        let staging = self.path.join(self.inner.scratch_name(STAGING_PREFIX, name));
        fs::create_dir(&staging)?;
        let group = Group {
            inner: Arc::clone(&self.inner),
            path: staging,
        };
        let staged = StagedGroup {
            target: self.path.join(name),
            group,
            committed: false,
        };
        staged.group.set_attrs(&Attributes::new())?;
        Ok(staged)
    }

    /// Remove a child entry; returns whether it existed
    pub fn remove(&self, name: &str) -> Result<bool> {
        self.inner.check_writable()?;
        validate_name(name)?;
        let path = self.path.join(name);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %self.child_name(name), "removing entry");
        if meta.is_dir() {
            // retire first so readers never see a half-deleted group
            let retired = self.path.join(self.inner.scratch_name(RETIRED_PREFIX, name));
            fs::rename(&path, &retired)?;
            fs::remove_dir_all(&retired)?;
        } else {
            fs::remove_file(&path)?;
        }
        Ok(true)
    }

    fn child_name(&self, name: &str) -> String {
        format!("{}/{name}", self.name().trim_end_matches('/'))
    }
}

/// A group under construction in a staging directory
#[derive(Debug)]
pub struct StagedGroup {
    target: PathBuf,
    group: Group,
    committed: bool,
}

impl StagedGroup {
    /// Group to write children into
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Swap the staged group into place, replacing any previous entry
    pub fn commit(mut self) -> Result<()> {
        self.group.inner.check_writable()?;
        self.group
            .inner
            .swap_into_place(&self.group.path, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedGroup {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_dir_all(&self.group.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_groups_and_attrs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(dir.path().join("s"), false).unwrap();
        let root = store.root();
        let g = root.create_group("obs").unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("encoding-type".into(), json!("table"));
        g.set_attrs(&attrs).unwrap();

        assert_eq!(root.list().unwrap(), vec!["obs"]);
        assert_eq!(root.group("obs").unwrap().attrs().unwrap(), attrs);
        assert_eq!(g.name(), "/obs");
        assert!(matches!(root.group("var"), Err(StoreError::KeyNotFound { .. })));
        assert!(matches!(root.group(".lock"), Err(StoreError::InvalidName { .. })));
    }

    #[test]
    fn test_staged_group_replaces_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(dir.path().join("s"), false).unwrap();
        let root = store.root();
        root.write_array("primary", &DenseArray::from(vec![1i32, 2]), &Attributes::new())
            .unwrap();
        assert!(matches!(root.node("primary").unwrap(), Some(Node::Dataset(_))));

        let staged = root.stage_group("primary").unwrap();
        staged
            .group()
            .write_array("data", &DenseArray::from(vec![1.0f32]), &Attributes::new())
            .unwrap();
        // staging entries are invisible until commit
        assert_eq!(root.list().unwrap(), vec!["primary"]);
        staged.commit().unwrap();

        let g = root.group("primary").unwrap();
        assert_eq!(g.list().unwrap(), vec!["data"]);
    }

    #[test]
    fn test_abandoned_stage_is_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let store = Store::create(&path, false).unwrap();
        {
            let _staged = store.root().stage_group("layers").unwrap();
        }
        let leftovers: Vec<_> = fs::read_dir(&path)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_exclusive_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let writer = Store::create(&path, false).unwrap();
        assert!(matches!(
            Store::open(&path, OpenMode::ReadWrite, false),
            Err(StoreError::Locked { .. })
        ));
        assert!(matches!(
            Store::open(&path, OpenMode::ReadOnly, false),
            Err(StoreError::Locked { .. })
        ));
        writer.close().unwrap();

        let r1 = Store::open(&path, OpenMode::ReadOnly, false).unwrap();
        let r2 = Store::open(&path, OpenMode::ReadOnly, false).unwrap();
        assert!(matches!(
            Store::open(&path, OpenMode::ReadWrite, false),
            Err(StoreError::Locked { .. })
        ));
        drop(r1);
        drop(r2);
        Store::open(&path, OpenMode::ReadWrite, false).unwrap();
    }

    #[test]
    fn test_closed_and_read_only_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let store = Store::create(&path, false).unwrap();
        let root = store.root();
        store.close().unwrap();
        assert!(matches!(root.list(), Err(StoreError::Closed)));
        assert!(matches!(store.close(), Err(StoreError::Closed)));

        let reader = Store::open(&path, OpenMode::ReadOnly, false).unwrap();
        assert!(matches!(
            reader.root().create_group("x"),
            Err(StoreError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Store::create(dir.path(), false).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(err.is_io());
    }

    #[test]
    fn test_retired_entry_cleanup_never_fails() {
        let dir = tempfile::tempdir().unwrap();
        let retired = dir.path().join(".old-layers-1-0");
        fs::create_dir(&retired).unwrap();
        fs::write(retired.join("data"), b"x").unwrap();
        discard_retired(&retired, true);
        assert!(!retired.exists());
        // already gone: logged, not an error
        discard_retired(&retired, true);
        discard_retired(&dir.path().join(".old-x-1-0"), false);
    }

    #[test]
    fn test_swap_leftover_is_swept_on_write_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let store = Store::create(&path, false).unwrap();
        store.root().create_group("layers").unwrap();
        fs::create_dir(path.join("layers").join(".old-counts-1-0")).unwrap();
        store.close().unwrap();

        let store = Store::open(&path, OpenMode::ReadWrite, false).unwrap();
        assert!(!path.join("layers").join(".old-counts-1-0").exists());
        assert_eq!(store.root().group("layers").unwrap().list().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(dir.path().join("s"), true).unwrap();
        let root = store.root();
        root.create_group("g").unwrap();
        assert!(root.remove("g").unwrap());
        assert!(!root.remove("g").unwrap());
        assert!(root.list().unwrap().is_empty());
    }
}
