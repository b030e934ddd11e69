use std::path::Path;

use annstore::{
    AccessStrategy, AnnotatedMatrix, Categorical, DenseArray, Element, ElementHandle, Mapping, OpenMode,
    Selection, SparseFormat, SparseMatrix, StoreConfig, StoreError,
};
use anyhow::Result;
use ndarray::{array, Array2};

// --- Helpers ---

fn in_memory() -> StoreConfig {
    StoreConfig {
        sync_writes: false,
        ..StoreConfig::in_memory()
    }
}

fn backed() -> StoreConfig {
    StoreConfig {
        sync_writes: false,
        ..StoreConfig::backed()
    }
}

/// 3 cells × 4 genes with labels, a layer and one extra per axis
fn populated(path: &Path) -> Result<()> {
    let mut m = AnnotatedMatrix::create(path, &backed())?;
    m.set_primary(Array2::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as f32))?;
    m.set_obs_names(["c0", "c1", "c2"])?;
    m.set_var_names(["g0", "g1", "g2", "g3"])?;
    m.set_obs_column("batch", Categorical::from_values(&["a", "b", "a"]))?;
    m.set_layer(
        "counts",
        SparseMatrix::from_triplets(
            SparseFormat::Csr,
            [3, 4],
            &[0, 2, 2],
            &[1, 0, 3],
            vec![5i32, 6, 7].into(),
        )?,
    )?;
    m.set_obs_extra("X_pca", array![[0.1f64, 0.2], [0.3, 0.4], [0.5, 0.6]])?;
    m.set_var_extra("highly_variable", vec![true, false, false, true])?;
    m.close()?;
    Ok(())
}

fn nested_metadata() -> Element {
    let mut c = Mapping::new();
    c.insert("1".into(), Element::from(2i64));
    c.insert("2".into(), Element::from(5i64));
    let mut uns = Mapping::new();
    uns.insert("a".into(), Element::from(1i64));
    uns.insert("b".into(), Element::from(2.0f64));
    uns.insert("c".into(), Element::Mapping(c));
    uns.insert("d".into(), Element::from("test"));
    Element::Mapping(uns)
}

// --- Access strategies ---

#[test]
fn test_backed_and_in_memory_open_agree() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("pbmc");
    populated(&path)?;

    let lazy = AnnotatedMatrix::open(&path, OpenMode::ReadOnly, &backed())?;
    let eager = AnnotatedMatrix::open(&path, OpenMode::ReadOnly, &in_memory())?;
    assert!(lazy.is_backed());
    assert!(!eager.is_backed());
    assert_eq!((lazy.n_obs(), lazy.n_var()), (3, 4));
    assert_eq!(eager.obs_names()?, lazy.obs_names()?);

    let handle = lazy.get_layer("counts")?;
    assert!(matches!(handle, ElementHandle::Backed(_)));
    assert_eq!(handle.shape(), Some(vec![3, 4]));
    assert!(matches!(eager.get_layer("counts")?, ElementHandle::Memory(_)));

    for name in lazy.layer_keys()? {
        assert_eq!(lazy.get_layer(&name)?.read()?, eager.get_layer(&name)?.read()?);
    }
    assert_eq!(lazy.get_primary()?.read()?, eager.get_primary()?.read()?);
    assert_eq!(lazy.obs_extra_keys()?, vec!["X_pca".to_string()]);
    assert_eq!(lazy.get_var_extra("highly_variable")?.read()?.dtype(), eager.get_var_extra("highly_variable")?.dtype());
    Ok(())
}

#[test]
fn test_backed_primary_row_reads() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("pbmc");
    populated(&path)?;
    let m = AnnotatedMatrix::open(&path, OpenMode::ReadOnly, &backed())?;

    let rows = m.read_primary_rows(&Selection::from(vec![2, 0]), &Selection::from(1..3))?;
    let expected = Element::from(array![[9.0f32, 10.0], [1.0, 2.0]]);
    assert_eq!(rows, expected);

    let layer = m.get_layer("counts")?.read_rows(&Selection::from(2..3))?;
    assert_eq!(layer.to_dense()?, DenseArray::from(array![[6i32, 0, 0, 7]]));
    Ok(())
}

#[test]
fn test_to_memory_and_write_preserve_content() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("pbmc");
    populated(&path)?;
    let backed_matrix = AnnotatedMatrix::open(&path, OpenMode::ReadOnly, &backed())?;

    let mut copy = backed_matrix.to_memory()?;
    assert!(!copy.is_backed());
    assert_eq!(copy.location(), None);
    assert_eq!(copy.get_primary()?.read()?, backed_matrix.get_primary()?.read()?);

    let out = dir.path().join("copy");
    copy.set_metadata("uns", nested_metadata())?;
    copy.write(&out)?;
    let reopened = AnnotatedMatrix::open(&out, OpenMode::ReadOnly, &in_memory())?;
    assert_eq!(reopened.get_obs_table()?, copy.get_obs_table()?);
    assert_eq!(reopened.get_layer("counts")?.read()?, copy.get_layer("counts")?.read()?);
    assert_eq!(reopened.get_metadata("uns")?.read()?, nested_metadata());
    Ok(())
}

// --- Persistence of edits ---

#[test]
fn test_var_column_persists() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("store");
    {
        let mut m = AnnotatedMatrix::create(&path, &backed())?;
        m.set_primary(array![[1u32, 0, 2]])?;
        m.set_var_column("Count", vec![1i64, 2, 3])?;
    }
    let m = AnnotatedMatrix::open(&path, OpenMode::ReadOnly, &backed())?;
    let count = m.get_var_table()?.get_column("Count")?.to_vec::<i64>()?;
    assert_eq!(count, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn test_nested_metadata_persists() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("store");
    {
        let mut m = AnnotatedMatrix::create(&path, &backed())?;
        m.set_metadata("uns", nested_metadata())?;
        m.close()?;
    }
    for config in [backed(), in_memory()] {
        let m = AnnotatedMatrix::open(&path, OpenMode::ReadOnly, &config)?;
        assert_eq!(m.get_metadata("uns")?.read()?, nested_metadata());
        assert_eq!((m.n_obs(), m.n_var()), (0, 0));
    }
    Ok(())
}

#[test]
fn test_rejected_assignment_leaves_disk_unchanged() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("store");
    {
        let mut m = AnnotatedMatrix::create(&path, &backed())?;
        m.set_primary(Array2::<f64>::zeros((4, 2)))?;
        let err = m.set_layer("bad", Array2::<f64>::zeros((3, 2))).unwrap_err();
        assert!(matches!(err, StoreError::ShapeMismatch { .. }));
        let err = m.set_obs_extra("bad", Array2::<f64>::zeros((5, 1))).unwrap_err();
        assert!(matches!(err, StoreError::ShapeMismatch { .. }));
        assert!(!m.has_layer("bad")?);
    }
    let m = AnnotatedMatrix::open(&path, OpenMode::ReadOnly, &backed())?;
    assert!(m.layer_keys()?.is_empty());
    assert!(m.obs_extra_keys()?.is_empty());
    assert_eq!((m.n_obs(), m.n_var()), (4, 2));
    Ok(())
}

#[test]
fn test_remove_entry_persists() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("pbmc");
    populated(&path)?;
    {
        let mut m = AnnotatedMatrix::open(&path, OpenMode::ReadWrite, &backed())?;
        assert!(m.remove_layer("counts")?);
        assert!(!m.remove_layer("counts")?);
        assert!(m.remove_primary()?);
    }
    let m = AnnotatedMatrix::open(&path, OpenMode::ReadOnly, &in_memory())?;
    assert!(!m.has_layer("counts")?);
    assert!(!m.has_primary()?);
    assert!(matches!(m.get_primary(), Err(StoreError::KeyNotFound { .. })));
    assert_eq!(m.n_obs(), 3);
    Ok(())
}

// --- Handle lifecycle ---

#[test]
fn test_locking() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("pbmc");
    populated(&path)?;

    let writer = AnnotatedMatrix::open(&path, OpenMode::ReadWrite, &backed())?;
    assert!(matches!(
        AnnotatedMatrix::open(&path, OpenMode::ReadWrite, &backed()),
        Err(StoreError::Locked { .. })
    ));
    assert!(matches!(
        AnnotatedMatrix::open(&path, OpenMode::ReadOnly, &backed()),
        Err(StoreError::Locked { .. })
    ));
    drop(writer);

    let r1 = AnnotatedMatrix::open(&path, OpenMode::ReadOnly, &backed())?;
    let r2 = AnnotatedMatrix::open(&path, OpenMode::ReadOnly, &in_memory())?;
    assert_eq!(r1.n_obs(), r2.n_obs());
    assert!(matches!(
        AnnotatedMatrix::open(&path, OpenMode::ReadWrite, &backed()),
        Err(StoreError::Locked { .. })
    ));
    Ok(())
}

#[test]
fn test_read_only_rejects_writes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("pbmc");
    populated(&path)?;
    let mut m = AnnotatedMatrix::open(&path, OpenMode::ReadOnly, &backed())?;
    assert!(matches!(
        m.set_layer("more", Array2::<f32>::zeros((3, 4))),
        Err(StoreError::ReadOnly { .. })
    ));
    assert!(matches!(
        m.set_var_column("n_cells", vec![1u8, 2, 3, 4]),
        Err(StoreError::ReadOnly { .. })
    ));
    assert!(!m.has_layer("more")?);
    assert!(!m.get_var_table()?.contains("n_cells"));
    Ok(())
}

#[test]
fn test_closed_handle_and_lazy_elements() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("pbmc");
    populated(&path)?;
    let mut m = AnnotatedMatrix::open(&path, OpenMode::ReadOnly, &backed())?;
    let lazy = m.get_layer("counts")?;
    m.close()?;

    assert!(m.is_closed());
    assert!(matches!(m.get_layer("counts"), Err(StoreError::Closed)));
    assert!(matches!(m.get_obs_table(), Err(StoreError::Closed)));
    assert!(matches!(lazy.read(), Err(StoreError::Closed)));
    assert!(matches!(m.close(), Err(StoreError::Closed)));
    Ok(())
}

#[test]
fn test_create_refuses_existing_store() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("pbmc");
    populated(&path)?;
    assert!(AnnotatedMatrix::create(&path, &backed()).is_err());
    assert!(AnnotatedMatrix::open(&path, OpenMode::CreateNew, &backed()).is_err());
    Ok(())
}

#[test]
fn test_missing_store_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = AnnotatedMatrix::open(dir.path().join("absent"), OpenMode::ReadOnly, &backed());
    assert!(result.is_err());
}

#[test]
fn test_strategy_is_reported() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let m = AnnotatedMatrix::create(dir.path().join("s"), &in_memory())?;
    assert_eq!(m.strategy(), AccessStrategy::InMemory);
    assert_eq!(m.location(), Some(dir.path().join("s").as_path()));
    Ok(())
}
