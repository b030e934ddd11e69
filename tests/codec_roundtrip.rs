use annstore::config::FillPolicy;
use annstore::data::ArrayType;
use annstore::io::{codec, Group, Store};
use annstore::{
    AxisIndex, Categorical, DType, DenseArray, Element, Encoding, Mapping, Selection,
    SparseFormat, SparseMatrix, TypedTable,
};
use anyhow::Result;
use ndarray::{array, Array2, Array3, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// --- Helpers ---

fn with_root<T>(f: impl FnOnce(&Group) -> Result<T>) -> Result<T> {
    let dir = tempfile::tempdir()?;
    let store = Store::create(dir.path().join("store"), false)?;
    f(&store.root())
}

fn assert_roundtrip(root: &Group, name: &str, element: Element) -> Result<()> {
    codec::encode(root, name, &element)?;
    let decoded = codec::decode(root, name)?;
    assert_eq!(decoded, element, "roundtrip of {name}");
    let info = codec::inspect(root, name)?;
    assert_eq!(info.encoding, element.encoding());
    assert_eq!(info.dtype, element.dtype());
    Ok(())
}

/// 20×5 dense matrix with roughly 10% non-zero entries
fn sparse_fixture<T: ArrayType>(rng: &mut StdRng, mut value: impl FnMut(&mut StdRng) -> T) -> DenseArray {
    let zero = T::fill_value(&FillPolicy::zeros());
    let dense = Array2::from_shape_fn((20, 5), |_| {
        if rng.gen_bool(0.1) {
            value(rng)
        } else {
            zero.clone()
        }
    });
    DenseArray::from(dense)
}

fn nonzero<T: PartialEq + From<u8>>(v: T) -> T {
    if v == T::from(0u8) {
        T::from(1u8)
    } else {
        v
    }
}

// --- Dense arrays ---

#[test]
fn test_dense_roundtrip_every_dtype() -> Result<()> {
    with_root(|root| {
        let cases: Vec<(&str, DenseArray)> = vec![
            ("i8", DenseArray::from(array![[i8::MIN, -1], [0, i8::MAX]])),
            ("i16", DenseArray::from(array![i16::MIN, 7, i16::MAX])),
            ("i32", DenseArray::from(array![[1i32, 2, 3], [4, 5, 6]])),
            ("i64", DenseArray::from(vec![i64::MIN, 0, i64::MAX])),
            ("u8", DenseArray::from(vec![0u8, 255])),
            ("u16", DenseArray::from(vec![u16::MAX])),
            ("u32", DenseArray::from(array![[u32::MAX], [1]])),
            ("u64", DenseArray::from(vec![u64::MAX, 3])),
            ("f32", DenseArray::from(array![[f32::NAN, 1.5], [f32::INFINITY, -0.0]])),
            ("f64", DenseArray::from(vec![f64::NAN, f64::MIN_POSITIVE, -2.5])),
            ("bool", DenseArray::from((0..130).map(|i| i % 3 == 0).collect::<Vec<_>>())),
            ("str", DenseArray::from(vec!["", "ünïcode", "a,b"])),
        ];
        for (name, array) in cases {
            assert_roundtrip(root, name, Element::Array(array))?;
        }
        Ok(())
    })
}

#[test]
fn test_dense_empty_and_higher_rank() -> Result<()> {
    with_root(|root| {
        assert_roundtrip(root, "empty_rows", Element::Array(DenseArray::zeros(DType::Float32, &[0, 4])))?;
        assert_roundtrip(root, "empty_cols", Element::Array(DenseArray::zeros(DType::Int64, &[3, 0])))?;
        assert_roundtrip(root, "empty_str", Element::Array(DenseArray::zeros(DType::String, &[0])))?;
        let cube = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 100 + j * 10 + k) as u16);
        assert_roundtrip(root, "cube", Element::from(cube))?;
        let zero_d = ArrayD::from_elem(IxDyn(&[]), 4.25f64);
        assert_roundtrip(root, "zero_d", Element::from(zero_d))?;
        Ok(())
    })
}

#[test]
fn test_scalar_roundtrip() -> Result<()> {
    with_root(|root| {
        assert_roundtrip(root, "int", Element::from(-12i64))?;
        assert_roundtrip(root, "float", Element::from(f64::NAN))?;
        assert_roundtrip(root, "flag", Element::from(true))?;
        assert_roundtrip(root, "text", Element::from("hello"))?;
        let info = codec::inspect(root, "text")?;
        assert_eq!(info.encoding, Encoding::Scalar);
        assert_eq!(info.shape, None);
        Ok(())
    })
}

// --- Sparse matrices ---

#[test]
fn test_sparse_roundtrip_at_90_percent_sparsity() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let fixtures: Vec<DenseArray> = vec![
        sparse_fixture(&mut rng, |r| nonzero(r.gen::<i8>() as i16) as i8),
        sparse_fixture(&mut rng, |r| nonzero(r.gen::<i16>())),
        sparse_fixture(&mut rng, |r| nonzero(r.gen::<i32>())),
        sparse_fixture(&mut rng, |r| nonzero(r.gen::<i64>())),
        sparse_fixture(&mut rng, |r| nonzero(r.gen::<u8>())),
        sparse_fixture(&mut rng, |r| nonzero(r.gen::<u16>())),
        sparse_fixture(&mut rng, |r| nonzero(r.gen::<u32>())),
        sparse_fixture(&mut rng, |r| nonzero(r.gen::<u64>())),
        sparse_fixture(&mut rng, |r| r.gen_range(1.0f32..100.0)),
        sparse_fixture(&mut rng, |r| r.gen_range(-100.0f64..-1.0)),
        sparse_fixture(&mut rng, |_| true),
    ];
    assert_eq!(fixtures.len(), DType::NUMERIC_AND_BOOL.len());

    with_root(|root| {
        for dense in &fixtures {
            for format in [SparseFormat::Csr, SparseFormat::Csc] {
                let matrix = SparseMatrix::from_dense(dense, format)?;
                let name = format!("{}_{:?}", dense.dtype(), format);
                codec::encode(root, &name, &Element::Sparse(matrix.clone()))?;
                let decoded = codec::decode(root, &name)?;
                assert_eq!(decoded, Element::Sparse(matrix), "{name}");
                assert_eq!(decoded.to_dense()?, *dense, "{name} element-wise");
            }
        }
        Ok(())
    })
}

#[test]
fn test_backed_row_reads_match_in_memory_selection() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let dense = sparse_fixture(&mut rng, |r| r.gen_range(0.5f64..2.0));
    let selections = vec![
        Selection::All,
        Selection::from(3..17),
        Selection::from(0..0),
        Selection::from(vec![19, 0, 5, 5, 6, 7, 2]),
        Selection::from((0..20).rev().collect::<Vec<_>>()),
    ];
    with_root(|root| {
        let elements = [
            ("dense", Element::Array(dense.clone())),
            ("csr", Element::Sparse(SparseMatrix::from_dense(&dense, SparseFormat::Csr)?)),
            ("csc", Element::Sparse(SparseMatrix::from_dense(&dense, SparseFormat::Csc)?)),
        ];
        for (name, element) in &elements {
            codec::encode(root, name, element)?;
            for selection in &selections {
                let from_disk = codec::decode_rows(root, name, selection)?;
                let in_memory = element.select_rows(selection)?;
                assert_eq!(from_disk.to_dense()?, in_memory.to_dense()?, "{name} {selection:?}");
            }
        }
        Ok(())
    })
}

// --- Tables and mappings ---

#[test]
fn test_table_roundtrip() -> Result<()> {
    with_root(|root| {
        let mut table = TypedTable::new(AxisIndex::new(["AAAC", "AAAG", "AAAT", "AACA"])?);
        table.set_column("n_genes", vec![120u32, 98, 301, 45])?;
        table.set_column("pct_mito", vec![0.5f32, f32::NAN, 1.25, 0.0])?;
        table.set_column("passed", vec![true, false, true, true])?;
        table.set_column("cluster", Categorical::new(vec![1, 0, -1, 1], vec!["B".into(), "T".into()], true)?)?;
        table.set_column("donor", vec!["d1", "d2", "d1", "d3"])?;
        assert_roundtrip(root, "obs", Element::Table(table))?;

        assert_roundtrip(root, "empty", Element::Table(TypedTable::default()))?;
        let info = codec::inspect(root, "obs")?;
        assert_eq!(info.shape, Some(vec![4, 5]));
        Ok(())
    })
}

#[test]
fn test_nested_metadata_roundtrip() -> Result<()> {
    with_root(|root| {
        let mut c = Mapping::new();
        c.insert("1".into(), Element::from(2i64));
        c.insert("2".into(), Element::from(5i64));
        let mut uns = Mapping::new();
        uns.insert("a".into(), Element::from(1i64));
        uns.insert("b".into(), Element::from(2.0f64));
        uns.insert("c".into(), Element::Mapping(c));
        uns.insert("d".into(), Element::from("test"));
        uns.insert("e".into(), Element::from(array![[1u8, 0], [0, 1]]));
        assert_roundtrip(root, "uns", Element::Mapping(uns))?;
        assert_roundtrip(root, "nothing", Element::Mapping(Mapping::new()))?;
        Ok(())
    })
}
