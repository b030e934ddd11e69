//! # Array Files
//!
//! On-disk format of a leaf dataset. One file holds one n-d array plus its
//! attributes.
//!
//! Format:
//! - [Magic 8 bytes] "ANNSTD01"
//! - [Version u32 LE]
//! - [Header length u32 LE]
//! - [Header JSON] `{ "dtype": "...", "shape": [...], "attrs": {...} }`
//! - [Padding] zeros up to an 8-byte boundary
//! - [Payload]
//!   - numerics: little-endian values in C order
//!   - bool: bits packed LSB-first into `u64` words
//!   - string: `n + 1` `u64` offsets, then the concatenated UTF-8 bytes
//!
//! Reads go through a memory map, so row ranges of large arrays are decoded
//! without touching the rest of the payload.

use std::fs::File;
use std::io::Write;
use std::mem::size_of;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitvec::prelude::*;
use bytemuck::{pod_read_unaligned, Pod};
use memmap2::Mmap;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::data::{DType, DenseArray};
use crate::error::{Result, StoreError};
use crate::io::store::{Attributes, StoreInner};

#[cfg(target_endian = "big")]
compile_error!("array payloads are stored in little-endian byte order");

const MAGIC: &[u8; 8] = b"ANNSTD01";
const VERSION: u32 = 1;
const PREAMBLE_LEN: usize = 16;

/// Header stored as JSON in front of the payload
#[derive(Serialize, Deserialize)]
struct RawHeader {
    dtype: String,
    shape: Vec<usize>,
    #[serde(default)]
    attrs: Attributes,
}

/// Split positions into maximal runs of consecutive ascending values,
/// preserving order
pub(crate) fn consecutive_runs(positions: &[usize]) -> Vec<Range<usize>> {
    let mut runs: Vec<Range<usize>> = Vec::new();
    for &p in positions {
        match runs.last_mut() {
            Some(run) if run.end == p => run.end += 1,
            _ => runs.push(p..p + 1),
        }
    }
    runs
}

fn padding(len: usize) -> usize {
    (8 - len % 8) % 8
}

/// Serialize an array and its attributes
pub fn write<W: Write>(writer: &mut W, array: &DenseArray, attrs: &Attributes) -> Result<()> {
    let header = RawHeader {
        dtype: array.dtype().as_str().to_string(),
        shape: array.shape().to_vec(),
        attrs: attrs.clone(),
    };
    let header_json = serde_json::to_vec(&header)?;
    let header_len = u32::try_from(header_json.len())
        .map_err(|_| StoreError::shape_mismatch("dataset header too large"))?;

    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&header_len.to_le_bytes())?;
    writer.write_all(&header_json)?;
    writer.write_all(&[0u8; 8][..padding(PREAMBLE_LEN + header_json.len())])?;

    match array {
        DenseArray::I8(a) => write_pod(writer, a),
        DenseArray::I16(a) => write_pod(writer, a),
        DenseArray::I32(a) => write_pod(writer, a),
        DenseArray::I64(a) => write_pod(writer, a),
        DenseArray::U8(a) => write_pod(writer, a),
        DenseArray::U16(a) => write_pod(writer, a),
        DenseArray::U32(a) => write_pod(writer, a),
        DenseArray::U64(a) => write_pod(writer, a),
        DenseArray::F32(a) => write_pod(writer, a),
        DenseArray::F64(a) => write_pod(writer, a),
        DenseArray::Bool(a) => write_bits(writer, a),
        DenseArray::String(a) => write_strings(writer, a),
    }
}

fn write_pod<T: Pod, W: Write>(writer: &mut W, array: &ArrayD<T>) -> Result<()> {
    match array.as_slice() {
        Some(slice) => writer.write_all(bytemuck::cast_slice(slice))?,
        None => {
            for value in array.iter() {
                writer.write_all(bytemuck::bytes_of(value))?;
            }
        }
    }
    Ok(())
}

fn write_bits<W: Write>(writer: &mut W, array: &ArrayD<bool>) -> Result<()> {
    let bits: BitVec<u64, Lsb0> = array.iter().copied().collect();
    for word in bits.as_raw_slice() {
        writer.write_all(&word.to_le_bytes())?;
    }
    Ok(())
}

fn write_strings<W: Write>(writer: &mut W, array: &ArrayD<String>) -> Result<()> {
    let mut offset = 0u64;
    writer.write_all(&offset.to_le_bytes())?;
    for s in array.iter() {
        offset += s.len() as u64;
        writer.write_all(&offset.to_le_bytes())?;
    }
    for s in array.iter() {
        writer.write_all(s.as_bytes())?;
    }
    Ok(())
}

/// Read-only handle to a stored array, backed by a memory map
#[derive(Clone, Debug)]
pub struct Dataset {
    inner: Arc<StoreInner>,
    path: PathBuf,
    mmap: Arc<Mmap>,
    dtype: DType,
    shape: Vec<usize>,
    n_elements: usize,
    attrs: Attributes,
    payload_start: usize,
}

impl Dataset {
    pub(crate) fn open(inner: Arc<StoreInner>, path: PathBuf) -> Result<Self> {
        inner.check_open()?;
        let file = File::open(&path)?;
        let len = file.metadata()?.len() as usize;
        if len < PREAMBLE_LEN {
            return Err(StoreError::corrupted(&path, "truncated dataset file"));
        }
        // Files are replaced by rename, never modified in place
        let mmap = unsafe { Mmap::map(&file)? };

        if &mmap[0..8] != MAGIC {
            return Err(StoreError::corrupted(&path, "invalid dataset magic"));
        }
        let version = pod_read_unaligned::<u32>(&mmap[8..12]);
        if version > VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: version.to_string(),
                supported: VERSION.to_string(),
            });
        }
        let header_len = pod_read_unaligned::<u32>(&mmap[12..16]) as usize;
        let header_end = PREAMBLE_LEN + header_len;
        if header_end > mmap.len() {
            return Err(StoreError::corrupted(&path, "dataset header past end of file"));
        }
        let header: RawHeader = serde_json::from_slice(&mmap[PREAMBLE_LEN..header_end])
            .map_err(|e| StoreError::corrupted(&path, format!("bad dataset header: {e}")))?;
        let dtype: DType = header.dtype.parse()?;
        let n_elements = header
            .shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                StoreError::type_mismatch(format!(
                    "{}: shape {:?} overflows the element count",
                    path.display(),
                    header.shape
                ))
            })?;

        let dataset = Self {
            inner,
            path,
            mmap: Arc::new(mmap),
            dtype,
            shape: header.shape,
            n_elements,
            attrs: header.attrs,
            payload_start: header_end + padding(header_end),
        };
        dataset.check_payload_len()?;
        Ok(dataset)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total number of elements
    pub fn len(&self) -> usize {
        self.n_elements
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn payload(&self) -> &[u8] {
        &self.mmap[self.payload_start.min(self.mmap.len())..]
    }

    fn inconsistent(&self, message: impl Into<String>) -> StoreError {
        StoreError::type_mismatch(format!(
            "{}: {}",
            self.path.display(),
            message.into()
        ))
    }

    fn check_payload_len(&self) -> Result<()> {
        let n = self.len();
        let available = self.payload().len();
        let overflow =
            || self.inconsistent(format!("payload size of shape {:?} overflows", self.shape));
        let required = match self.dtype {
            DType::Bool => n.div_ceil(64).checked_mul(8).ok_or_else(overflow)?,
            DType::String => {
                let table = n
                    .checked_add(1)
                    .and_then(|m| m.checked_mul(8))
                    .ok_or_else(overflow)?;
                if available < table {
                    return Err(self.inconsistent("string offset table truncated"));
                }
                let last = pod_read_unaligned::<u64>(&self.payload()[table - 8..table]);
                usize::try_from(last)
                    .ok()
                    .and_then(|last| table.checked_add(last))
                    .ok_or_else(overflow)?
            }
            numeric => n
                .checked_mul(numeric.byte_width().unwrap_or(0))
                .ok_or_else(overflow)?,
        };
        if available < required {
            return Err(self.inconsistent(format!(
                "payload has {available} bytes, shape {:?} of {} needs {required}",
                self.shape, self.dtype
            )));
        }
        Ok(())
    }

    /// Decode the whole array
    pub fn read(&self) -> Result<DenseArray> {
        self.inner.check_open()?;
        self.read_elements(0..self.len(), self.shape.clone())
    }

    /// Decode a contiguous range of rows (first-axis positions)
    pub fn read_rows(&self, rows: Range<usize>) -> Result<DenseArray> {
        self.inner.check_open()?;
        let n_rows = *self.shape.first().ok_or_else(|| {
            StoreError::shape_mismatch("cannot slice rows of a 0-d dataset")
        })?;
        if rows.start > rows.end || rows.end > n_rows {
            return Err(StoreError::OutOfBounds {
                index: rows.end,
                len: n_rows,
            });
        }
        let stride: usize = self.shape[1..].iter().product();
        let mut shape = self.shape.clone();
        shape[0] = rows.len();
        self.read_elements(rows.start * stride..rows.end * stride, shape)
    }

    /// Decode the rows at `positions`, in that order; consecutive runs are read together
    pub fn read_row_indices(&self, positions: &[usize]) -> Result<DenseArray> {
        let mut parts = consecutive_runs(positions)
            .into_iter()
            .map(|run| self.read_rows(run))
            .collect::<Result<Vec<_>>>()?;
        match parts.len() {
            0 => self.read_rows(0..0),
            1 => parts.pop().ok_or_else(|| StoreError::shape_mismatch("empty read")),
            _ => DenseArray::concat_rows(&parts),
        }
    }

    fn read_elements(&self, range: Range<usize>, shape: Vec<usize>) -> Result<DenseArray> {
        let payload = self.payload();
        match self.dtype {
            DType::Int8 => self.decode_pod::<i8>(payload, range, &shape),
            DType::Int16 => self.decode_pod::<i16>(payload, range, &shape),
            DType::Int32 => self.decode_pod::<i32>(payload, range, &shape),
            DType::Int64 => self.decode_pod::<i64>(payload, range, &shape),
            DType::UInt8 => self.decode_pod::<u8>(payload, range, &shape),
            DType::UInt16 => self.decode_pod::<u16>(payload, range, &shape),
            DType::UInt32 => self.decode_pod::<u32>(payload, range, &shape),
            DType::UInt64 => self.decode_pod::<u64>(payload, range, &shape),
            DType::Float32 => self.decode_pod::<f32>(payload, range, &shape),
            DType::Float64 => self.decode_pod::<f64>(payload, range, &shape),
            DType::Bool => self.decode_bits(payload, range, &shape),
            DType::String => self.decode_strings(payload, range, &shape),
        }
    }

    fn decode_pod<T>(&self, payload: &[u8], range: Range<usize>, shape: &[usize]) -> Result<DenseArray>
    where
        T: Pod + crate::data::ArrayType,
    {
        let width = size_of::<T>();
        let bytes = &payload[range.start * width..range.end * width];
        let values: Vec<T> = match bytemuck::try_cast_slice::<u8, T>(bytes) {
            Ok(aligned) => aligned.to_vec(),
            Err(_) => bytes.chunks_exact(width).map(pod_read_unaligned).collect(),
        };
        DenseArray::from_shape_vec(shape, values).map_err(|e| self.inconsistent(e.to_string()))
    }

    fn decode_bits(&self, payload: &[u8], range: Range<usize>, shape: &[usize]) -> Result<DenseArray> {
        let first_word = range.start / 64;
        let last_word = range.end.div_ceil(64);
        let words: Vec<u64> = payload[first_word * 8..last_word * 8]
            .chunks_exact(8)
            .map(pod_read_unaligned)
            .collect();
        let bits = BitVec::<u64, Lsb0>::from_vec(words);
        let offset = first_word * 64;
        let values: Vec<bool> = bits[range.start - offset..range.end - offset]
            .iter()
            .by_vals()
            .collect();
        DenseArray::from_shape_vec(shape, values).map_err(|e| self.inconsistent(e.to_string()))
    }

    fn decode_strings(
        &self,
        payload: &[u8],
        range: Range<usize>,
        shape: &[usize],
    ) -> Result<DenseArray> {
        let n = self.len();
        let table_end = (n + 1) * 8;
        let offsets: Vec<usize> = payload[range.start * 8..(range.end + 1) * 8]
            .chunks_exact(8)
            .map(|c| pod_read_unaligned::<u64>(c) as usize)
            .collect();
        let text = &payload[table_end..];
        let mut values = Vec::with_capacity(range.len());
        for w in offsets.windows(2) {
            let (start, end) = (w[0], w[1]);
            if start > end || end > text.len() {
                return Err(self.inconsistent("string offsets out of order"));
            }
            let s = std::str::from_utf8(&text[start..end])
                .map_err(|e| self.inconsistent(format!("invalid UTF-8: {e}")))?;
            values.push(s.to_string());
        }
        DenseArray::from_shape_vec(shape, values).map_err(|e| self.inconsistent(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenMode;
    use crate::io::store::{Node, Store};
    use ndarray::array;
    use serde_json::json;

    fn roundtrip(array: &DenseArray) -> (tempfile::TempDir, Dataset) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(dir.path().join("s"), false).unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("encoding-type".into(), json!("array"));
        store.root().write_array("a", array, &attrs).unwrap();
        store.close().unwrap();
        let store = Store::open(dir.path().join("s"), OpenMode::ReadOnly, false).unwrap();
        let ds = store.root().dataset("a").unwrap();
        assert_eq!(ds.attrs(), &attrs);
        assert_eq!(&ds.read().unwrap(), array);
        (dir, ds)
    }

    #[test]
    fn test_consecutive_runs() {
        assert_eq!(consecutive_runs(&[3, 4, 5, 0, 1, 7]), vec![3..6, 0..2, 7..8]);
        assert!(consecutive_runs(&[]).is_empty());
    }

    #[test]
    fn test_numeric_roundtrip_and_rows() {
        let a = DenseArray::from(array![[1.5f64, 2.0, f64::NAN], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]);
        let (_dir, ds) = roundtrip(&a);
        assert_eq!(ds.dtype(), DType::Float64);
        assert_eq!(ds.read_rows(1..3).unwrap(), a.slice_rows(1..3).unwrap());
        assert_eq!(ds.read_row_indices(&[2, 0, 1]).unwrap(), a.take_rows(&[2, 0, 1]).unwrap());
        assert_eq!(ds.read_rows(3..3).unwrap().shape(), &[0, 3]);
    }

    #[test]
    fn test_bool_roundtrip_across_words() {
        let values: Vec<bool> = (0..150).map(|i| i % 3 == 0).collect();
        let a = DenseArray::from(values.clone());
        let (_dir, ds) = roundtrip(&a);
        let expected = DenseArray::from(values[63..131].to_vec());
        assert_eq!(ds.read_rows(63..131).unwrap(), expected);
    }

    #[test]
    fn test_string_roundtrip() {
        let a = DenseArray::from(vec!["", "héllo", "world", ""]);
        let (_dir, ds) = roundtrip(&a);
        assert_eq!(ds.read_rows(1..3).unwrap(), DenseArray::from(vec!["héllo", "world"]));
    }

    #[test]
    fn test_empty_and_zero_dim() {
        roundtrip(&DenseArray::zeros(DType::UInt16, &[0, 4]));
        roundtrip(&DenseArray::from(vec![String::new(); 0]));
        let scalar = crate::data::Scalar::from(3i8).into_array();
        let (_dir, ds) = roundtrip(&scalar);
        assert!(ds.read_rows(0..1).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(dir.path().join("s"), false).unwrap();
        store
            .root()
            .write_array("a", &DenseArray::from(vec![1u32, 2, 3, 4]), &Attributes::new())
            .unwrap();
        let path = dir.path().join("s").join("a");
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(matches!(
            store.root().node("a"),
            Err(StoreError::TypeMismatch { .. })
        ));

        std::fs::write(&path, b"not a dataset file").unwrap();
        let err = store.root().node("a").unwrap_err();
        assert!(err.is_io());
        assert!(!matches!(store.root().node("zzz"), Ok(Some(Node::Dataset(_)))));
    }

    /// Rewrite the header of a stored dataset, keeping its payload
    fn rewrite_header(path: &Path, edit: impl FnOnce(&mut RawHeader)) {
        let bytes = std::fs::read(path).unwrap();
        let header_len = pod_read_unaligned::<u32>(&bytes[12..16]) as usize;
        let header_end = PREAMBLE_LEN + header_len;
        let mut header: RawHeader = serde_json::from_slice(&bytes[PREAMBLE_LEN..header_end]).unwrap();
        let payload = bytes[header_end + padding(header_end)..].to_vec();
        edit(&mut header);

        let json = serde_json::to_vec(&header).unwrap();
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(&json);
        out.extend(std::iter::repeat_n(0u8, padding(PREAMBLE_LEN + json.len())));
        out.extend_from_slice(&payload);
        std::fs::write(path, out).unwrap();
    }

    #[test]
    fn test_overflowing_header_shape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(dir.path().join("s"), false).unwrap();
        let root = store.root();
        let path = dir.path().join("s");
        for (name, array) in [
            ("f", DenseArray::from(vec![1.0f64, 2.0])),
            ("b", DenseArray::from(vec![true, false])),
            ("s", DenseArray::from(vec!["x", "y"])),
        ] {
            root.write_array(name, &array, &Attributes::new()).unwrap();
            rewrite_header(&path.join(name), |h| h.shape = vec![usize::MAX / 2, 4]);
            assert!(matches!(root.node(name), Err(StoreError::TypeMismatch { .. })));

            root.write_array(name, &array, &Attributes::new()).unwrap();
            rewrite_header(&path.join(name), |h| h.shape = vec![usize::MAX / 4]);
            assert!(matches!(root.node(name), Err(StoreError::TypeMismatch { .. })));
        }
    }

    #[test]
    fn test_header_rewrite_keeps_valid_file_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(dir.path().join("s"), false).unwrap();
        let root = store.root();
        root.write_array("a", &DenseArray::from(vec![1u16, 2, 3, 4]), &Attributes::new())
            .unwrap();
        rewrite_header(&dir.path().join("s").join("a"), |h| h.shape = vec![2, 2]);
        let ds = root.dataset("a").unwrap();
        assert_eq!(ds.read().unwrap().shape(), &[2, 2]);
    }
}
