//! # Element Types
//!
//! The closed set of element types a stored value may carry, the
//! `ArrayType` trait tying each Rust type to its tag and `DenseArray`
//! variant, and the `Scalar` value.
//!
//! Dtype tags map 1:1 to the strings written into dataset headers
//! (`int8` .. `uint64`, `float32`, `float64`, `bool`, `string`).

use std::fmt;
use std::str::FromStr;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::config::FillPolicy;
use crate::data::array::DenseArray;
use crate::error::StoreError;

/// Element type tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    String,
}

impl DType {
    /// Every numeric and bool dtype (the sparse-capable set)
    pub const NUMERIC_AND_BOOL: [DType; 11] = [
        DType::Int8,
        DType::Int16,
        DType::Int32,
        DType::Int64,
        DType::UInt8,
        DType::UInt16,
        DType::UInt32,
        DType::UInt64,
        DType::Float32,
        DType::Float64,
        DType::Bool,
    ];

    /// On-disk tag
    pub fn as_str(self) -> &'static str {
        match self {
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Bool => "bool",
            DType::String => "string",
        }
    }

    /// Byte width of fixed-width numeric dtypes
    pub fn byte_width(self) -> Option<usize> {
        match self {
            DType::Int8 | DType::UInt8 => Some(1),
            DType::Int16 | DType::UInt16 => Some(2),
            DType::Int32 | DType::UInt32 | DType::Float32 => Some(4),
            DType::Int64 | DType::UInt64 | DType::Float64 => Some(8),
            DType::Bool | DType::String => None,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DType::Int8
                | DType::Int16
                | DType::Int32
                | DType::Int64
                | DType::UInt8
                | DType::UInt16
                | DType::UInt32
                | DType::UInt64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "int8" => DType::Int8,
            "int16" => DType::Int16,
            "int32" => DType::Int32,
            "int64" => DType::Int64,
            "uint8" => DType::UInt8,
            "uint16" => DType::UInt16,
            "uint32" => DType::UInt32,
            "uint64" => DType::UInt64,
            "float32" => DType::Float32,
            "float64" => DType::Float64,
            "bool" => DType::Bool,
            "string" => DType::String,
            other => {
                return Err(StoreError::type_mismatch(format!(
                    "unknown dtype tag `{other}`"
                )))
            }
        })
    }
}

/// A single typed value
#[derive(Clone, Debug)]
pub enum Scalar {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
}

impl Scalar {
    pub fn dtype(&self) -> DType {
        match self {
            Scalar::I8(_) => DType::Int8,
            Scalar::I16(_) => DType::Int16,
            Scalar::I32(_) => DType::Int32,
            Scalar::I64(_) => DType::Int64,
            Scalar::U8(_) => DType::UInt8,
            Scalar::U16(_) => DType::UInt16,
            Scalar::U32(_) => DType::UInt32,
            Scalar::U64(_) => DType::UInt64,
            Scalar::F32(_) => DType::Float32,
            Scalar::F64(_) => DType::Float64,
            Scalar::Bool(_) => DType::Bool,
            Scalar::String(_) => DType::String,
        }
    }

    /// Wrap into a 0-d array
    pub fn into_array(self) -> DenseArray {
        fn zero_d<T: ArrayType>(v: T) -> DenseArray {
            T::wrap(ArrayD::from_elem(ndarray::IxDyn(&[]), v))
        }
        match self {
            Scalar::I8(v) => zero_d(v),
            Scalar::I16(v) => zero_d(v),
            Scalar::I32(v) => zero_d(v),
            Scalar::I64(v) => zero_d(v),
            Scalar::U8(v) => zero_d(v),
            Scalar::U16(v) => zero_d(v),
            Scalar::U32(v) => zero_d(v),
            Scalar::U64(v) => zero_d(v),
            Scalar::F32(v) => zero_d(v),
            Scalar::F64(v) => zero_d(v),
            Scalar::Bool(v) => zero_d(v),
            Scalar::String(v) => zero_d(v),
        }
    }

    /// Extract a typed value
    pub fn get<T: ArrayType>(&self) -> Option<T> {
        T::from_scalar(self)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::I8(a), Scalar::I8(b)) => a == b,
            (Scalar::I16(a), Scalar::I16(b)) => a == b,
            (Scalar::I32(a), Scalar::I32(b)) => a == b,
            (Scalar::I64(a), Scalar::I64(b)) => a == b,
            (Scalar::U8(a), Scalar::U8(b)) => a == b,
            (Scalar::U16(a), Scalar::U16(b)) => a == b,
            (Scalar::U32(a), Scalar::U32(b)) => a == b,
            (Scalar::U64(a), Scalar::U64(b)) => a == b,
            (Scalar::F32(a), Scalar::F32(b)) => a.nan_eq(b),
            (Scalar::F64(a), Scalar::F64(b)) => a.nan_eq(b),
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::String(a), Scalar::String(b)) => a == b,
            _ => false,
        }
    }
}

/// Rust types that can be stored as array elements.
///
/// Sealed: the twelve implementors correspond exactly to the `DType` tags.
pub trait ArrayType: Clone + fmt::Debug + Send + Sync + private::Sealed + 'static {
    /// Tag for this type
    const DTYPE: DType;

    /// Wrap a typed array into the matching `DenseArray` variant
    fn wrap(array: ArrayD<Self>) -> DenseArray;

    /// Unwrap the matching variant, handing the array back on mismatch
    fn unwrap(array: DenseArray) -> std::result::Result<ArrayD<Self>, DenseArray>;

    /// Borrow the matching variant
    fn unwrap_ref(array: &DenseArray) -> Option<&ArrayD<Self>>;

    /// Outer-join fill value
    fn fill_value(policy: &FillPolicy) -> Self;

    /// Equality with NaN == NaN
    fn nan_eq(&self, other: &Self) -> bool;

    /// Whether this value is the implicit value of a sparse matrix
    fn is_zero(&self) -> bool;

    fn into_scalar(self) -> Scalar;

    fn from_scalar(scalar: &Scalar) -> Option<Self>;
}

mod private {
    pub trait Sealed {}
}

macro_rules! impl_array_type {
    ($ty:ty, $variant:ident, $dtype:ident, |$p:ident| $fill:expr, |$a:ident, $b:ident| $eq:expr, |$z:ident| $zero:expr) => {
        impl private::Sealed for $ty {}

        impl ArrayType for $ty {
            const DTYPE: DType = DType::$dtype;

            fn wrap(array: ArrayD<Self>) -> DenseArray {
                DenseArray::$variant(array)
            }

            fn unwrap(array: DenseArray) -> std::result::Result<ArrayD<Self>, DenseArray> {
                match array {
                    DenseArray::$variant(a) => Ok(a),
                    other => Err(other),
                }
            }

            fn unwrap_ref(array: &DenseArray) -> Option<&ArrayD<Self>> {
                match array {
                    DenseArray::$variant(a) => Some(a),
                    _ => None,
                }
            }

            fn fill_value($p: &FillPolicy) -> Self {
                $fill
            }

            fn nan_eq(&self, other: &Self) -> bool {
                let ($a, $b) = (self, other);
                $eq
            }

            fn is_zero(&self) -> bool {
                let $z = self;
                $zero
            }

            fn into_scalar(self) -> Scalar {
                Scalar::$variant(self)
            }

            fn from_scalar(scalar: &Scalar) -> Option<Self> {
                match scalar {
                    Scalar::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_array_type!(i8, I8, Int8, |p| p.integer as i8, |a, b| a == b, |z| *z == 0);
impl_array_type!(i16, I16, Int16, |p| p.integer as i16, |a, b| a == b, |z| *z == 0);
impl_array_type!(i32, I32, Int32, |p| p.integer as i32, |a, b| a == b, |z| *z == 0);
impl_array_type!(i64, I64, Int64, |p| p.integer, |a, b| a == b, |z| *z == 0);
impl_array_type!(u8, U8, UInt8, |p| p.unsigned as u8, |a, b| a == b, |z| *z == 0);
impl_array_type!(u16, U16, UInt16, |p| p.unsigned as u16, |a, b| a == b, |z| *z == 0);
impl_array_type!(u32, U32, UInt32, |p| p.unsigned as u32, |a, b| a == b, |z| *z == 0);
impl_array_type!(u64, U64, UInt64, |p| p.unsigned, |a, b| a == b, |z| *z == 0);
impl_array_type!(
    f32,
    F32,
    Float32,
    |p| p.float_value() as f32,
    |a, b| a == b || (a.is_nan() && b.is_nan()),
    |z| *z == 0.0
);
impl_array_type!(
    f64,
    F64,
    Float64,
    |p| p.float_value(),
    |a, b| a == b || (a.is_nan() && b.is_nan()),
    |z| *z == 0.0
);
impl_array_type!(bool, Bool, Bool, |p| p.boolean, |a, b| a == b, |z| !*z);
impl_array_type!(
    String,
    String,
    String,
    |p| p.string.clone(),
    |a, b| a == b,
    |z| z.is_empty()
);

macro_rules! impl_scalar_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Scalar {
                fn from(v: $ty) -> Self {
                    Scalar::$variant(v)
                }
            }
        )*
    };
}

impl_scalar_from!(
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    f32 => F32, f64 => F64, bool => Bool, String => String,
);

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::String(v.to_string())
    }
}

/// Run `$body` with `$T` bound to the Rust type of a runtime `DType`
macro_rules! with_dtype {
    ($dtype:expr, $T:ident => $body:expr) => {
        match $dtype {
            $crate::data::dtype::DType::Int8 => {
                type $T = i8;
                $body
            }
            $crate::data::dtype::DType::Int16 => {
                type $T = i16;
                $body
            }
            $crate::data::dtype::DType::Int32 => {
                type $T = i32;
                $body
            }
            $crate::data::dtype::DType::Int64 => {
                type $T = i64;
                $body
            }
            $crate::data::dtype::DType::UInt8 => {
                type $T = u8;
                $body
            }
            $crate::data::dtype::DType::UInt16 => {
                type $T = u16;
                $body
            }
            $crate::data::dtype::DType::UInt32 => {
                type $T = u32;
                $body
            }
            $crate::data::dtype::DType::UInt64 => {
                type $T = u64;
                $body
            }
            $crate::data::dtype::DType::Float32 => {
                type $T = f32;
                $body
            }
            $crate::data::dtype::DType::Float64 => {
                type $T = f64;
                $body
            }
            $crate::data::dtype::DType::Bool => {
                type $T = bool;
                $body
            }
            $crate::data::dtype::DType::String => {
                type $T = String;
                $body
            }
        }
    };
}

pub(crate) use with_dtype;
