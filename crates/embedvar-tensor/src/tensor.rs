//! Element types and the owned host tensor used at the storage boundary.
//!
//! The storage engine is generic over its value type through [`Element`].
//! [`HostTensor`] is the dynamically typed container callers hand in when the
//! element type is only known at runtime (default vectors, restore inputs),
//! so the store can validate rank and dtype before touching any memory.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::shape::Shape;
use crate::{TensorError, TensorResult};

/// Data types supported by embedding values.
///
/// # Examples
///
/// ```
/// use embedvar_tensor::DType;
///
/// assert_eq!(DType::F32.size_in_bytes(), 4);
/// assert_eq!(DType::I64.name(), "int64");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point.
    F32,
    /// 64-bit floating point.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
}

impl DType {
    /// Returns the size of this data type in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I32 => 4,
            DType::I64 => 8,
        }
    }

    /// Returns a human-readable name for this data type.
    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::I32 => "int32",
            DType::I64 => "int64",
        }
    }

    /// Returns whether this is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A scalar type that can live inside an embedding vector.
///
/// Implemented for `f32`, `f64`, `i32` and `i64`. The byte encoding is
/// always little-endian so exported bundles are portable.
pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// The runtime tag for this type.
    const DTYPE: DType;

    /// Appends the little-endian encoding of `self` to `out`.
    fn write_le(&self, out: &mut Vec<u8>);

    /// Decodes one value; `bytes` must be exactly `DTYPE.size_in_bytes()` long.
    fn read_le(bytes: &[u8]) -> Option<Self>;

    /// Wraps an owned buffer into the matching [`TensorData`] variant.
    fn wrap(data: Vec<Self>) -> TensorData;

    /// Borrows the buffer if `data` holds this element type.
    fn view(data: &TensorData) -> Option<&[Self]>;
}

macro_rules! impl_element {
    ($t:ty, $dtype:expr, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = $dtype;

            #[inline]
            fn write_le(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn read_le(bytes: &[u8]) -> Option<Self> {
                bytes.try_into().ok().map(<$t>::from_le_bytes)
            }

            fn wrap(data: Vec<Self>) -> TensorData {
                TensorData::$variant(data)
            }

            fn view(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(values) => Some(values),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(f32, DType::F32, F32);
impl_element!(f64, DType::F64, F64);
impl_element!(i32, DType::I32, I32);
impl_element!(i64, DType::I64, I64);

/// Encodes a slice of elements as contiguous little-endian bytes.
pub fn encode_slice<T: Element>(values: &[T], out: &mut Vec<u8>) {
    out.reserve(values.len() * T::DTYPE.size_in_bytes());
    for value in values {
        value.write_le(out);
    }
}

/// Decodes contiguous little-endian bytes into elements.
///
/// Fails if the byte length is not a multiple of the element size.
pub fn decode_slice<T: Element>(bytes: &[u8]) -> TensorResult<Vec<T>> {
    let width = T::DTYPE.size_in_bytes();
    if bytes.len() % width != 0 {
        return Err(TensorError::InvalidShape(format!(
            "{} bytes is not a whole number of {} elements",
            bytes.len(),
            T::DTYPE
        )));
    }
    bytes
        .chunks_exact(width)
        .map(|chunk| {
            T::read_le(chunk).ok_or_else(|| TensorError::Other("short element read".to_string()))
        })
        .collect()
}

/// Type-tagged storage for a [`HostTensor`].
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// `f32` buffer.
    F32(Vec<f32>),
    /// `f64` buffer.
    F64(Vec<f64>),
    /// `i32` buffer.
    I32(Vec<i32>),
    /// `i64` buffer.
    I64(Vec<i64>),
}

impl TensorData {
    /// Returns the runtime element type.
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
        }
    }

    /// Returns the number of stored elements.
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    /// Returns `true` if no elements are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An owned, dense, row-major tensor living in host memory.
///
/// # Examples
///
/// ```
/// use embedvar_tensor::{DType, HostTensor};
///
/// let default_value = HostTensor::vector(vec![9.0f32; 8]);
/// assert_eq!(default_value.dtype(), DType::F32);
/// assert_eq!(default_value.shape().as_slice(), &[8]);
/// assert_eq!(default_value.as_slice::<f32>().unwrap()[0], 9.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Shape,
    data: TensorData,
}

impl HostTensor {
    /// Creates a tensor from an owned buffer and a shape.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::ShapeMismatch`] if the buffer length differs
    /// from the number of elements the shape describes.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: impl Into<Shape>) -> TensorResult<Self> {
        let shape = shape.into();
        if shape.numel() != data.len() {
            return Err(TensorError::ShapeMismatch {
                expected: shape.as_slice().to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Self {
            shape,
            data: T::wrap(data),
        })
    }

    /// Creates a rank-1 tensor.
    pub fn vector<T: Element>(data: Vec<T>) -> Self {
        Self {
            shape: Shape::vector(data.len()),
            data: T::wrap(data),
        }
    }

    /// Creates a tensor where every element is `value`.
    pub fn filled<T: Element>(value: T, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let data = vec![value; shape.numel()];
        Self {
            shape,
            data: T::wrap(data),
        }
    }

    /// Returns the shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the element type.
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Returns the rank.
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Returns the number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Returns the underlying tagged buffer.
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Borrows the elements as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::DTypeMismatch`] if the tensor holds another type.
    pub fn as_slice<T: Element>(&self) -> TensorResult<&[T]> {
        T::view(&self.data).ok_or(TensorError::DTypeMismatch {
            expected: T::DTYPE,
            got: self.dtype(),
        })
    }

    /// Returns the little-endian byte encoding of all elements.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.data {
            TensorData::F32(v) => encode_slice(v, &mut out),
            TensorData::F64(v) => encode_slice(v, &mut out),
            TensorData::I32(v) => encode_slice(v, &mut out),
            TensorData::I64(v) => encode_slice(v, &mut out),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_properties() {
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::I32.to_string(), "int32");
        assert!(DType::F32.is_float());
        assert!(!DType::I64.is_float());
    }

    #[test]
    fn test_from_vec_checks_numel() {
        let ok = HostTensor::from_vec(vec![1.0f32; 6], Shape::matrix(2, 3)).unwrap();
        assert_eq!(ok.ndim(), 2);
        assert_eq!(ok.numel(), 6);

        let err = HostTensor::from_vec(vec![1.0f32; 5], Shape::matrix(2, 3)).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_as_slice_dtype_mismatch() {
        let t = HostTensor::vector(vec![10i64; 4]);
        assert_eq!(t.as_slice::<i64>().unwrap(), &[10, 10, 10, 10]);
        let err = t.as_slice::<f32>().unwrap_err();
        assert!(matches!(
            err,
            TensorError::DTypeMismatch {
                expected: DType::F32,
                got: DType::I64
            }
        ));
    }

    #[test]
    fn test_encode_decode_is_little_endian() {
        let mut bytes = Vec::new();
        encode_slice(&[1i32, -2], &mut bytes);
        assert_eq!(bytes, vec![1, 0, 0, 0, 0xfe, 0xff, 0xff, 0xff]);
        assert_eq!(decode_slice::<i32>(&bytes).unwrap(), vec![1, -2]);
    }

    #[test]
    fn test_decode_rejects_partial_elements() {
        assert!(decode_slice::<f64>(&[0u8; 12]).is_err());
        assert!(decode_slice::<f64>(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_filled_tensor() {
        let t = HostTensor::filled(0.5f64, Shape::matrix(2, 2));
        assert_eq!(t.as_slice::<f64>().unwrap(), &[0.5; 4]);
        assert_eq!(t.to_le_bytes().len(), 32);
    }
}
