//! Host tensor and element types for embedvar.
//!
//! This crate provides the small typed-buffer vocabulary the embedding store
//! works with: a runtime [`DType`] tag, the [`Element`] trait implemented by
//! every supported value type, a [`Shape`], and [`HostTensor`], an owned dense
//! buffer used to hand default vectors and restore data across API
//! boundaries where the element type is only known at runtime.
//!
//! # Example
//!
//! ```rust
//! use embedvar_tensor::{DType, Element, HostTensor, Shape};
//!
//! let values = HostTensor::from_vec(vec![1.0f32; 16], Shape::matrix(2, 8)).unwrap();
//! assert_eq!(values.dtype(), DType::F32);
//! assert_eq!(values.shape().dim(1), Some(8));
//! assert_eq!(<f32 as Element>::DTYPE, DType::F32);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod shape;
pub mod tensor;

pub use shape::Shape;
pub use tensor::{decode_slice, encode_slice, DType, Element, HostTensor, TensorData};

/// Errors raised when a host buffer does not fit its declared layout.
#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    /// Buffer length disagrees with the declared shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Dimensions that were declared.
        expected: Vec<usize>,
        /// Dimensions implied by the buffer.
        got: Vec<usize>,
    },

    /// Encoded bytes cannot form whole elements.
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// The buffer holds a different element type than requested.
    #[error("DType mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        /// Requested element type.
        expected: DType,
        /// Element type actually stored.
        got: DType,
    },

    /// A single element failed to decode.
    #[error("{0}")]
    Other(String),
}

/// Result type for tensor operations.
pub type TensorResult<T> = Result<T, TensorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_error_display() {
        let err = TensorError::ShapeMismatch {
            expected: vec![5],
            got: vec![5, 8],
        };
        assert_eq!(err.to_string(), "Shape mismatch: expected [5], got [5, 8]");

        let err = TensorError::DTypeMismatch {
            expected: DType::F32,
            got: DType::F64,
        };
        assert_eq!(
            err.to_string(),
            "DType mismatch: expected float32, got float64"
        );
    }
}
