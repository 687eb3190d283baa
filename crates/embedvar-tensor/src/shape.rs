//! Shape utilities for host tensors and bundle records.
//!
//! Embedding storage only ever deals with rank-1 vectors (default values,
//! keys, versions) and rank-2 matrices (`[num_keys, value_len]` value blocks),
//! so [`Shape`] stays deliberately small.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The dimensions of a tensor or an exported record.
///
/// # Examples
///
/// ```
/// use embedvar_tensor::Shape;
///
/// let shape = Shape::matrix(5, 8);
/// assert_eq!(shape.ndim(), 2);
/// assert_eq!(shape.numel(), 40);
/// assert_eq!(shape.dim(1), Some(8));
/// ```
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Creates a new shape from the given dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    /// Creates a rank-1 shape.
    pub fn vector(len: usize) -> Self {
        Self { dims: vec![len] }
    }

    /// Creates a rank-2 shape.
    pub fn matrix(rows: usize, cols: usize) -> Self {
        Self {
            dims: vec![rows, cols],
        }
    }

    /// Returns the number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Returns the number of elements described by this shape.
    ///
    /// A `[0, value_len]` block is empty.
    ///
    /// ```
    /// use embedvar_tensor::Shape;
    ///
    /// assert_eq!(Shape::matrix(0, 8).numel(), 0);
    /// ```
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Returns the dimensions as a slice.
    pub fn as_slice(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the size of dimension `axis`, or `None` if the rank is smaller.
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(usize::to_string).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self::new(dims)
    }
}
