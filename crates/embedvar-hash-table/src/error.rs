//! Error types for embedding store operations.

use thiserror::Error;

/// Errors that can occur during key index and embedding store operations.
#[derive(Error, Debug)]
pub enum HashTableError {
    /// A configuration or input value is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A vector buffer has the wrong length for the store's value width.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected number of elements.
        expected: usize,
        /// Actual number of elements provided.
        actual: usize,
    },

    /// The requested key is not present.
    #[error("key {key} not found")]
    NotFound {
        /// Debug rendering of the missing key.
        key: String,
    },

    /// The key is already present and the operation does not overwrite.
    #[error("key {key} already exists")]
    AlreadyExists {
        /// Debug rendering of the existing key.
        key: String,
    },

    /// A non-primary embedding part outlived the primary that owns the index.
    #[error("embedding '{name}' is detached: its primary part has been destroyed")]
    Detached {
        /// Name of the detached embedding.
        name: String,
    },

    /// The tiered (disk) backend failed.
    #[error("tiered storage error: {message}")]
    Tier {
        /// Description of the backend failure.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl HashTableError {
    /// Builds a [`HashTableError::Tier`] from any displayable backend error.
    pub(crate) fn tier(err: impl std::fmt::Display) -> Self {
        Self::Tier {
            message: err.to_string(),
        }
    }
}

impl From<embedvar_tensor::TensorError> for HashTableError {
    fn from(err: embedvar_tensor::TensorError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

/// A specialized Result type for hash table operations.
pub type Result<T> = std::result::Result<T, HashTableError>;
