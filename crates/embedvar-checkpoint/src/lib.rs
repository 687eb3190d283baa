//! Checkpoint bundles for embedvar stores.
//!
//! This crate provides functionality for:
//!
//! - **Export**: Walk a store snapshot and stream its keys, values and
//!   versions into a named-record bundle
//! - **Restore**: Read those records back and bulk-load them into a store,
//!   optionally re-sharded over a different partition count
//!
//! # Core Components
//!
//! - [`BundleWriter`]: Trait for sinks that accept named, typed records
//! - [`FileBundleWriter`] / [`BundleReader`]: The on-disk bundle format
//! - [`SnapshotExporter`]: Dumps one store (or a partitioned set) into a bundle
//! - [`RestoredEmbedding`]: The four records of one prefix, validated
//!
//! # Record Layout
//!
//! Every dumped prefix `<p>` produces four records:
//!
//! | Record                  | Shape                        |
//! |-------------------------|------------------------------|
//! | `<p>-keys`              | `[n]`                        |
//! | `<p>-partition_offset`  | `[SAVED_PARTITION_NUM + 1]`  |
//! | `<p>-values`            | `[n, value_len]`             |
//! | `<p>-versions`          | `[n]`                        |
//!
//! # Example
//!
//! ```no_run
//! use embedvar_checkpoint::{restore_full, BundleReader, FileBundleWriter, SnapshotExporter};
//! use embedvar_hash_table::{EmbeddingConfig, StoreOptions, UninitializedStore};
//! use embedvar_tensor::HostTensor;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = UninitializedStore::<i64, f32>::primary(
//!         EmbeddingConfig::new("item_emb"),
//!         StoreOptions::default(),
//!     )?
//!     .initialize(&HostTensor::vector(vec![0.0f32; 8]))?;
//!     store.lookup_or_create(&42, Some(1))?;
//!
//!     let mut writer = FileBundleWriter::create("/tmp/ckpt/model")?;
//!     SnapshotExporter::new().dump(&store, "item_emb/part_0", &mut writer)?;
//!     writer.finish()?;
//!
//!     let reader = BundleReader::open("/tmp/ckpt/model")?;
//!     restore_full(&reader, "item_emb/part_0", &store)?;
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod exporter;
pub mod restore;

pub use bundle::{
    bundle_paths, BundleIndex, BundleReader, BundleWriter, FileBundleWriter, RecordEntry,
    RecordKind, BUNDLE_FORMAT_VERSION,
};
pub use exporter::{partition_prefix, record_name, ExportSummary, SnapshotExporter};
pub use restore::{restore_full, restore_partitioned, RestoredEmbedding};

use std::path::PathBuf;
use thiserror::Error;

/// Number of logical sub-partitions described by a `partition_offset` record.
pub const SAVED_PARTITION_NUM: usize = 1000;

/// Errors that can occur during checkpoint operations.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// I/O error during checkpoint operations.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Bundle file or record not found.
    #[error("Checkpoint not found: {0}")]
    NotFound(PathBuf),

    /// Error during serialization.
    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Error during deserialization.
    #[error("Deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Bundle format version mismatch.
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected version.
        expected: u32,
        /// Found version.
        found: u32,
    },

    /// A named record is absent from the bundle.
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Corrupted checkpoint data.
    #[error("Corrupted checkpoint: {0}")]
    Corrupted(String),

    /// Invalid argument or writer state.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The store rejected an export or import.
    #[error("Store error: {0}")]
    Store(#[from] embedvar_hash_table::HashTableError),
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

#[cfg(test)]
mod tests {
    use super::*;
    use embedvar_hash_table::{EmbeddingConfig, StoreOptions, UninitializedStore};
    use embedvar_tensor::HostTensor;
    use tempfile::tempdir;

    #[test]
    fn test_end_to_end_dump_and_restore() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("model");
        let source = UninitializedStore::<i64, f32>::primary(EmbeddingConfig::new("emb"), StoreOptions::default())
            .unwrap()
            .initialize(&HostTensor::vector(vec![0.0f32; 4]))
            .unwrap();
        for key in [3i64, 1001, -7] {
            source
                .lookup_or_create(&key, Some(key.abs()))
                .unwrap()
                .copy_from(&[key as f32; 4]);
        }

        let mut writer = FileBundleWriter::create(&base).unwrap();
        let summary = SnapshotExporter::new().dump(&source, "emb/part_0", &mut writer).unwrap();
        assert_eq!(summary.keys, 3);
        writer.finish().unwrap();

        let target = UninitializedStore::<i64, f32>::primary(EmbeddingConfig::new("emb"), StoreOptions::default())
            .unwrap()
            .initialize(&HostTensor::vector(vec![9.0f32; 4]))
            .unwrap();
        let reader = BundleReader::open(&base).unwrap();
        let imported = restore_full(&reader, "emb/part_0", &target).unwrap();
        assert_eq!(imported.imported, 3);
        for key in [3i64, 1001, -7] {
            let view = target.find(&key).unwrap().unwrap();
            assert_eq!(view.to_vec(), vec![key as f32; 4]);
            assert_eq!(view.version(), Some(key.abs()));
        }
    }

    #[test]
    fn test_error_handling() {
        let err = BundleReader::open("/nonexistent/bundle").expect_err("opening a missing bundle should fail");
        assert!(
            matches!(
                &err,
                CheckpointError::NotFound(path)
                    if path.to_str().is_some_and(|p| p.contains("nonexistent"))
            ),
            "expected NotFound with the missing path, got: {err:?}"
        );
    }
}
