//! Flat row buffers used to bulk-load a store during checkpoint restore.

use crate::error::{HashTableError, Result};

/// Parallel key, value and version arrays for bulk import.
///
/// Row `i` is `keys[i]`, `values[i * value_len..(i + 1) * value_len]` and
/// `versions[i]`.
///
/// ```
/// use embedvar_hash_table::RestoreBuffer;
///
/// let buffer = RestoreBuffer::new(vec![1i64, 2], vec![0.5f32; 8], vec![10, 20], 4).unwrap();
/// assert_eq!(buffer.len(), 2);
/// let (key, values, version) = buffer.row(1).unwrap();
/// assert_eq!((*key, values.len(), version), (2, 4, 20));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreBuffer<K, V> {
    keys: Vec<K>,
    values: Vec<V>,
    versions: Vec<i64>,
    value_len: usize,
}

impl<K, V> RestoreBuffer<K, V> {
    /// Builds a buffer, checking that the three arrays describe the same rows.
    pub fn new(keys: Vec<K>, values: Vec<V>, versions: Vec<i64>, value_len: usize) -> Result<Self> {
        if value_len == 0 {
            return Err(HashTableError::InvalidArgument(
                "restore buffer value_len must be positive".to_string(),
            ));
        }
        if values.len() != keys.len() * value_len {
            return Err(HashTableError::DimensionMismatch {
                expected: keys.len() * value_len,
                actual: values.len(),
            });
        }
        if versions.len() != keys.len() {
            return Err(HashTableError::DimensionMismatch {
                expected: keys.len(),
                actual: versions.len(),
            });
        }
        Ok(Self {
            keys,
            values,
            versions,
            value_len,
        })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Width of every value row.
    pub fn value_len(&self) -> usize {
        self.value_len
    }

    /// All keys.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// All values, row-major.
    pub fn values(&self) -> &[V] {
        &self.values
    }

    /// All versions.
    pub fn versions(&self) -> &[i64] {
        &self.versions
    }

    /// Returns row `i`.
    pub fn row(&self, i: usize) -> Option<(&K, &[V], i64)> {
        let key = self.keys.get(i)?;
        let start = i * self.value_len;
        let values = self.values.get(start..start + self.value_len)?;
        Some((key, values, self.versions[i]))
    }
}

/// Outcome of a bulk import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Rows written into the store.
    pub imported: usize,
    /// Rows skipped because the key (or this part of it) already existed.
    pub skipped_existing: usize,
    /// Rows skipped because they belong to another partition.
    pub skipped_partition: usize,
}

impl ImportSummary {
    /// Rows examined.
    pub fn total(&self) -> usize {
        self.imported + self.skipped_existing + self.skipped_partition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_buffer_validates_lengths() {
        assert!(RestoreBuffer::new(vec![1i64], vec![0.0f32; 3], vec![0], 4).is_err());
        assert!(RestoreBuffer::new(vec![1i64], vec![0.0f32; 4], vec![], 4).is_err());
        assert!(RestoreBuffer::<i64, f32>::new(vec![], vec![], vec![], 0).is_err());

        let empty = RestoreBuffer::<i64, f32>::new(vec![], vec![], vec![], 8).unwrap();
        assert!(empty.is_empty());
        assert!(empty.row(0).is_none());
    }

    #[test]
    fn test_import_summary_total() {
        let summary = ImportSummary {
            imported: 3,
            skipped_existing: 1,
            skipped_partition: 4,
        };
        assert_eq!(summary.total(), 8);
    }
}
