//! Reading dumped embeddings back into stores.

use std::ops::Range;

use embedvar_hash_table::{EmbeddingKey, EmbeddingStore, ImportSummary, RestoreBuffer};
use embedvar_tensor::Element;

use crate::bundle::BundleReader;
use crate::exporter::record_name;
use crate::{CheckpointError, Result};

/// The four records of one dumped prefix, checked for consistency.
#[derive(Debug, Clone)]
pub struct RestoredEmbedding<K, V> {
    buffer: RestoreBuffer<K, V>,
    partition_offsets: Vec<i32>,
}

impl<K, V> RestoredEmbedding<K, V> {
    /// Flat key, value and version rows.
    pub fn buffer(&self) -> &RestoreBuffer<K, V> {
        &self.buffer
    }

    /// Consumes `self`, returning the row buffer.
    pub fn into_buffer(self) -> RestoreBuffer<K, V> {
        self.buffer
    }

    /// The cumulative `partition_offset` record.
    pub fn partition_offsets(&self) -> &[i32] {
        &self.partition_offsets
    }

    /// Number of sub-partitions described by the offsets.
    pub fn sub_partition_count(&self) -> usize {
        self.partition_offsets.len().saturating_sub(1)
    }

    /// Row range of sub-partition `index`.
    pub fn sub_partition(&self, index: usize) -> Option<Range<usize>> {
        let start = *self.partition_offsets.get(index)?;
        let end = *self.partition_offsets.get(index + 1)?;
        Some(start as usize..end as usize)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if no rows were dumped.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl BundleReader {
    /// Reads the `keys`, `partition_offset`, `values` and `versions`
    /// records under `prefix`.
    ///
    /// Fails with [`CheckpointError::Corrupted`] if the row counts disagree
    /// or the offsets are not a cumulative count ending at the row count.
    pub fn read_embedding<K: EmbeddingKey, V: Element>(&self, prefix: &str) -> Result<RestoredEmbedding<K, V>> {
        let keys: Vec<K> = self.read_keys(&record_name(prefix, "keys"))?;
        let rows = keys.len();

        let values_name = record_name(prefix, "values");
        let (_, shape) = self.lookup_dtype_and_shape(&values_name)?;
        let value_len = match *shape {
            [n, width] if n == rows && width > 0 => width,
            _ => {
                return Err(CheckpointError::Corrupted(format!(
                    "record '{values_name}' has shape {shape:?}, expected [{rows}, width]"
                )))
            }
        };
        let values: Vec<V> = self.read_elements(&values_name)?;

        let versions: Vec<i64> = self.read_elements(&record_name(prefix, "versions"))?;
        if versions.len() != rows {
            return Err(CheckpointError::Corrupted(format!(
                "prefix '{prefix}' has {rows} keys but {} versions",
                versions.len()
            )));
        }

        let partition_offsets: Vec<i32> = self.read_elements(&record_name(prefix, "partition_offset"))?;
        check_offsets(prefix, &partition_offsets, rows)?;

        let buffer = RestoreBuffer::new(keys, values, versions, value_len)?;
        tracing::debug!(prefix, rows, value_len, "Read embedding records");
        Ok(RestoredEmbedding {
            buffer,
            partition_offsets,
        })
    }

    /// Prefixes `<name>/part_<p>` present in the bundle, ordered by `p`.
    pub fn partition_prefixes(&self, name: &str) -> Vec<String> {
        let part_prefix = format!("{name}/part_");
        let mut parts: Vec<(usize, String)> = self
            .record_names()
            .filter_map(|record| {
                let prefix = record.strip_suffix("-keys")?;
                let part = prefix.strip_prefix(&part_prefix)?.parse().ok()?;
                Some((part, prefix.to_string()))
            })
            .collect();
        parts.sort_unstable_by_key(|(part, _)| *part);
        parts.into_iter().map(|(_, prefix)| prefix).collect()
    }
}

fn check_offsets(prefix: &str, offsets: &[i32], rows: usize) -> Result<()> {
    let corrupted = |why: &str| {
        Err(CheckpointError::Corrupted(format!(
            "prefix '{prefix}' partition_offset {why}"
        )))
    };
    match (offsets.first(), offsets.last()) {
        (Some(0), Some(&last)) if usize::try_from(last).ok() == Some(rows) => {}
        (None, _) => return corrupted("is empty"),
        _ => return corrupted(&format!("does not span 0..{rows}")),
    }
    if offsets.windows(2).any(|pair| pair[1] < pair[0]) {
        return corrupted("is not monotonic");
    }
    Ok(())
}

/// Imports every row under `prefix` into `store`.
pub fn restore_full<K: EmbeddingKey, V: Element>(
    reader: &BundleReader,
    prefix: &str,
    store: &EmbeddingStore<K, V>,
) -> Result<ImportSummary> {
    let restored = reader.read_embedding::<K, V>(prefix)?;
    let buffer = restored.buffer();
    Ok(store.import(buffer.keys(), buffer.values(), buffer.versions())?)
}

/// Imports the rows of embedding `name` that belong to `partition_id` out
/// of `partition_count`, routing each key by
/// `key mod bucket_count mod partition_count`.
///
/// Every `<name>/part_<p>` prefix in the bundle is scanned, so the dump may
/// have used any partition count. A bundle with a single unpartitioned
/// prefix `name` is read as is.
pub fn restore_partitioned<K: EmbeddingKey, V: Element>(
    reader: &BundleReader,
    name: &str,
    store: &EmbeddingStore<K, V>,
    bucket_count: u64,
    partition_id: u64,
    partition_count: u64,
) -> Result<ImportSummary> {
    let mut prefixes = reader.partition_prefixes(name);
    if prefixes.is_empty() {
        let keys = record_name(name, "keys");
        if !reader.contains(&keys) {
            return Err(CheckpointError::RecordNotFound(keys));
        }
        prefixes.push(name.to_string());
    }

    let mut total = ImportSummary::default();
    for prefix in &prefixes {
        let restored = reader.read_embedding::<K, V>(prefix)?;
        let buffer = restored.buffer();
        let summary = store.partitioned_import(buffer, buffer.len(), bucket_count, partition_id, partition_count)?;
        total.imported += summary.imported;
        total.skipped_existing += summary.skipped_existing;
        total.skipped_partition += summary.skipped_partition;
    }
    tracing::info!(
        name,
        prefixes = prefixes.len(),
        partition_id,
        imported = total.imported,
        "Restored embedding partition"
    );
    Ok(total)
}
