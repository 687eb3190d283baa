//! Snapshot export of embedding stores into bundle records.

use embedvar_hash_table::{EmbeddingKey, EmbeddingStore};
use embedvar_tensor::{encode_slice, Element};

use crate::bundle::{BundleWriter, RecordKind};
use crate::{CheckpointError, Result, SAVED_PARTITION_NUM};

const DEFAULT_CHUNK_BYTES: usize = 1 << 20;

/// Returns the full name of record `suffix` under `prefix`, e.g.
/// `var/part_0-keys`.
pub fn record_name(prefix: &str, suffix: &str) -> String {
    format!("{prefix}-{suffix}")
}

/// Returns the prefix of partition `partition` of embedding `name`.
pub fn partition_prefix(name: &str, partition: usize) -> String {
    format!("{name}/part_{partition}")
}

/// What one dump wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    /// Record prefix.
    pub prefix: String,
    /// Number of keys exported.
    pub keys: usize,
    /// Payload bytes across the four records.
    pub bytes: u64,
}

/// Dumps store snapshots as `keys`, `partition_offset`, `values` and
/// `versions` records.
///
/// Rows are grouped by sub-partition `key.bucket(sub_partitions)` and keep
/// snapshot order inside a group. `partition_offset[i]` is the first row of
/// sub-partition `i`; the last entry is the row count. Values are streamed
/// in bounded chunks straight from the slots, so beyond the snapshot itself
/// only a row permutation is held in memory.
#[derive(Debug, Clone)]
pub struct SnapshotExporter {
    sub_partitions: usize,
    chunk_bytes: usize,
}

impl Default for SnapshotExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotExporter {
    /// Creates an exporter using [`SAVED_PARTITION_NUM`] sub-partitions.
    pub fn new() -> Self {
        Self {
            sub_partitions: SAVED_PARTITION_NUM,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }

    /// Sets the number of sub-partitions described by `partition_offset`.
    pub fn with_sub_partitions(mut self, sub_partitions: usize) -> Self {
        self.sub_partitions = sub_partitions.max(1);
        self
    }

    /// Sets how many bytes are buffered before each append to the writer.
    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }

    /// Number of sub-partitions.
    pub fn sub_partitions(&self) -> usize {
        self.sub_partitions
    }

    /// Dumps `store` under `prefix`.
    pub fn dump<K, V, W>(&self, store: &EmbeddingStore<K, V>, prefix: &str, writer: &mut W) -> Result<ExportSummary>
    where
        K: EmbeddingKey,
        V: Element,
        W: BundleWriter + ?Sized,
    {
        let snapshot = store.snapshot()?;
        let rows = snapshot.len();
        let (offsets, order) = self.group_rows(&snapshot.keys)?;

        let mut bytes = 0u64;

        let mut record = ChunkedRecord::begin(
            &mut *writer,
            &record_name(prefix, "keys"),
            RecordKind::of_key::<K>(),
            &[rows],
            self.chunk_bytes,
        )?;
        for &row in &order {
            snapshot.keys[row].encode(record.buffer());
            record.maybe_flush()?;
        }
        bytes += record.end()?;

        let mut encoded = Vec::with_capacity(offsets.len() * 4);
        encode_slice(&offsets, &mut encoded);
        writer.write_record(
            &record_name(prefix, "partition_offset"),
            RecordKind::of_element::<i32>(),
            &[offsets.len()],
            &encoded,
        )?;
        bytes += encoded.len() as u64;

        let mut record = ChunkedRecord::begin(
            &mut *writer,
            &record_name(prefix, "values"),
            RecordKind::of_element::<V>(),
            &[rows, snapshot.value_len()],
            self.chunk_bytes,
        )?;
        for &row in &order {
            if !snapshot.write_value_le(row, record.buffer()) {
                return Err(CheckpointError::Corrupted(format!(
                    "key {:?} has no value in part {}",
                    snapshot.keys[row],
                    store.config().embedding_index
                )));
            }
            record.maybe_flush()?;
        }
        bytes += record.end()?;

        let mut record = ChunkedRecord::begin(
            &mut *writer,
            &record_name(prefix, "versions"),
            RecordKind::of_element::<i64>(),
            &[rows],
            self.chunk_bytes,
        )?;
        for &row in &order {
            snapshot.versions[row].write_le(record.buffer());
            record.maybe_flush()?;
        }
        bytes += record.end()?;

        tracing::info!(
            name = %store.name(),
            prefix,
            keys = rows,
            bytes,
            "Dumped embedding snapshot"
        );
        Ok(ExportSummary {
            prefix: prefix.to_string(),
            keys: rows,
            bytes,
        })
    }

    /// Dumps each store as partition `p` of `name`, under
    /// `<name>/part_<p>`.
    pub fn dump_partitions<K, V, W>(
        &self,
        stores: &[&EmbeddingStore<K, V>],
        name: &str,
        writer: &mut W,
    ) -> Result<Vec<ExportSummary>>
    where
        K: EmbeddingKey,
        V: Element,
        W: BundleWriter + ?Sized,
    {
        stores
            .iter()
            .enumerate()
            .map(|(p, &store)| self.dump(store, &partition_prefix(name, p), &mut *writer))
            .collect()
    }

    /// Returns the cumulative sub-partition offsets and the row permutation
    /// that groups rows by sub-partition.
    fn group_rows<K: EmbeddingKey>(&self, keys: &[K]) -> Result<(Vec<i32>, Vec<usize>)> {
        let parts = self.sub_partitions;
        let buckets: Vec<usize> = keys.iter().map(|key| key.bucket(parts as u64) as usize).collect();

        let mut counts = vec![0usize; parts];
        for &bucket in &buckets {
            counts[bucket] += 1;
        }

        let mut offsets = Vec::with_capacity(parts + 1);
        let mut starts = Vec::with_capacity(parts);
        let mut running = 0usize;
        offsets.push(0i32);
        for count in counts {
            starts.push(running);
            running += count;
            let offset = i32::try_from(running).map_err(|_| {
                CheckpointError::InvalidConfig(format!(
                    "{running} rows exceed the int32 partition_offset range"
                ))
            })?;
            offsets.push(offset);
        }

        let mut order = vec![0usize; keys.len()];
        for (row, &bucket) in buckets.iter().enumerate() {
            order[starts[bucket]] = row;
            starts[bucket] += 1;
        }
        Ok((offsets, order))
    }
}

/// An open record that buffers appends up to a chunk size.
struct ChunkedRecord<'w, W: ?Sized> {
    writer: &'w mut W,
    buf: Vec<u8>,
    chunk_bytes: usize,
    written: u64,
}

impl<'w, W: BundleWriter + ?Sized> ChunkedRecord<'w, W> {
    fn begin(writer: &'w mut W, name: &str, kind: RecordKind, shape: &[usize], chunk_bytes: usize) -> Result<Self> {
        writer.begin_record(name, kind, shape)?;
        Ok(Self {
            writer,
            buf: Vec::with_capacity(chunk_bytes.min(DEFAULT_CHUNK_BYTES)),
            chunk_bytes,
            written: 0,
        })
    }

    fn buffer(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.buf.len() >= self.chunk_bytes {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.writer.append(&self.buf)?;
            self.written += self.buf.len() as u64;
            self.buf.clear();
        }
        Ok(())
    }

    fn end(mut self) -> Result<u64> {
        self.flush()?;
        self.writer.end_record()?;
        Ok(self.written)
    }
}
