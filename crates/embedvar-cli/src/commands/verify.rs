//! Verify Command Implementation
//!
//! Re-reads every record of a bundle to check its CRC32, then loads each
//! dumped embedding prefix and checks that keys, values, versions and
//! partition offsets agree.

use std::fmt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use embedvar_checkpoint::{record_name, BundleReader, RecordKind};
use embedvar_hash_table::{EmbeddingKey, KeyKind};
use embedvar_tensor::{DType, Element};
use serde::Serialize;
use tracing::{info, warn};

/// Verify checksums, offsets and row counts of a bundle
///
/// # Example
///
/// ```bash
/// embedvar verify /path/to/ckpt/model --prefix item_emb/part_0
/// ```
#[derive(Args, Debug, Clone)]
pub struct VerifyCommand {
    /// Bundle base path (without the `.index` / `.data` suffix)
    #[arg(env = "EMBEDVAR_BUNDLE")]
    pub bundle: PathBuf,

    /// Embedding prefix to check; every prefix with a `-keys` record when omitted
    #[arg(long, short = 'p')]
    pub prefix: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Layout summary of one verified prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefixReport {
    /// Record prefix.
    pub prefix: String,
    /// Key element type.
    pub key_type: String,
    /// Value element type.
    pub value_type: String,
    /// Number of rows.
    pub rows: usize,
    /// Width of each value row.
    pub value_len: usize,
    /// Sub-partitions described by `partition_offset`.
    pub sub_partitions: usize,
    /// Sub-partitions holding at least one row.
    pub non_empty_sub_partitions: usize,
}

/// Result of a verify run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Records whose checksum matched.
    pub records_checked: usize,
    /// Per-prefix layout checks.
    pub prefixes: Vec<PrefixReport>,
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "checksums ok for {} records", self.records_checked)?;
        for p in &self.prefixes {
            writeln!(
                f,
                "{}: {} rows x {} ({} keys, {} values), {}/{} sub-partitions used",
                p.prefix,
                p.rows,
                p.value_len,
                p.key_type,
                p.value_type,
                p.non_empty_sub_partitions,
                p.sub_partitions
            )?;
        }
        Ok(())
    }
}

impl VerifyCommand {
    /// Execute the verify command
    pub fn run(&self) -> Result<()> {
        info!("Verifying bundle {:?}", self.bundle);
        let report = self.verify()?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print!("{report}");
        }
        Ok(())
    }

    /// Runs all checks, failing on the first inconsistency.
    pub fn verify(&self) -> Result<VerifyReport> {
        let reader = BundleReader::open(&self.bundle)
            .with_context(|| format!("Failed to open bundle {:?}", self.bundle))?;
        let records_checked = reader.verify().context("Checksum verification failed")?;

        let prefixes: Vec<String> = match &self.prefix {
            Some(prefix) => vec![prefix.clone()],
            None => reader
                .record_names()
                .filter_map(|name| name.strip_suffix("-keys"))
                .map(str::to_string)
                .collect(),
        };
        if prefixes.is_empty() {
            warn!("Bundle {:?} holds no embedding prefixes", self.bundle);
        }

        let prefixes = prefixes
            .iter()
            .map(|prefix| check_prefix(&reader, prefix).with_context(|| format!("Prefix '{prefix}' is inconsistent")))
            .collect::<Result<Vec<_>>>()?;
        Ok(VerifyReport {
            records_checked,
            prefixes,
        })
    }
}

fn check_prefix(reader: &BundleReader, prefix: &str) -> Result<PrefixReport> {
    let (key_kind, _) = reader.lookup_dtype_and_shape(&record_name(prefix, "keys"))?;
    let (value_kind, _) = reader.lookup_dtype_and_shape(&record_name(prefix, "values"))?;
    let RecordKind::Tensor(dtype) = value_kind else {
        bail!("values record holds {value_kind}, expected a numeric type");
    };
    match key_kind {
        RecordKind::Keys(KeyKind::Int64) => check_values::<i64>(reader, prefix, dtype),
        RecordKind::Keys(KeyKind::Utf8) => check_values::<String>(reader, prefix, dtype),
        other => bail!("keys record holds {other}, expected keys"),
    }
}

fn check_values<K: EmbeddingKey>(reader: &BundleReader, prefix: &str, dtype: DType) -> Result<PrefixReport> {
    match dtype {
        DType::F32 => check_typed::<K, f32>(reader, prefix),
        DType::F64 => check_typed::<K, f64>(reader, prefix),
        DType::I32 => check_typed::<K, i32>(reader, prefix),
        DType::I64 => check_typed::<K, i64>(reader, prefix),
    }
}

fn check_typed<K: EmbeddingKey, V: Element>(reader: &BundleReader, prefix: &str) -> Result<PrefixReport> {
    let restored = reader.read_embedding::<K, V>(prefix)?;
    let sub_partitions = restored.sub_partition_count();
    let non_empty_sub_partitions = (0..sub_partitions)
        .filter_map(|i| restored.sub_partition(i))
        .filter(|range| !range.is_empty())
        .count();
    Ok(PrefixReport {
        prefix: prefix.to_string(),
        key_type: RecordKind::of_key::<K>().to_string(),
        value_type: V::DTYPE.to_string(),
        rows: restored.len(),
        value_len: restored.buffer().value_len(),
        sub_partitions,
        non_empty_sub_partitions,
    })
}
