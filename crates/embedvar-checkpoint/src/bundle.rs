//! Named-record bundle format.
//!
//! A bundle at base path `<base>` is two files:
//!
//! - `<base>.data`: record payloads, back to back, little-endian
//! - `<base>.index`: JSON [`BundleIndex`] mapping each record name to its
//!   kind, shape, byte range and CRC32
//!
//! Records are appended in chunks, so a writer never needs a whole record in
//! memory. The index is written last by [`FileBundleWriter::finish`]; a
//! bundle without an index is incomplete and will not open.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use embedvar_hash_table::{decode_keys, EmbeddingKey, KeyKind};
use embedvar_tensor::{decode_slice, DType, Element};
use serde::{Deserialize, Serialize};

use crate::{CheckpointError, Result};

/// Current on-disk format version.
pub const BUNDLE_FORMAT_VERSION: u32 = 1;

/// Element encoding of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Fixed-width numeric elements.
    Tensor(DType),
    /// Embedding keys in their wire encoding.
    Keys(KeyKind),
}

impl RecordKind {
    /// Kind of a record holding `T` elements.
    pub fn of_element<T: Element>() -> Self {
        Self::Tensor(T::DTYPE)
    }

    /// Kind of a record holding `K` keys.
    pub fn of_key<K: EmbeddingKey>() -> Self {
        Self::Keys(K::KIND)
    }

    /// Bytes per element, or `None` for variable-length strings.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            Self::Tensor(dtype) => Some(dtype.size_in_bytes()),
            Self::Keys(KeyKind::Int64) => Some(8),
            Self::Keys(KeyKind::Utf8) => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tensor(dtype) => write!(f, "{dtype}"),
            Self::Keys(KeyKind::Int64) => write!(f, "int64"),
            Self::Keys(KeyKind::Utf8) => write!(f, "string"),
        }
    }
}

/// Index entry of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    /// Element encoding.
    pub kind: RecordKind,
    /// Logical shape.
    pub shape: Vec<usize>,
    /// Byte offset in the data file.
    pub offset: u64,
    /// Payload length in bytes.
    pub length: u64,
    /// CRC32 of the payload.
    pub crc32: u32,
}

impl RecordEntry {
    /// Number of elements described by the shape.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// The JSON index of a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleIndex {
    /// Format version the bundle was written with.
    pub format_version: u32,
    /// Records by name.
    pub records: BTreeMap<String, RecordEntry>,
}

/// Returns the `(data, index)` file paths of the bundle at `base`.
pub fn bundle_paths(base: &Path) -> (PathBuf, PathBuf) {
    let with_suffix = |suffix: &str| {
        let mut name = base.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    };
    (with_suffix(".data"), with_suffix(".index"))
}

/// A sink for named, typed records.
///
/// A record is opened with [`begin_record`](Self::begin_record), filled by
/// any number of [`append`](Self::append) calls and sealed with
/// [`end_record`](Self::end_record). Only one record may be open at a time.
pub trait BundleWriter {
    /// Opens a new record.
    fn begin_record(&mut self, name: &str, kind: RecordKind, shape: &[usize]) -> Result<()>;

    /// Appends encoded bytes to the open record.
    fn append(&mut self, bytes: &[u8]) -> Result<()>;

    /// Seals the open record.
    fn end_record(&mut self) -> Result<()>;

    /// Writes a whole record in one call.
    fn write_record(&mut self, name: &str, kind: RecordKind, shape: &[usize], bytes: &[u8]) -> Result<()> {
        self.begin_record(name, kind, shape)?;
        self.append(bytes)?;
        self.end_record()
    }
}

struct OpenRecord {
    name: String,
    kind: RecordKind,
    shape: Vec<usize>,
    offset: u64,
    length: u64,
    hasher: crc32fast::Hasher,
}

/// Writes a bundle to `<base>.data` and `<base>.index`.
pub struct FileBundleWriter {
    data_path: PathBuf,
    index_path: PathBuf,
    data: BufWriter<File>,
    offset: u64,
    records: BTreeMap<String, RecordEntry>,
    open: Option<OpenRecord>,
}

impl FileBundleWriter {
    /// Creates (or truncates) the bundle at `base`, creating parent
    /// directories as needed.
    pub fn create(base: impl AsRef<Path>) -> Result<Self> {
        let (data_path, index_path) = bundle_paths(base.as_ref());
        if let Some(parent) = data_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
        }
        let file = File::create(&data_path).map_err(|e| CheckpointError::io(&data_path, e))?;
        tracing::debug!(path = %data_path.display(), "Creating bundle");
        Ok(Self {
            data_path,
            index_path,
            data: BufWriter::new(file),
            offset: 0,
            records: BTreeMap::new(),
            open: None,
        })
    }

    /// Names of the records sealed so far.
    pub fn record_names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Flushes the data file and writes the index, completing the bundle.
    pub fn finish(mut self) -> Result<BundleIndex> {
        if let Some(open) = &self.open {
            return Err(CheckpointError::InvalidConfig(format!(
                "record '{}' was never ended",
                open.name
            )));
        }
        self.data
            .flush()
            .map_err(|e| CheckpointError::io(&self.data_path, e))?;
        self.data
            .get_ref()
            .sync_all()
            .map_err(|e| CheckpointError::io(&self.data_path, e))?;

        let index = BundleIndex {
            format_version: BUNDLE_FORMAT_VERSION,
            records: std::mem::take(&mut self.records),
        };
        let json = serde_json::to_vec_pretty(&index).map_err(CheckpointError::Serialization)?;
        std::fs::write(&self.index_path, json).map_err(|e| CheckpointError::io(&self.index_path, e))?;

        tracing::info!(
            path = %self.index_path.display(),
            records = index.records.len(),
            bytes = self.offset,
            "Bundle written"
        );
        Ok(index)
    }
}

impl BundleWriter for FileBundleWriter {
    fn begin_record(&mut self, name: &str, kind: RecordKind, shape: &[usize]) -> Result<()> {
        if let Some(open) = &self.open {
            return Err(CheckpointError::InvalidConfig(format!(
                "cannot begin '{name}' while '{}' is open",
                open.name
            )));
        }
        if self.records.contains_key(name) {
            return Err(CheckpointError::InvalidConfig(format!(
                "record '{name}' written twice"
            )));
        }
        self.open = Some(OpenRecord {
            name: name.to_string(),
            kind,
            shape: shape.to_vec(),
            offset: self.offset,
            length: 0,
            hasher: crc32fast::Hasher::new(),
        });
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(open) = self.open.as_mut() else {
            return Err(CheckpointError::InvalidConfig(
                "append called with no open record".to_string(),
            ));
        };
        self.data
            .write_all(bytes)
            .map_err(|e| CheckpointError::io(&self.data_path, e))?;
        open.hasher.update(bytes);
        open.length += bytes.len() as u64;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn end_record(&mut self) -> Result<()> {
        let Some(open) = self.open.take() else {
            return Err(CheckpointError::InvalidConfig(
                "end_record called with no open record".to_string(),
            ));
        };
        let entry = RecordEntry {
            kind: open.kind,
            shape: open.shape,
            offset: open.offset,
            length: open.length,
            crc32: open.hasher.finalize(),
        };
        if let Some(size) = entry.kind.element_size() {
            let expected = (entry.numel() * size) as u64;
            if expected != entry.length {
                return Err(CheckpointError::InvalidConfig(format!(
                    "record '{}' of shape {:?} needs {expected} bytes, got {}",
                    open.name, entry.shape, entry.length
                )));
            }
        }
        tracing::debug!(record = %open.name, kind = %entry.kind, bytes = entry.length, "Wrote bundle record");
        self.records.insert(open.name, entry);
        Ok(())
    }
}

/// Reads records from a finished bundle.
#[derive(Debug)]
pub struct BundleReader {
    data_path: PathBuf,
    index: BundleIndex,
}

impl BundleReader {
    /// Opens the bundle at `base`, checking the format version and that
    /// every record lies inside the data file.
    pub fn open(base: impl AsRef<Path>) -> Result<Self> {
        let (data_path, index_path) = bundle_paths(base.as_ref());
        if !index_path.exists() {
            return Err(CheckpointError::NotFound(index_path));
        }
        let raw = std::fs::read(&index_path).map_err(|e| CheckpointError::io(&index_path, e))?;
        let index: BundleIndex = serde_json::from_slice(&raw).map_err(CheckpointError::Deserialization)?;
        if index.format_version != BUNDLE_FORMAT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                expected: BUNDLE_FORMAT_VERSION,
                found: index.format_version,
            });
        }

        if !data_path.exists() {
            return Err(CheckpointError::NotFound(data_path));
        }
        let data_len = std::fs::metadata(&data_path)
            .map_err(|e| CheckpointError::io(&data_path, e))?
            .len();
        for (name, entry) in &index.records {
            if entry.offset.saturating_add(entry.length) > data_len {
                return Err(CheckpointError::Corrupted(format!(
                    "record '{name}' ends past the data file ({data_len} bytes)"
                )));
            }
        }

        tracing::info!(path = %index_path.display(), records = index.records.len(), "Opened bundle");
        Ok(Self { data_path, index })
    }

    /// The parsed index.
    pub fn index(&self) -> &BundleIndex {
        &self.index
    }

    /// Record names in sorted order.
    pub fn record_names(&self) -> impl Iterator<Item = &str> {
        self.index.records.keys().map(String::as_str)
    }

    /// Returns `true` if the bundle has a record called `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.index.records.contains_key(name)
    }

    /// Index entry of `name`.
    pub fn entry(&self, name: &str) -> Result<&RecordEntry> {
        self.index
            .records
            .get(name)
            .ok_or_else(|| CheckpointError::RecordNotFound(name.to_string()))
    }

    /// Kind and shape of `name`, without reading its payload.
    pub fn lookup_dtype_and_shape(&self, name: &str) -> Result<(RecordKind, &[usize])> {
        let entry = self.entry(name)?;
        Ok((entry.kind, &entry.shape))
    }

    /// Reads the raw payload of `name`, verifying its checksum.
    pub fn read_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let entry = self.entry(name)?;
        let mut file = File::open(&self.data_path).map_err(|e| CheckpointError::io(&self.data_path, e))?;
        file.seek(SeekFrom::Start(entry.offset))
            .map_err(|e| CheckpointError::io(&self.data_path, e))?;
        let mut bytes = vec![0u8; entry.length as usize];
        file.read_exact(&mut bytes)
            .map_err(|e| CheckpointError::io(&self.data_path, e))?;

        let crc = crc32fast::hash(&bytes);
        if crc != entry.crc32 {
            return Err(CheckpointError::Corrupted(format!(
                "record '{name}' checksum mismatch: expected {:08x}, found {crc:08x}",
                entry.crc32
            )));
        }
        Ok(bytes)
    }

    /// Reads a numeric record as `T` elements.
    pub fn read_elements<T: Element>(&self, name: &str) -> Result<Vec<T>> {
        let entry = self.entry(name)?;
        self.expect_kind(name, entry, RecordKind::of_element::<T>())?;
        let values = decode_slice::<T>(&self.read_bytes(name)?)
            .map_err(|e| CheckpointError::Corrupted(format!("record '{name}': {e}")))?;
        Self::expect_count(name, entry, values.len())?;
        Ok(values)
    }

    /// Reads a key record as `K` keys.
    pub fn read_keys<K: EmbeddingKey>(&self, name: &str) -> Result<Vec<K>> {
        let entry = self.entry(name)?;
        self.expect_kind(name, entry, RecordKind::of_key::<K>())?;
        let keys = decode_keys::<K>(&self.read_bytes(name)?)
            .ok_or_else(|| CheckpointError::Corrupted(format!("record '{name}' holds truncated keys")))?;
        Self::expect_count(name, entry, keys.len())?;
        Ok(keys)
    }

    /// Re-reads every record and checks its checksum. Returns the number of
    /// records verified.
    pub fn verify(&self) -> Result<usize> {
        for name in self.index.records.keys() {
            self.read_bytes(name)?;
        }
        Ok(self.index.records.len())
    }

    fn expect_kind(&self, name: &str, entry: &RecordEntry, wanted: RecordKind) -> Result<()> {
        if entry.kind != wanted {
            return Err(CheckpointError::Corrupted(format!(
                "record '{name}' holds {}, expected {wanted}",
                entry.kind
            )));
        }
        Ok(())
    }

    fn expect_count(name: &str, entry: &RecordEntry, found: usize) -> Result<()> {
        if found != entry.numel() {
            return Err(CheckpointError::Corrupted(format!(
                "record '{name}' of shape {:?} holds {found} elements",
                entry.shape
            )));
        }
        Ok(())
    }
}
