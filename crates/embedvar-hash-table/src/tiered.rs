//! Secondary key/value backends for stores running in tiered mode.
//!
//! When tiering is enabled a store keeps no in-memory slots at all: every
//! vector, whether written by `hybrid_insert` or by a bulk import, is encoded
//! to little-endian bytes and handed to a [`TieredStore`] under the key's wire
//! encoding. Snapshots of a tiered store are read back from
//! [`TieredStore::entries`].
//!
//! Two backends are provided:
//!
//! - [`RedbTieredStore`] - a disk-resident table in a redb database file
//! - [`MemoryTieredStore`] - an in-process map, for tests and small tables

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};

use crate::error::{HashTableError, Result};

/// A byte-oriented key/value backend.
///
/// Lookup failures are recoverable for callers (they fall back to a default
/// vector); insert failures are reported.
pub trait TieredStore: Send + Sync {
    /// Short backend name, for logs.
    fn name(&self) -> &'static str;

    /// Returns the stored bytes for `key`, or `None` on a miss.
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Number of stored keys.
    fn size(&self) -> Result<usize>;

    /// Every stored `(key, value)` pair, in backend order.
    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-process tiered backend.
#[derive(Debug, Default)]
pub struct MemoryTieredStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryTieredStore {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TieredStore for MemoryTieredStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn size(&self) -> Result<usize> {
        Ok(self.entries.read().len())
    }

    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read();
        Ok(entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

const VECTORS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("embedding_vectors");

/// Disk-resident tiered backend stored in a redb database.
///
/// Each insert is its own committed write transaction; lookups use read
/// transactions and never block writers.
///
/// A database from [`open_temporary`](Self::open_temporary) is deleted when
/// the store is dropped.
pub struct RedbTieredStore {
    db: Database,
    path: PathBuf,
    // Declared after `db` so the file is closed before it is removed.
    cleanup: Option<RemoveOnDrop>,
}

struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => tracing::debug!(path = %self.0.display(), "Removed temporary tiered store"),
            Err(e) => tracing::warn!(
                path = %self.0.display(),
                error = %e,
                "Failed to remove temporary tiered store"
            ),
        }
    }
}

impl RedbTieredStore {
    /// Opens or creates the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(HashTableError::tier)?;
        }
        let db = Database::create(&path).map_err(HashTableError::tier)?;

        // Create the table up front so read transactions never see it missing.
        let tx = db.begin_write().map_err(HashTableError::tier)?;
        tx.open_table(VECTORS).map_err(HashTableError::tier)?;
        tx.commit().map_err(HashTableError::tier)?;

        tracing::info!(path = %path.display(), "Opened tiered store");
        Ok(Self {
            db,
            path,
            cleanup: None,
        })
    }

    /// Opens a fresh database under the system temp directory, named after
    /// the embedding and the current time. The file is removed on drop.
    pub fn open_temporary(embedding_name: &str) -> Result<Self> {
        let mut store = Self::open(Self::temporary_path(embedding_name))?;
        store.cleanup = Some(RemoveOnDrop(store.path.clone()));
        Ok(store)
    }

    /// The path [`open_temporary`](Self::open_temporary) would use right now.
    pub fn temporary_path(embedding_name: &str) -> PathBuf {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or_default();
        let sanitized: String = embedding_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        std::env::temp_dir().join(format!("embedvar_tier_{sanitized}_{micros}.redb"))
    }

    /// Database file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` if the file is removed on drop.
    pub fn is_temporary(&self) -> bool {
        self.cleanup.is_some()
    }
}

impl std::fmt::Debug for RedbTieredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbTieredStore")
            .field("path", &self.path)
            .field("temporary", &self.is_temporary())
            .finish()
    }
}

impl TieredStore for RedbTieredStore {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tx = self.db.begin_read().map_err(HashTableError::tier)?;
        let table = tx.open_table(VECTORS).map_err(HashTableError::tier)?;
        let value = table.get(key).map_err(HashTableError::tier)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let tx = self.db.begin_write().map_err(HashTableError::tier)?;
        {
            let mut table = tx.open_table(VECTORS).map_err(HashTableError::tier)?;
            table.insert(key, value).map_err(HashTableError::tier)?;
        }
        tx.commit().map_err(HashTableError::tier)
    }

    fn size(&self) -> Result<usize> {
        let tx = self.db.begin_read().map_err(HashTableError::tier)?;
        let table = tx.open_table(VECTORS).map_err(HashTableError::tier)?;
        let len = table.len().map_err(HashTableError::tier)?;
        Ok(len as usize)
    }

    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tx = self.db.begin_read().map_err(HashTableError::tier)?;
        let table = tx.open_table(VECTORS).map_err(HashTableError::tier)?;
        let mut entries = Vec::new();
        for entry in table.iter().map_err(HashTableError::tier)? {
            let (key, value) = entry.map_err(HashTableError::tier)?;
            entries.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(entries)
    }
}
