//! Construction-time configuration for embedding stores.
//!
//! Everything a store needs is passed in explicitly through [`StoreOptions`]
//! and [`EmbeddingConfig`]; nothing is read from the process environment.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dynamic_index::DynamicKeyIndex;
use crate::error::{HashTableError, Result};
use crate::key::EmbeddingKey;
use crate::static_index::StaticKeyIndex;
use crate::traits::KeyIndex;
use embedvar_tensor::Element;

/// Which key index implementation backs a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexVariant {
    /// Open addressing behind one reader/writer lock.
    Static,
    /// Segmented index that grows without stalling readers.
    #[default]
    Dynamic,
}

impl fmt::Display for IndexVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexVariant::Static => write!(f, "static"),
            IndexVariant::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Disk tier settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieredStorageOptions {
    /// Route all vector storage through the tiered backend.
    pub enabled: bool,
    /// Database file for the disk backend. A temporary path is chosen when
    /// unset.
    pub path: Option<PathBuf>,
}

/// Options recognized when building an embedding store.
///
/// # Example
///
/// ```
/// use embedvar_hash_table::{IndexVariant, StoreOptions};
///
/// let options = StoreOptions::default()
///     .with_value_width(8)
///     .with_index_variant(IndexVariant::Static)
///     .with_versioning(false);
///
/// assert_eq!(options.value_width, 8);
/// assert!(!options.versioning_enabled);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Vector width. Zero means "take it from the default vector".
    pub value_width: usize,
    /// Append a version word to every slot.
    pub versioning_enabled: bool,
    /// Disk tier settings.
    pub tiered_storage: TieredStorageOptions,
    /// Key index implementation.
    pub index_variant: IndexVariant,
    /// Initial bucket count of the static index.
    pub static_initial_capacity: usize,
    /// Keys per segment of the dynamic index.
    pub segment_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            value_width: 0,
            versioning_enabled: true,
            tiered_storage: TieredStorageOptions::default(),
            index_variant: IndexVariant::Dynamic,
            static_initial_capacity: 1024,
            segment_capacity: 16 * 1024,
        }
    }
}

impl StoreOptions {
    /// Parses options from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| HashTableError::InvalidArgument(format!("bad store options: {e}")))
    }

    /// Sets the vector width.
    pub fn with_value_width(mut self, value_width: usize) -> Self {
        self.value_width = value_width;
        self
    }

    /// Enables or disables per-slot versions.
    pub fn with_versioning(mut self, enabled: bool) -> Self {
        self.versioning_enabled = enabled;
        self
    }

    /// Enables the disk tier, optionally at a fixed path.
    pub fn with_tiered_storage(mut self, path: Option<PathBuf>) -> Self {
        self.tiered_storage = TieredStorageOptions {
            enabled: true,
            path,
        };
        self
    }

    /// Selects the key index implementation.
    pub fn with_index_variant(mut self, variant: IndexVariant) -> Self {
        self.index_variant = variant;
        self
    }

    /// Sets the static index's initial bucket count.
    pub fn with_static_initial_capacity(mut self, capacity: usize) -> Self {
        self.static_initial_capacity = capacity;
        self
    }

    /// Sets the dynamic index's segment size.
    pub fn with_segment_capacity(mut self, capacity: usize) -> Self {
        self.segment_capacity = capacity;
        self
    }

    /// Builds an empty key index of the configured variant.
    pub fn build_index<K: EmbeddingKey, V: Element>(&self) -> Box<dyn KeyIndex<K, V>> {
        match self.index_variant {
            IndexVariant::Static => Box::new(StaticKeyIndex::with_capacity(self.static_initial_capacity)),
            IndexVariant::Dynamic => {
                Box::new(DynamicKeyIndex::with_segment_capacity(self.segment_capacity))
            }
        }
    }
}

/// Describes one part of a (possibly multi-part) embedding.
///
/// Parts of one embedding share a single key index. Every slot in it holds
/// `block_count * (slot_count + 1)` vectors and part `embedding_index` reads
/// and writes its own. The part whose index equals `primary_embedding_index`
/// owns the shared index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding (variable) name.
    pub name: String,
    /// This part's position in the slot.
    pub embedding_index: usize,
    /// Position of the owning part.
    pub primary_embedding_index: usize,
    /// Number of blocks.
    pub block_count: usize,
    /// Number of auxiliary slots per block.
    pub slot_count: usize,
    /// Staleness window in global steps; zero disables eviction.
    pub steps_to_live: i64,
}

impl EmbeddingConfig {
    /// Creates a single-part configuration named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            embedding_index: 0,
            primary_embedding_index: 0,
            block_count: 1,
            slot_count: 0,
            steps_to_live: 0,
        }
    }

    /// Sets this part's index and the primary's index.
    pub fn with_part(mut self, embedding_index: usize, primary_embedding_index: usize) -> Self {
        self.embedding_index = embedding_index;
        self.primary_embedding_index = primary_embedding_index;
        self
    }

    /// Sets the block and slot counts.
    pub fn with_layout(mut self, block_count: usize, slot_count: usize) -> Self {
        self.block_count = block_count;
        self.slot_count = slot_count;
        self
    }

    /// Sets the staleness window.
    pub fn with_steps_to_live(mut self, steps_to_live: i64) -> Self {
        self.steps_to_live = steps_to_live;
        self
    }

    /// Returns `true` for the part that owns the shared index.
    pub fn is_primary(&self) -> bool {
        self.embedding_index == self.primary_embedding_index
    }

    /// Number of parts in each slot.
    pub fn total_parts(&self) -> usize {
        self.block_count * (self.slot_count + 1)
    }

    /// Checks that the layout is non-empty and both indexes fall inside it.
    pub fn validate(&self) -> Result<()> {
        let total = self.total_parts();
        if total == 0 {
            return Err(HashTableError::InvalidArgument(format!(
                "embedding '{}' has block_count 0",
                self.name
            )));
        }
        if self.embedding_index >= total || self.primary_embedding_index >= total {
            return Err(HashTableError::InvalidArgument(format!(
                "embedding '{}': part {} / primary {} out of range for {} parts",
                self.name, self.embedding_index, self.primary_embedding_index, total
            )));
        }
        if self.steps_to_live < 0 {
            return Err(HashTableError::InvalidArgument(format!(
                "embedding '{}': steps_to_live must be non-negative, got {}",
                self.name, self.steps_to_live
            )));
        }
        Ok(())
    }
}

impl fmt::Display for EmbeddingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "opname: {} emb_index: {} primary_emb_index: {} block_num: {} slot_num: {}",
            self.name,
            self.embedding_index,
            self.primary_embedding_index,
            self.block_count,
            self.slot_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_options_defaults() {
        let options = StoreOptions::default();
        assert_eq!(options.value_width, 0);
        assert!(options.versioning_enabled);
        assert!(!options.tiered_storage.enabled);
        assert_eq!(options.index_variant, IndexVariant::Dynamic);
    }

    #[test]
    fn test_store_options_from_json() {
        let options = StoreOptions::from_json_str(
            r#"{"value_width": 16, "index_variant": "static", "tiered_storage": {"enabled": true, "path": "/tmp/x.redb"}}"#,
        )
        .unwrap();
        assert_eq!(options.value_width, 16);
        assert_eq!(options.index_variant, IndexVariant::Static);
        assert!(options.tiered_storage.enabled);
        assert_eq!(options.tiered_storage.path, Some(PathBuf::from("/tmp/x.redb")));
        assert!(options.versioning_enabled);

        let err = StoreOptions::from_json_str(r#"{"index_variant": "cuckoo"}"#).unwrap_err();
        assert!(matches!(err, HashTableError::InvalidArgument(_)));
    }

    #[test]
    fn test_build_index_variant() {
        let options = StoreOptions::default().with_index_variant(IndexVariant::Static);
        assert_eq!(options.build_index::<i64, f32>().name(), "static");
        assert_eq!(StoreOptions::default().build_index::<String, f32>().name(), "dynamic");
    }

    #[test]
    fn test_embedding_config_display() {
        let config = EmbeddingConfig::new("user_emb").with_part(1, 0).with_layout(2, 3);
        assert_eq!(
            config.to_string(),
            "opname: user_emb emb_index: 1 primary_emb_index: 0 block_num: 2 slot_num: 3"
        );
        assert!(!config.is_primary());
        assert_eq!(config.total_parts(), 8);
    }

    #[test]
    fn test_embedding_config_validate() {
        assert!(EmbeddingConfig::new("a").validate().is_ok());
        assert!(EmbeddingConfig::new("a").with_layout(0, 0).validate().is_err());
        assert!(EmbeddingConfig::new("a").with_part(2, 0).validate().is_err());
        assert!(EmbeddingConfig::new("a").with_part(1, 0).with_layout(1, 1).validate().is_ok());
        assert!(EmbeddingConfig::new("a").with_steps_to_live(-1).validate().is_err());
    }
}
