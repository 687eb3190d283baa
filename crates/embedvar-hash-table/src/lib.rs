//! Concurrent embedding storage.
//!
//! This crate provides the in-memory key-to-vector store behind embedding
//! variables: a concurrent key index, versioned value slots, staleness
//! eviction and an optional disk tier.
//!
//! # Overview
//!
//! The main components are:
//!
//! - [`KeyIndex`] - The trait for thread-safe key-to-slot maps
//! - [`StaticKeyIndex`] - Open addressing behind one reader/writer lock
//! - [`DynamicKeyIndex`] - Segmented index that grows without rehashing
//! - [`ValueSlot`] - The per-key record of vectors plus a version word
//! - [`EmbeddingStore`] - The typed store built on a shared key index
//! - [`TieredStore`] - Byte-oriented backends for tiered mode
//!
//! # Example
//!
//! ```
//! use embedvar_hash_table::{EmbeddingConfig, StoreOptions, UninitializedStore};
//! use embedvar_tensor::HostTensor;
//!
//! let store = UninitializedStore::<i64, f32>::primary(
//!     EmbeddingConfig::new("item_emb").with_steps_to_live(100),
//!     StoreOptions::default(),
//! )
//! .unwrap()
//! .initialize(&HostTensor::vector(vec![0.0f32; 8]))
//! .unwrap();
//!
//! // Touch a few keys at different global steps.
//! for (key, step) in [(1, 10), (2, 500), (3, 900)] {
//!     store.lookup_or_create(&key, Some(step)).unwrap();
//! }
//!
//! // At step 1000 everything older than step 900 goes.
//! assert_eq!(store.shrink_to_config(1000).unwrap(), 2);
//! assert_eq!(store.size().unwrap(), 1);
//! ```

mod config;
mod dynamic_index;
mod error;
pub mod eviction;
mod group;
mod key;
mod restore;
mod slot;
mod static_index;
mod store;
pub mod tiered;
mod traits;

pub use config::{EmbeddingConfig, IndexVariant, StoreOptions, TieredStorageOptions};
pub use dynamic_index::{DynamicKeyIndex, STRIPE_COUNT};
pub use error::{HashTableError, Result};
pub use eviction::{EvictionPolicy, NoEviction, StepsToLiveEviction};
pub use group::SharedEmbeddingGroup;
pub use key::{decode_keys, partition_for, EmbeddingKey, KeyKind};
pub use restore::{ImportSummary, RestoreBuffer};
pub use slot::{SlotLayout, SlotPart, ValueSlot, UNVERSIONED};
pub use static_index::StaticKeyIndex;
pub use store::{EmbeddingSnapshot, EmbeddingStore, EmbeddingView, UninitializedStore};
pub use tiered::{MemoryTieredStore, RedbTieredStore, TieredStore};
pub use traits::{IndexSnapshot, KeyIndex};
