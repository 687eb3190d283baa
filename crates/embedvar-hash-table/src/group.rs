//! Ownership of the key index shared by the parts of one embedding.

use std::sync::{Arc, Weak};

use crate::error::{HashTableError, Result};
use crate::slot::SlotLayout;
use crate::traits::KeyIndex;

/// The key index and slot layout shared by every part of one embedding.
///
/// Exactly one store, the primary part, holds the group strongly. Other parts
/// hold a [`Weak`] reference, so dropping the primary destroys the index and
/// later operations on the remaining parts fail with
/// [`HashTableError::Detached`].
pub struct SharedEmbeddingGroup<K, V> {
    name: String,
    layout: SlotLayout,
    index: Box<dyn KeyIndex<K, V>>,
}

impl<K, V> SharedEmbeddingGroup<K, V> {
    pub(crate) fn new(name: String, layout: SlotLayout, index: Box<dyn KeyIndex<K, V>>) -> Self {
        Self {
            name,
            layout,
            index,
        }
    }

    /// Embedding name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot layout shared by all parts.
    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    /// The shared key index.
    pub fn index(&self) -> &dyn KeyIndex<K, V> {
        self.index.as_ref()
    }
}

impl<K, V> Drop for SharedEmbeddingGroup<K, V> {
    fn drop(&mut self) {
        let size = self.index.size();
        self.index.clear();
        tracing::debug!(name = %self.name, size, "Destroyed shared key index");
    }
}

impl<K, V> std::fmt::Debug for SharedEmbeddingGroup<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedEmbeddingGroup")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("index", &self.index.name())
            .finish()
    }
}

/// How a store reaches its group: owning for the primary, weak otherwise.
pub(crate) enum GroupHandle<K, V> {
    Owner(Arc<SharedEmbeddingGroup<K, V>>),
    Attached(Weak<SharedEmbeddingGroup<K, V>>),
}

impl<K, V> GroupHandle<K, V> {
    pub(crate) fn get(&self, name: &str) -> Result<Arc<SharedEmbeddingGroup<K, V>>> {
        match self {
            GroupHandle::Owner(group) => Ok(Arc::clone(group)),
            GroupHandle::Attached(weak) => weak.upgrade().ok_or_else(|| HashTableError::Detached {
                name: name.to_string(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<SharedEmbeddingGroup<K, V>> {
        match self {
            GroupHandle::Owner(group) => Arc::downgrade(group),
            GroupHandle::Attached(weak) => weak.clone(),
        }
    }
}
