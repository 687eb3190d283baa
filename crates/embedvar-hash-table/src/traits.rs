//! Core traits for concurrent key indexes.

use std::sync::Arc;

use crate::slot::{SlotLayout, ValueSlot};
use crate::Result;

/// A point-in-time listing of an index: parallel keys, slots and versions.
///
/// The snapshot shares the slots with the index. It keeps them alive but does
/// not freeze them: values may keep changing while the snapshot is consumed,
/// and keys inserted after the walk are absent. Each key appears at most once.
#[derive(Debug)]
pub struct IndexSnapshot<K, V> {
    /// Keys in walk order.
    pub keys: Vec<K>,
    /// Slot for each key, by row.
    pub slots: Vec<Arc<ValueSlot<V>>>,
    /// Version observed for each key during the walk.
    pub versions: Vec<i64>,
}

impl<K, V> IndexSnapshot<K, V> {
    /// Creates an empty snapshot with room for `capacity` rows.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            versions: Vec::with_capacity(capacity),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the snapshot has no rows.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<K: Clone, V: embedvar_tensor::Element> IndexSnapshot<K, V> {
    pub(crate) fn push(&mut self, key: &K, slot: &Arc<ValueSlot<V>>) {
        self.keys.push(key.clone());
        self.versions.push(slot.version_or_default());
        self.slots.push(Arc::clone(slot));
    }
}

/// A thread-safe map from keys to shared value slots.
///
/// All methods take `&self`; implementations synchronize internally and
/// never expose a slot that is still being constructed.
///
/// # Thread Safety
///
/// * `find_or_create` racing on the same absent key allocates exactly one
///   slot; every racer receives that slot.
/// * After `remove` returns, no later `find`/`find_or_create` returns the old
///   slot. Callers that obtained it earlier keep it alive through their `Arc`.
pub trait KeyIndex<K, V>: Send + Sync {
    /// Short name of the index variant, for logs.
    fn name(&self) -> &'static str;

    /// Non-creating lookup.
    fn find(&self, key: &K) -> Option<Arc<ValueSlot<V>>>;

    /// Returns the slot for `key`, creating an empty one with `layout` if absent.
    fn find_or_create(&self, key: &K, layout: SlotLayout) -> Arc<ValueSlot<V>>;

    /// Inserts a fully built slot.
    ///
    /// # Errors
    ///
    /// [`HashTableError::AlreadyExists`](crate::HashTableError::AlreadyExists)
    /// if the key is present; the supplied slot is dropped.
    fn insert(&self, key: K, slot: Arc<ValueSlot<V>>) -> Result<()>;

    /// Removes every key in `keys` whose slot satisfies `predicate`.
    ///
    /// The predicate is evaluated under the index's own synchronization, so
    /// it sees the slot state at the moment of removal. Returns the number of
    /// entries removed.
    fn remove_if(&self, keys: &[K], predicate: &dyn Fn(&ValueSlot<V>) -> bool) -> usize;

    /// Removes every key in `keys`. Returns the number of entries removed.
    fn remove(&self, keys: &[K]) -> usize {
        self.remove_if(keys, &|_| true)
    }

    /// Walks the index and lists every live entry.
    fn snapshot(&self) -> IndexSnapshot<K, V>;

    /// Number of live entries.
    fn size(&self) -> usize;

    /// Returns `true` if the index holds no entries.
    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drops every entry. Used when the owning group is destroyed.
    fn clear(&self);

    /// Approximate heap footprint in bytes, including slots.
    fn memory_usage(&self) -> usize;
}
