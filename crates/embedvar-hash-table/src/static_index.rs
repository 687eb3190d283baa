//! Open-addressing key index behind a single reader/writer lock.
//!
//! Lookups share the lock; creation, removal and growth take it exclusively.
//! Growth rehashes the whole table in place, briefly blocking every reader.

use std::hash::BuildHasher;
use std::sync::Arc;

use hashbrown::hash_map::DefaultHashBuilder;
use parking_lot::RwLock;

use crate::error::{HashTableError, Result};
use crate::key::EmbeddingKey;
use crate::slot::{SlotLayout, ValueSlot};
use crate::traits::{IndexSnapshot, KeyIndex};
use embedvar_tensor::Element;

/// Smallest table the index will allocate.
const MIN_CAPACITY: usize = 16;

enum Bucket<K, V> {
    Empty,
    Tombstone,
    Full(K, Arc<ValueSlot<V>>),
}

enum Probe {
    Found(usize),
    Vacant(usize),
}

struct Table<K, V> {
    buckets: Vec<Bucket<K, V>>,
    /// Live entries.
    live: usize,
    /// Live entries plus tombstones.
    used: usize,
}

impl<K: EmbeddingKey, V: Element> Table<K, V> {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        Self {
            buckets: (0..capacity).map(|_| Bucket::Empty).collect(),
            live: 0,
            used: 0,
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.buckets.len() - 1
    }

    /// Linear probe for `key`. Returns the matching bucket, or the first
    /// reusable one (tombstone or empty) on the probe path.
    fn probe(&self, key: &K, hash: u64) -> Probe {
        let mask = self.mask();
        let mut idx = hash as usize & mask;
        let mut first_free = None;
        for _ in 0..self.buckets.len() {
            match &self.buckets[idx] {
                Bucket::Empty => return Probe::Vacant(first_free.unwrap_or(idx)),
                Bucket::Tombstone => {
                    first_free.get_or_insert(idx);
                }
                Bucket::Full(existing, _) if existing == key => return Probe::Found(idx),
                Bucket::Full(..) => {}
            }
            idx = (idx + 1) & mask;
        }
        // Load is kept at or below one half, so a free bucket always exists.
        Probe::Vacant(first_free.unwrap_or(idx))
    }

    fn slot_at(&self, idx: usize) -> Option<&Arc<ValueSlot<V>>> {
        match &self.buckets[idx] {
            Bucket::Full(_, slot) => Some(slot),
            _ => None,
        }
    }

    fn put(&mut self, idx: usize, key: K, slot: Arc<ValueSlot<V>>) {
        if matches!(self.buckets[idx], Bucket::Empty) {
            self.used += 1;
        }
        self.buckets[idx] = Bucket::Full(key, slot);
        self.live += 1;
    }
}

/// A key index backed by one open-addressed table.
///
/// One hasher instance serves the index for its whole life, so a key's probe
/// sequence only changes when the table is resized.
///
/// # Example
///
/// ```
/// use embedvar_hash_table::{KeyIndex, SlotLayout, StaticKeyIndex};
///
/// let index = StaticKeyIndex::<i64, f32>::with_capacity(64);
/// let layout = SlotLayout::new(1, true);
///
/// let slot = index.find_or_create(&7, layout);
/// assert!(std::sync::Arc::ptr_eq(&slot, &index.find(&7).unwrap()));
/// assert_eq!(index.size(), 1);
/// ```
pub struct StaticKeyIndex<K, V> {
    table: RwLock<Table<K, V>>,
    initial_capacity: usize,
    hasher: DefaultHashBuilder,
}

impl<K: EmbeddingKey, V: Element> StaticKeyIndex<K, V> {
    /// Creates an index with room for `capacity` buckets before the first
    /// rehash. The bucket count is rounded up to a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: RwLock::new(Table::with_capacity(capacity)),
            initial_capacity: capacity,
            hasher: DefaultHashBuilder::default(),
        }
    }

    /// Current number of buckets.
    pub fn capacity(&self) -> usize {
        self.table.read().buckets.len()
    }

    /// Ratio of live entries to buckets.
    pub fn load_factor(&self) -> f64 {
        let table = self.table.read();
        table.live as f64 / table.buckets.len() as f64
    }

    #[inline]
    fn hash(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    /// Makes room for one more entry, rehashing under the caller's write lock
    /// when occupied buckets would exceed half the table.
    fn reserve_one(&self, table: &mut Table<K, V>) {
        if (table.used + 1) * 2 <= table.buckets.len() {
            return;
        }
        let target = ((table.live + 1) * 4).max(self.initial_capacity);
        let mut next = Table::with_capacity(target);
        for bucket in std::mem::take(&mut table.buckets) {
            if let Bucket::Full(key, slot) = bucket {
                let hash = self.hash(&key);
                if let Probe::Vacant(idx) = next.probe(&key, hash) {
                    next.put(idx, key, slot);
                }
            }
        }
        *table = next;
    }
}

impl<K: EmbeddingKey, V: Element> KeyIndex<K, V> for StaticKeyIndex<K, V> {
    fn name(&self) -> &'static str {
        "static"
    }

    fn find(&self, key: &K) -> Option<Arc<ValueSlot<V>>> {
        let hash = self.hash(key);
        let table = self.table.read();
        match table.probe(key, hash) {
            Probe::Found(idx) => table.slot_at(idx).cloned(),
            Probe::Vacant(_) => None,
        }
    }

    fn find_or_create(&self, key: &K, layout: SlotLayout) -> Arc<ValueSlot<V>> {
        if let Some(slot) = self.find(key) {
            return slot;
        }
        let hash = self.hash(key);
        let mut table = self.table.write();
        self.reserve_one(&mut table);
        let idx = match table.probe(key, hash) {
            Probe::Found(idx) => match table.slot_at(idx) {
                Some(winner) => return Arc::clone(winner),
                None => idx,
            },
            Probe::Vacant(idx) => idx,
        };
        let slot = Arc::new(ValueSlot::new(layout));
        table.put(idx, key.clone(), Arc::clone(&slot));
        slot
    }

    fn insert(&self, key: K, slot: Arc<ValueSlot<V>>) -> Result<()> {
        let hash = self.hash(&key);
        let mut table = self.table.write();
        self.reserve_one(&mut table);
        match table.probe(&key, hash) {
            Probe::Found(_) => Err(HashTableError::AlreadyExists {
                key: format!("{key:?}"),
            }),
            Probe::Vacant(idx) => {
                table.put(idx, key, slot);
                Ok(())
            }
        }
    }

    fn remove_if(&self, keys: &[K], predicate: &dyn Fn(&ValueSlot<V>) -> bool) -> usize {
        let mut table = self.table.write();
        let mut removed = 0;
        for key in keys {
            let hash = self.hash(key);
            if let Probe::Found(idx) = table.probe(key, hash) {
                let evict = table.slot_at(idx).map_or(false, |slot| predicate(slot));
                if evict {
                    table.buckets[idx] = Bucket::Tombstone;
                    table.live -= 1;
                    removed += 1;
                }
            }
        }
        removed
    }

    fn snapshot(&self) -> IndexSnapshot<K, V> {
        let table = self.table.read();
        let mut snapshot = IndexSnapshot::with_capacity(table.live);
        for bucket in &table.buckets {
            if let Bucket::Full(key, slot) = bucket {
                snapshot.push(key, slot);
            }
        }
        snapshot
    }

    fn size(&self) -> usize {
        self.table.read().live
    }

    fn clear(&self) {
        *self.table.write() = Table::with_capacity(self.initial_capacity);
    }

    fn memory_usage(&self) -> usize {
        let table = self.table.read();
        let slots: usize = table
            .buckets
            .iter()
            .filter_map(|bucket| match bucket {
                Bucket::Full(_, slot) => Some(slot.memory_size()),
                _ => None,
            })
            .sum();
        table.buckets.capacity() * std::mem::size_of::<Bucket<K, V>>()
            + slots
            + std::mem::size_of::<Self>()
    }
}

impl<K: EmbeddingKey, V: Element> std::fmt::Debug for StaticKeyIndex<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.read();
        f.debug_struct("StaticKeyIndex")
            .field("live", &table.live)
            .field("capacity", &table.buckets.len())
            .finish()
    }
}
