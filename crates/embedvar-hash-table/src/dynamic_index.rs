//! Segmented key index that grows without rehashing.
//!
//! The index is an append-only list of segments. Every segment is split into
//! the same number of stripes, and a key always maps to the same stripe in
//! every segment. A stripe is a preallocated map that is never allowed to
//! exceed its reserved capacity, so it never rehashes; when the key's stripe
//! is full in every segment, a new segment is appended.
//!
//! The segment list is published copy-on-write: readers clone the current
//! `Arc` and probe without holding any index-wide lock.

use std::hash::BuildHasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};

use crate::error::{HashTableError, Result};
use crate::key::EmbeddingKey;
use crate::slot::{SlotLayout, ValueSlot};
use crate::traits::{IndexSnapshot, KeyIndex};
use embedvar_tensor::Element;

/// Number of stripes in every segment.
pub const STRIPE_COUNT: usize = 16;

type Stripe<K, V> = RwLock<HashMap<K, Arc<ValueSlot<V>>, DefaultHashBuilder>>;

struct Segment<K, V> {
    stripes: Box<[Stripe<K, V>]>,
}

impl<K: EmbeddingKey, V: Element> Segment<K, V> {
    fn new(stripe_capacity: usize, hasher: &DefaultHashBuilder) -> Self {
        let stripes = (0..STRIPE_COUNT)
            .map(|_| RwLock::new(HashMap::with_capacity_and_hasher(stripe_capacity, hasher.clone())))
            .collect();
        Self { stripes }
    }

    fn get(&self, stripe: usize, key: &K) -> Option<Arc<ValueSlot<V>>> {
        self.stripes[stripe].read().get(key).cloned()
    }
}

/// A growable key index built from independently locked segments.
///
/// # Concurrency
///
/// * `find` takes only the read lock of one stripe per segment.
/// * Creation and removal for a key serialize on that key's stripe through a
///   dedicated mutex, so two segments can never both hold the same key.
/// * The slot for a new key is built before any lock is taken. If another
///   thread created the key first, the speculative slot is dropped.
///
/// # Example
///
/// ```
/// use embedvar_hash_table::{DynamicKeyIndex, KeyIndex, SlotLayout};
///
/// let index = DynamicKeyIndex::<i64, f32>::with_segment_capacity(32);
/// for key in 0..100 {
///     index.find_or_create(&key, SlotLayout::new(1, false));
/// }
/// assert_eq!(index.size(), 100);
/// assert!(index.segment_count() > 1);
/// ```
pub struct DynamicKeyIndex<K, V> {
    segments: RwLock<Arc<[Arc<Segment<K, V>>]>>,
    insert_locks: Box<[Mutex<()>]>,
    stripe_capacity: usize,
    len: AtomicUsize,
    hasher: DefaultHashBuilder,
}

impl<K: EmbeddingKey, V: Element> DynamicKeyIndex<K, V> {
    /// Creates an index whose segments each hold `segment_capacity` keys.
    pub fn with_segment_capacity(segment_capacity: usize) -> Self {
        let stripe_capacity = (segment_capacity / STRIPE_COUNT).max(1);
        let hasher = DefaultHashBuilder::default();
        let first = Arc::new(Segment::new(stripe_capacity, &hasher));
        Self {
            segments: RwLock::new(Arc::from(vec![first])),
            insert_locks: (0..STRIPE_COUNT).map(|_| Mutex::new(())).collect(),
            stripe_capacity,
            len: AtomicUsize::new(0),
            hasher,
        }
    }

    /// Number of segments allocated so far.
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Keys each segment can hold.
    pub fn segment_capacity(&self) -> usize {
        self.stripe_capacity * STRIPE_COUNT
    }

    #[inline]
    fn stripe_of(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) % STRIPE_COUNT as u64) as usize
    }

    #[inline]
    fn current(&self) -> Arc<[Arc<Segment<K, V>>]> {
        Arc::clone(&self.segments.read())
    }

    fn probe(&self, stripe: usize, key: &K) -> Option<Arc<ValueSlot<V>>> {
        self.current().iter().find_map(|segment| segment.get(stripe, key))
    }

    /// Places `slot` under `key`. The caller holds the stripe's insert mutex
    /// and has checked that the key is absent.
    fn place(&self, stripe: usize, key: K, slot: Arc<ValueSlot<V>>) {
        loop {
            let segments = self.current();
            for segment in segments.iter() {
                let mut map = segment.stripes[stripe].write();
                if map.len() < self.stripe_capacity {
                    map.insert(key, slot);
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            self.grow(segments.len());
        }
    }

    /// Appends a segment unless another thread already grew past
    /// `observed_len`.
    fn grow(&self, observed_len: usize) {
        let mut segments = self.segments.write();
        if segments.len() != observed_len {
            return;
        }
        let mut next: Vec<_> = segments.iter().cloned().collect();
        next.push(Arc::new(Segment::new(self.stripe_capacity, &self.hasher)));
        *segments = Arc::from(next);
        tracing::debug!(
            segments = segments.len(),
            capacity = segments.len() * self.segment_capacity(),
            "Key index grew"
        );
    }
}

impl<K: EmbeddingKey, V: Element> KeyIndex<K, V> for DynamicKeyIndex<K, V> {
    fn name(&self) -> &'static str {
        "dynamic"
    }

    fn find(&self, key: &K) -> Option<Arc<ValueSlot<V>>> {
        self.probe(self.stripe_of(key), key)
    }

    fn find_or_create(&self, key: &K, layout: SlotLayout) -> Arc<ValueSlot<V>> {
        let stripe = self.stripe_of(key);
        if let Some(slot) = self.probe(stripe, key) {
            return slot;
        }
        let speculative = Arc::new(ValueSlot::new(layout));
        let _guard = self.insert_locks[stripe].lock();
        if let Some(winner) = self.probe(stripe, key) {
            return winner;
        }
        self.place(stripe, key.clone(), Arc::clone(&speculative));
        speculative
    }

    fn insert(&self, key: K, slot: Arc<ValueSlot<V>>) -> Result<()> {
        let stripe = self.stripe_of(&key);
        let _guard = self.insert_locks[stripe].lock();
        if self.probe(stripe, &key).is_some() {
            return Err(HashTableError::AlreadyExists {
                key: format!("{key:?}"),
            });
        }
        self.place(stripe, key, slot);
        Ok(())
    }

    fn remove_if(&self, keys: &[K], predicate: &dyn Fn(&ValueSlot<V>) -> bool) -> usize {
        let mut removed = 0;
        for key in keys {
            let stripe = self.stripe_of(key);
            let _guard = self.insert_locks[stripe].lock();
            for segment in self.current().iter() {
                let mut map = segment.stripes[stripe].write();
                let evict = match map.get(key) {
                    Some(slot) => predicate(slot),
                    None => continue,
                };
                if evict {
                    map.remove(key);
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    removed += 1;
                }
                break;
            }
        }
        removed
    }

    fn snapshot(&self) -> IndexSnapshot<K, V> {
        let mut snapshot = IndexSnapshot::with_capacity(self.size());
        // A key removed and re-created mid-walk can be met in two segments.
        let mut seen = HashSet::with_capacity_and_hasher(self.size(), self.hasher.clone());
        for segment in self.current().iter() {
            for stripe in segment.stripes.iter() {
                for (key, slot) in stripe.read().iter() {
                    if seen.insert(key.clone()) {
                        snapshot.push(key, slot);
                    }
                }
            }
        }
        snapshot
    }

    fn size(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        let _guards: Vec<_> = self.insert_locks.iter().map(|lock| lock.lock()).collect();
        let first = Arc::new(Segment::new(self.stripe_capacity, &self.hasher));
        *self.segments.write() = Arc::from(vec![first]);
        self.len.store(0, Ordering::Relaxed);
    }

    fn memory_usage(&self) -> usize {
        let entry = std::mem::size_of::<(K, Arc<ValueSlot<V>>)>();
        let mut total = std::mem::size_of::<Self>();
        for segment in self.current().iter() {
            for stripe in segment.stripes.iter() {
                let map = stripe.read();
                total += map.capacity() * entry;
                total += map.values().map(|slot| slot.memory_size()).sum::<usize>();
            }
        }
        total
    }
}

impl<K: EmbeddingKey, V: Element> std::fmt::Debug for DynamicKeyIndex<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicKeyIndex")
            .field("len", &self.size())
            .field("segments", &self.segment_count())
            .field("segment_capacity", &self.segment_capacity())
            .finish()
    }
}
