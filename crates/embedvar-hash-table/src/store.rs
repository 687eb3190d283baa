//! The embedding store: a typed, versioned key-to-vector table.
//!
//! A store is built in two steps. [`UninitializedStore`] carries the
//! configuration and the shared key index; [`UninitializedStore::initialize`]
//! validates the default vector and yields a ready [`EmbeddingStore`]. There
//! is no way to call a lookup on a store that has not been initialized.

use std::sync::{Arc, Weak};

use embedvar_tensor::{decode_slice, encode_slice, Element, HostTensor};

use crate::config::{EmbeddingConfig, StoreOptions};
use crate::error::{HashTableError, Result};
use crate::eviction::{EvictionPolicy, StepsToLiveEviction};
use crate::group::{GroupHandle, SharedEmbeddingGroup};
use crate::key::{partition_for, EmbeddingKey};
use crate::restore::{ImportSummary, RestoreBuffer};
use crate::slot::{SlotLayout, SlotPart, ValueSlot, UNVERSIONED};
use crate::tiered::{RedbTieredStore, TieredStore};
use crate::traits::KeyIndex;

/// A typed view over one part of a slot.
///
/// The view keeps the slot alive: it stays readable and writable even if the
/// key is removed from the store meanwhile.
#[derive(Debug, Clone)]
pub struct EmbeddingView<V> {
    slot: Arc<ValueSlot<V>>,
    part: Arc<SlotPart<V>>,
}

impl<V: Element> EmbeddingView<V> {
    /// Vector width.
    pub fn len(&self) -> usize {
        self.part.len()
    }

    /// Returns `true` for a zero-width vector.
    pub fn is_empty(&self) -> bool {
        self.part.is_empty()
    }

    /// Returns an owned copy of the vector.
    pub fn to_vec(&self) -> Vec<V> {
        self.part.to_vec()
    }

    /// Copies the vector into `out`, returning the number of elements copied.
    pub fn copy_to(&self, out: &mut [V]) -> usize {
        self.part.copy_to(out)
    }

    /// Overwrites the vector from `src`, returning the number of elements copied.
    pub fn copy_from(&self, src: &[V]) -> usize {
        self.part.copy_from(src)
    }

    /// Locks the vector for reading.
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, Box<[V]>> {
        self.part.read()
    }

    /// Locks the vector for writing.
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[V]>> {
        self.part.write()
    }

    /// The slot's version, if it carries one.
    pub fn version(&self) -> Option<i64> {
        self.slot.version()
    }

    /// The whole slot this view points into.
    pub fn slot(&self) -> &Arc<ValueSlot<V>> {
        &self.slot
    }
}

/// A point-in-time listing of one store part.
///
/// Rows are the keys whose slot has this part allocated. Values are read
/// lazily through [`part`](Self::part), so producing a snapshot copies no
/// vectors.
#[derive(Debug)]
pub struct EmbeddingSnapshot<K, V> {
    /// Keys in walk order.
    pub keys: Vec<K>,
    /// Slot of each key.
    pub slots: Vec<Arc<ValueSlot<V>>>,
    /// Version of each key at walk time.
    pub versions: Vec<i64>,
    part_index: usize,
    value_len: usize,
}

impl<K, V: Element> EmbeddingSnapshot<K, V> {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Vector width of the snapshotted part.
    pub fn value_len(&self) -> usize {
        self.value_len
    }

    /// The snapshotted part of row `row`.
    pub fn part(&self, row: usize) -> Option<&Arc<SlotPart<V>>> {
        self.slots.get(row)?.part(self.part_index)
    }

    /// Appends row `row`'s vector to `out` as little-endian bytes.
    ///
    /// Returns `false` if the row does not exist.
    pub fn write_value_le(&self, row: usize, out: &mut Vec<u8>) -> bool {
        match self.part(row) {
            Some(part) => {
                encode_slice(&part.read(), out);
                true
            }
            None => false,
        }
    }
}

/// A store that has been configured but not yet given its default vector.
pub struct UninitializedStore<K, V> {
    config: EmbeddingConfig,
    options: StoreOptions,
    group: GroupHandle<K, V>,
    tiered: Option<Box<dyn TieredStore>>,
}

impl<K: EmbeddingKey, V: Element> UninitializedStore<K, V> {
    /// Configures the primary part of an embedding, creating its key index
    /// from `options`.
    pub fn primary(config: EmbeddingConfig, options: StoreOptions) -> Result<Self> {
        let index = options.build_index();
        Self::primary_with_index(config, options, index)
    }

    /// Configures the primary part on top of a caller-supplied key index.
    pub fn primary_with_index(
        config: EmbeddingConfig,
        options: StoreOptions,
        index: Box<dyn KeyIndex<K, V>>,
    ) -> Result<Self> {
        config.validate()?;
        if !config.is_primary() {
            return Err(HashTableError::InvalidArgument(format!(
                "{config} is not the primary part"
            )));
        }
        let layout = SlotLayout::new(config.total_parts(), options.versioning_enabled);
        let group = SharedEmbeddingGroup::new(config.name.clone(), layout, index);
        Ok(Self {
            config,
            options,
            group: GroupHandle::Owner(Arc::new(group)),
            tiered: None,
        })
    }

    /// Configures a non-primary part sharing `primary`'s key index.
    ///
    /// The part inherits the primary's options except the value width, which
    /// comes from its own default vector.
    pub fn attached(config: EmbeddingConfig, primary: &EmbeddingStore<K, V>) -> Result<Self> {
        Self::attached_to_group(config, primary.options.clone(), primary.group_handle())
    }

    /// Configures a non-primary part from a weak group reference.
    ///
    /// # Errors
    ///
    /// [`HashTableError::Detached`] if the primary is already gone, and
    /// [`HashTableError::InvalidArgument`] if the part's layout disagrees with
    /// the group's.
    pub fn attached_to_group(
        config: EmbeddingConfig,
        options: StoreOptions,
        group: Weak<SharedEmbeddingGroup<K, V>>,
    ) -> Result<Self> {
        config.validate()?;
        if config.is_primary() {
            return Err(HashTableError::InvalidArgument(format!(
                "{config} is a primary part and cannot attach"
            )));
        }
        let shared = group.upgrade().ok_or_else(|| HashTableError::Detached {
            name: config.name.clone(),
        })?;
        if shared.layout().parts() != config.total_parts() {
            return Err(HashTableError::InvalidArgument(format!(
                "{config} expects {} parts but the group has {}",
                config.total_parts(),
                shared.layout().parts()
            )));
        }
        drop(shared);

        // Each part keeps its own tier database.
        let mut options = options.with_value_width(0);
        if let Some(path) = options.tiered_storage.path.take() {
            let part_path = path.with_extension(format!("part{}.redb", config.embedding_index));
            options.tiered_storage.path = Some(part_path);
        }
        Ok(Self {
            config,
            options,
            group: GroupHandle::Attached(group),
            tiered: None,
        })
    }

    /// Routes tiered storage to `backend` instead of opening a redb file.
    /// Only takes effect if tiered storage is enabled in the options.
    pub fn with_tiered_store(mut self, backend: Box<dyn TieredStore>) -> Self {
        self.tiered = Some(backend);
        self
    }

    /// Validates `default_value` and returns a ready store.
    ///
    /// # Errors
    ///
    /// * [`HashTableError::InvalidArgument`] if the default is not rank-1, is
    ///   empty, or has a different element type than the store.
    /// * [`HashTableError::DimensionMismatch`] if a configured value width
    ///   differs from the default's length.
    /// * [`HashTableError::Detached`] if a non-primary part lost its primary.
    /// * [`HashTableError::Tier`] if the tiered backend cannot be opened.
    pub fn initialize(self, default_value: &HostTensor) -> Result<EmbeddingStore<K, V>> {
        if default_value.ndim() != 1 {
            return Err(HashTableError::InvalidArgument(format!(
                "default value must be 1-D, got shape {}",
                default_value.shape()
            )));
        }
        let values = default_value.as_slice::<V>()?;
        if values.is_empty() {
            return Err(HashTableError::InvalidArgument(
                "default value must not be empty".to_string(),
            ));
        }
        let width = self.options.value_width;
        if width != 0 && width != values.len() {
            return Err(HashTableError::DimensionMismatch {
                expected: width,
                actual: values.len(),
            });
        }
        let group = self.group.get(&self.config.name)?;

        let tiered = if self.options.tiered_storage.enabled {
            match self.tiered {
                Some(backend) => Some(backend),
                None => {
                    let backend = match &self.options.tiered_storage.path {
                        Some(path) => RedbTieredStore::open(path)?,
                        None => RedbTieredStore::open_temporary(&self.config.name)?,
                    };
                    Some(Box::new(backend) as Box<dyn TieredStore>)
                }
            }
        } else {
            None
        };

        tracing::info!(
            embedding = %self.config,
            value_len = values.len(),
            index = group.index().name(),
            versioned = group.layout().has_version(),
            tiered = tiered.as_ref().map(|t| t.name()),
            "Initialized embedding store"
        );

        Ok(EmbeddingStore {
            options: self.options.with_value_width(values.len()),
            config: self.config,
            group: self.group,
            default_value: values.into(),
            tiered,
        })
    }
}

/// A ready embedding store for one part of an embedding.
///
/// All methods take `&self` and may be called from any number of threads.
///
/// # Example
///
/// ```
/// use embedvar_hash_table::{EmbeddingConfig, StoreOptions, UninitializedStore};
/// use embedvar_tensor::HostTensor;
///
/// let store = UninitializedStore::<i64, f32>::primary(
///     EmbeddingConfig::new("user_emb"),
///     StoreOptions::default(),
/// )
/// .unwrap()
/// .initialize(&HostTensor::vector(vec![0.5f32; 4]))
/// .unwrap();
///
/// let view = store.lookup_or_create(&42, Some(7)).unwrap();
/// assert_eq!(view.to_vec(), vec![0.5; 4]);
/// assert_eq!(store.get_version(&42).unwrap(), Some(7));
/// assert_eq!(store.size().unwrap(), 1);
/// ```
pub struct EmbeddingStore<K, V> {
    config: EmbeddingConfig,
    options: StoreOptions,
    group: GroupHandle<K, V>,
    default_value: Box<[V]>,
    tiered: Option<Box<dyn TieredStore>>,
}

impl<K: EmbeddingKey, V: Element> EmbeddingStore<K, V> {
    /// Embedding configuration.
    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    /// Options the store was built with; `value_width` is always resolved.
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Embedding name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns `true` for the part that owns the shared index.
    pub fn is_primary(&self) -> bool {
        self.config.is_primary()
    }

    /// Vector width.
    pub fn value_len(&self) -> usize {
        self.default_value.len()
    }

    /// The store's default vector.
    pub fn default_value(&self) -> &[V] {
        &self.default_value
    }

    /// Returns `true` if vectors live in the tiered backend.
    pub fn use_tiered_store(&self) -> bool {
        self.tiered.is_some()
    }

    /// A weak reference to the shared group, for attaching further parts.
    pub fn group_handle(&self) -> Weak<SharedEmbeddingGroup<K, V>> {
        self.group.downgrade()
    }

    fn group(&self) -> Result<Arc<SharedEmbeddingGroup<K, V>>> {
        self.group.get(&self.config.name)
    }

    fn check_width(&self, actual: usize) -> Result<()> {
        if actual != self.value_len() {
            return Err(HashTableError::DimensionMismatch {
                expected: self.value_len(),
                actual,
            });
        }
        Ok(())
    }

    fn stamps_versions(&self) -> bool {
        self.is_primary() && self.options.versioning_enabled
    }

    fn require_in_memory(&self, operation: &str) -> Result<()> {
        if self.tiered.is_some() {
            return Err(HashTableError::InvalidArgument(format!(
                "{operation} is unavailable on tiered store {}; use the hybrid_* calls",
                self.config
            )));
        }
        Ok(())
    }

    fn encode_key(key: &K) -> Vec<u8> {
        let mut encoded = Vec::new();
        key.encode(&mut encoded);
        encoded
    }

    fn encode_value(values: &[V]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(values.len() * V::DTYPE.size_in_bytes());
        encode_slice(values, &mut bytes);
        bytes
    }

    /// Returns the vector for `key`, creating it from the default vector if
    /// absent. If `version` is given, the slot's version is stamped with it.
    ///
    /// In-memory only: on a tiered store this and the other slot-level calls
    /// return [`HashTableError::InvalidArgument`].
    pub fn lookup_or_create(&self, key: &K, version: Option<i64>) -> Result<EmbeddingView<V>> {
        let slot = self.lookup_value_ptr(key)?;
        self.materialize_with(slot, &self.default_value, version)
    }

    /// Like [`lookup_or_create`](Self::lookup_or_create), but a newly created
    /// vector is initialized from `default_value` instead of the store's own.
    pub fn lookup_or_create_with_default(
        &self,
        key: &K,
        default_value: &[V],
        version: Option<i64>,
    ) -> Result<EmbeddingView<V>> {
        self.check_width(default_value.len())?;
        let slot = self.lookup_value_ptr(key)?;
        self.materialize_with(slot, default_value, version)
    }

    /// Returns the raw slot for `key`, creating an empty slot if absent.
    ///
    /// No vector is allocated in the slot; use [`materialize`](Self::materialize)
    /// to obtain one.
    pub fn lookup_value_ptr(&self, key: &K) -> Result<Arc<ValueSlot<V>>> {
        self.require_in_memory("lookup_value_ptr")?;
        let group = self.group()?;
        Ok(group.index().find_or_create(key, group.layout()))
    }

    /// Turns a slot from [`lookup_value_ptr`](Self::lookup_value_ptr) into a
    /// view of this part, allocating it from the default vector if needed.
    ///
    /// # Errors
    ///
    /// [`HashTableError::InvalidArgument`] if the slot belongs to a group with
    /// fewer parts than this store's index.
    pub fn materialize(&self, slot: Arc<ValueSlot<V>>, version: Option<i64>) -> Result<EmbeddingView<V>> {
        self.require_in_memory("materialize")?;
        self.materialize_with(slot, &self.default_value, version)
    }

    fn materialize_with(
        &self,
        slot: Arc<ValueSlot<V>>,
        init: &[V],
        version: Option<i64>,
    ) -> Result<EmbeddingView<V>> {
        let part = slot
            .get_or_allocate(self.config.embedding_index, init)
            .map(Arc::clone)
            .ok_or_else(|| {
                HashTableError::InvalidArgument(format!(
                    "slot has {} parts, part {} does not exist",
                    slot.num_parts(),
                    self.config.embedding_index
                ))
            })?;
        if let Some(version) = version {
            if self.stamps_versions() {
                slot.set_version(version);
            }
        }
        Ok(EmbeddingView { slot, part })
    }

    /// Non-creating lookup of this part's vector.
    pub fn find(&self, key: &K) -> Result<Option<EmbeddingView<V>>> {
        self.require_in_memory("find")?;
        let group = self.group()?;
        let view = group.index().find(key).and_then(|slot| {
            let part = Arc::clone(slot.part(self.config.embedding_index)?);
            Some(EmbeddingView { slot, part })
        });
        Ok(view)
    }

    /// Version of an existing key. `None` if the key is absent or the store
    /// is unversioned.
    pub fn get_version(&self, key: &K) -> Result<Option<i64>> {
        self.require_in_memory("get_version")?;
        let group = self.group()?;
        Ok(group.index().find(key).and_then(|slot| slot.version()))
    }

    /// Writes `values` for `key`, through the tiered backend if enabled.
    ///
    /// # Errors
    ///
    /// Width mismatches, and tiered backend write failures.
    pub fn hybrid_insert(&self, key: &K, values: &[V]) -> Result<()> {
        self.check_width(values.len())?;
        match &self.tiered {
            Some(tier) => tier.insert(&Self::encode_key(key), &Self::encode_value(values)),
            None => {
                self.lookup_or_create(key, None)?.copy_from(values);
                Ok(())
            }
        }
    }

    /// Reads the vector for `key` into `out`, creating it if absent.
    ///
    /// In tiered mode nothing is created: a miss, a backend error or a stored
    /// value of the wrong width all yield the default vector (`default_value`
    /// if given, otherwise the store's). Only a wrongly sized `out` or
    /// `default_value` is reported as an error.
    pub fn hybrid_lookup_or_create(
        &self,
        key: &K,
        out: &mut [V],
        default_value: Option<&[V]>,
    ) -> Result<()> {
        self.check_width(out.len())?;
        if let Some(default_value) = default_value {
            self.check_width(default_value.len())?;
        }
        let default_value = default_value.unwrap_or(&self.default_value);

        let Some(tier) = &self.tiered else {
            let slot = self.lookup_value_ptr(key)?;
            self.materialize_with(slot, default_value, None)?.copy_to(out);
            return Ok(());
        };

        match tier.lookup(&Self::encode_key(key)) {
            Ok(Some(bytes)) => match decode_slice::<V>(&bytes) {
                Ok(stored) if stored.len() == out.len() => {
                    out.copy_from_slice(&stored);
                    return Ok(());
                }
                Ok(stored) => tracing::warn!(
                    name = %self.config.name,
                    key = ?key,
                    stored = stored.len(),
                    expected = out.len(),
                    "Tiered value has wrong width, using default"
                ),
                Err(e) => tracing::warn!(
                    name = %self.config.name,
                    key = ?key,
                    error = %e,
                    "Undecodable tiered value, using default"
                ),
            },
            Ok(None) => {
                tracing::trace!(name = %self.config.name, key = ?key, "Tiered miss");
            }
            Err(e) => tracing::warn!(
                name = %self.config.name,
                key = ?key,
                error = %e,
                "Tiered lookup failed, using default"
            ),
        }
        out.copy_from_slice(default_value);
        Ok(())
    }

    /// Bulk-loads parallel key, value and version arrays.
    ///
    /// Restore-time semantics: a row whose key already has this part
    /// allocated is skipped and its buffer discarded (first writer wins).
    /// On a tiered store rows are written to the tiered backend instead, a
    /// key already stored there counts as existing, and versions are dropped.
    ///
    /// # Errors
    ///
    /// Length mismatches, and tiered backend failures.
    pub fn import(&self, keys: &[K], values: &[V], versions: &[i64]) -> Result<ImportSummary> {
        if values.len() != keys.len() * self.value_len() {
            return Err(HashTableError::DimensionMismatch {
                expected: keys.len() * self.value_len(),
                actual: values.len(),
            });
        }
        if versions.len() != keys.len() {
            return Err(HashTableError::DimensionMismatch {
                expected: keys.len(),
                actual: versions.len(),
            });
        }
        let group = self.group()?;
        let mut summary = ImportSummary::default();
        for (i, key) in keys.iter().enumerate() {
            let row = &values[i * self.value_len()..(i + 1) * self.value_len()];
            self.import_row(&group, key, row, versions[i], &mut summary)?;
        }
        tracing::info!(
            name = %self.config.name,
            imported = summary.imported,
            skipped_existing = summary.skipped_existing,
            "Imported embedding rows"
        );
        Ok(summary)
    }

    /// Bulk-loads the first `key_count` rows of `buffer` that belong to
    /// `partition_id`, where a key's partition is
    /// `key mod bucket_count mod partition_count`.
    pub fn partitioned_import(
        &self,
        buffer: &RestoreBuffer<K, V>,
        key_count: usize,
        bucket_count: u64,
        partition_id: u64,
        partition_count: u64,
    ) -> Result<ImportSummary> {
        if bucket_count == 0 || partition_count == 0 {
            return Err(HashTableError::InvalidArgument(format!(
                "bucket_count ({bucket_count}) and partition_count ({partition_count}) must be positive"
            )));
        }
        if partition_id >= partition_count {
            return Err(HashTableError::InvalidArgument(format!(
                "partition_id {partition_id} out of range for {partition_count} partitions"
            )));
        }
        if key_count > buffer.len() {
            return Err(HashTableError::InvalidArgument(format!(
                "key_count {key_count} exceeds restore buffer of {} rows",
                buffer.len()
            )));
        }
        self.check_width(buffer.value_len())?;

        let group = self.group()?;
        let mut summary = ImportSummary::default();
        for i in 0..key_count {
            let Some((key, row, version)) = buffer.row(i) else {
                break;
            };
            if partition_for(key, bucket_count, partition_count) != partition_id {
                tracing::trace!(name = %self.config.name, key = ?key, "Skipped key of another partition");
                summary.skipped_partition += 1;
                continue;
            }
            self.import_row(&group, key, row, version, &mut summary)?;
        }
        tracing::info!(
            name = %self.config.name,
            partition_id,
            partition_count,
            imported = summary.imported,
            skipped_existing = summary.skipped_existing,
            skipped_partition = summary.skipped_partition,
            "Imported embedding partition"
        );
        Ok(summary)
    }

    fn import_row(
        &self,
        group: &SharedEmbeddingGroup<K, V>,
        key: &K,
        row: &[V],
        version: i64,
        summary: &mut ImportSummary,
    ) -> Result<()> {
        let imported = match &self.tiered {
            Some(tier) => {
                let encoded_key = Self::encode_key(key);
                let absent = tier.lookup(&encoded_key)?.is_none();
                if absent {
                    tier.insert(&encoded_key, &Self::encode_value(row))?;
                }
                absent
            }
            None => {
                let slot = group.index().find_or_create(key, group.layout());
                let allocated = slot.try_allocate(self.config.embedding_index, row);
                if allocated && self.stamps_versions() {
                    slot.set_version(version);
                }
                allocated
            }
        };
        if imported {
            summary.imported += 1;
        } else {
            tracing::debug!(name = %self.config.name, key = ?key, "Import skipped existing key");
            summary.skipped_existing += 1;
        }
        Ok(())
    }

    /// Lists every key whose slot has this part allocated.
    ///
    /// A tiered store is listed from its backend: each stored vector is
    /// copied into a detached slot, with version [`UNVERSIONED`].
    pub fn snapshot(&self) -> Result<EmbeddingSnapshot<K, V>> {
        let group = self.group()?;
        if let Some(tier) = &self.tiered {
            return self.tiered_snapshot(tier.as_ref(), group.layout());
        }
        let raw = group.index().snapshot();
        let part_index = self.config.embedding_index;
        let mut snapshot = EmbeddingSnapshot {
            keys: Vec::with_capacity(raw.len()),
            slots: Vec::with_capacity(raw.len()),
            versions: Vec::with_capacity(raw.len()),
            part_index,
            value_len: self.value_len(),
        };
        let rows = raw.keys.into_iter().zip(raw.slots).zip(raw.versions);
        for ((key, slot), version) in rows {
            if slot.part(part_index).is_some() {
                snapshot.keys.push(key);
                snapshot.slots.push(slot);
                snapshot.versions.push(version);
            }
        }
        Ok(snapshot)
    }

    fn tiered_snapshot(&self, tier: &dyn TieredStore, layout: SlotLayout) -> Result<EmbeddingSnapshot<K, V>> {
        let entries = tier.entries()?;
        let part_index = self.config.embedding_index;
        let mut snapshot = EmbeddingSnapshot {
            keys: Vec::with_capacity(entries.len()),
            slots: Vec::with_capacity(entries.len()),
            versions: Vec::with_capacity(entries.len()),
            part_index,
            value_len: self.value_len(),
        };
        for (encoded_key, bytes) in entries {
            let key = match K::decode(&encoded_key) {
                Some((key, used)) if used == encoded_key.len() => key,
                _ => {
                    tracing::warn!(name = %self.config.name, "Skipped undecodable tiered key");
                    continue;
                }
            };
            let values = match decode_slice::<V>(&bytes) {
                Ok(values) if values.len() == self.value_len() => values,
                _ => {
                    tracing::warn!(name = %self.config.name, key = ?key, "Skipped malformed tiered value");
                    continue;
                }
            };
            snapshot.keys.push(key);
            snapshot
                .slots
                .push(Arc::new(ValueSlot::with_part(layout, part_index, &values, UNVERSIONED)));
            snapshot.versions.push(UNVERSIONED);
        }
        Ok(snapshot)
    }

    /// Removes every entry whose version is older than
    /// `global_step - steps_to_live`. A `steps_to_live` of zero is a no-op.
    ///
    /// Returns the number of entries removed.
    pub fn shrink(&self, steps_to_live: i64, global_step: i64) -> Result<usize> {
        if steps_to_live < 0 {
            return Err(HashTableError::InvalidArgument(format!(
                "steps_to_live must be non-negative, got {steps_to_live}"
            )));
        }
        self.shrink_with_policy(&StepsToLiveEviction::new(steps_to_live), global_step)
    }

    /// Shrinks with the staleness window from the embedding configuration.
    pub fn shrink_to_config(&self, global_step: i64) -> Result<usize> {
        self.shrink(self.config.steps_to_live, global_step)
    }

    /// Removes every entry `policy` marks as evictable at `global_step`.
    ///
    /// Works in three steps and holds no index-wide lock throughout: take a
    /// snapshot, pick candidates from the snapshot versions, then remove the
    /// candidates while re-checking each one's current version. A key touched
    /// after the snapshot is therefore kept.
    ///
    /// Only the primary part shrinks; on other parts, on unversioned stores
    /// and on tiered stores, this is a no-op.
    pub fn shrink_with_policy(&self, policy: &dyn EvictionPolicy, global_step: i64) -> Result<usize> {
        let group = self.group()?;
        if policy.is_disabled() || !self.stamps_versions() || self.tiered.is_some() {
            return Ok(0);
        }
        let index = group.index();
        let raw = index.snapshot();
        let candidates: Vec<K> = raw
            .keys
            .into_iter()
            .zip(raw.versions)
            .filter(|(_, version)| policy.should_evict(*version, global_step))
            .map(|(key, _)| key)
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }
        let removed = index.remove_if(&candidates, &|slot| {
            policy.should_evict(slot.version_or_default(), global_step)
        });
        tracing::info!(
            name = %self.config.name,
            global_step,
            candidates = candidates.len(),
            removed,
            remaining = index.size(),
            "Shrank embedding store"
        );
        Ok(removed)
    }

    /// Number of keys in the shared index. Always zero on a tiered store.
    pub fn size(&self) -> Result<usize> {
        Ok(self.group()?.index().size())
    }

    /// Number of keys in the tiered backend if enabled, otherwise [`size`](Self::size).
    pub fn hybrid_size(&self) -> Result<usize> {
        match &self.tiered {
            Some(tier) => tier.size(),
            None => self.size(),
        }
    }

    /// Approximate heap footprint in bytes of the shared index and this
    /// part's default vector.
    pub fn memory_usage(&self) -> Result<usize> {
        let group = self.group()?;
        Ok(group.index().memory_usage() + self.default_value.len() * std::mem::size_of::<V>())
    }
}

impl<K, V> std::fmt::Debug for EmbeddingStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingStore")
            .field("config", &self.config)
            .field("value_len", &self.default_value.len())
            .field("primary", &self.config.is_primary())
            .field("tiered", &self.tiered.as_ref().map(|t| t.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexVariant;
    use crate::tiered::MemoryTieredStore;

    fn new_store(options: StoreOptions) -> EmbeddingStore<i64, f32> {
        UninitializedStore::primary(EmbeddingConfig::new("emb"), options)
            .unwrap()
            .initialize(&HostTensor::vector(vec![1.5f32; 4]))
            .unwrap()
    }

    #[test]
    fn test_initialize_rejects_bad_defaults() {
        let make = || {
            UninitializedStore::<i64, f32>::primary(EmbeddingConfig::new("e"), StoreOptions::default())
                .unwrap()
        };
        let matrix = HostTensor::filled(0.0f32, embedvar_tensor::Shape::matrix(2, 2));
        assert!(matches!(
            make().initialize(&matrix),
            Err(HashTableError::InvalidArgument(_))
        ));
        assert!(matches!(
            make().initialize(&HostTensor::vector(vec![0i64; 4])),
            Err(HashTableError::InvalidArgument(_))
        ));
        assert!(matches!(
            make().initialize(&HostTensor::vector(Vec::<f32>::new())),
            Err(HashTableError::InvalidArgument(_))
        ));

        let sized = UninitializedStore::<i64, f32>::primary(
            EmbeddingConfig::new("e"),
            StoreOptions::default().with_value_width(8),
        )
        .unwrap();
        assert!(matches!(
            sized.initialize(&HostTensor::vector(vec![0.0f32; 4])),
            Err(HashTableError::DimensionMismatch { expected: 8, actual: 4 })
        ));
    }

    #[test]
    fn test_primary_requires_primary_config() {
        let config = EmbeddingConfig::new("e").with_part(1, 0).with_layout(2, 0);
        assert!(UninitializedStore::<i64, f32>::primary(config, StoreOptions::default()).is_err());
    }

    #[test]
    fn test_lookup_or_create_returns_default_then_written_value() {
        let store = new_store(StoreOptions::default());
        let view = store.lookup_or_create(&1, None).unwrap();
        assert_eq!(view.to_vec(), vec![1.5; 4]);
        view.copy_from(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(store.lookup_or_create(&1, None).unwrap().to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(store.options().value_width, 4);
    }

    #[test]
    fn test_lookup_with_default_override() {
        let store = new_store(StoreOptions::default());
        let view = store.lookup_or_create_with_default(&5, &[0.0; 4], Some(3)).unwrap();
        assert_eq!(view.to_vec(), vec![0.0; 4]);
        assert_eq!(view.version(), Some(3));
        assert!(store.lookup_or_create_with_default(&6, &[0.0; 3], None).is_err());
    }

    #[test]
    fn test_lookup_value_ptr_then_materialize() {
        let store = new_store(StoreOptions::default());
        let slot = store.lookup_value_ptr(&9).unwrap();
        assert!(slot.part(0).is_none());
        assert!(store.find(&9).unwrap().is_none());
        let view = store.materialize(slot, Some(12)).unwrap();
        assert_eq!(view.to_vec(), vec![1.5; 4]);
        assert_eq!(store.get_version(&9).unwrap(), Some(12));
        assert!(store.find(&9).unwrap().is_some());
    }

    #[test]
    fn test_unversioned_store_ignores_versions() {
        let store = new_store(StoreOptions::default().with_versioning(false));
        store.lookup_or_create(&1, Some(100)).unwrap();
        assert_eq!(store.get_version(&1).unwrap(), None);
        assert_eq!(store.shrink(1, 1_000).unwrap(), 0);
        assert_eq!(store.size().unwrap(), 1);
    }

    #[test]
    fn test_shrink_threshold() {
        for variant in [IndexVariant::Static, IndexVariant::Dynamic] {
            let store = new_store(StoreOptions::default().with_index_variant(variant));
            for key in 0..10 {
                store.lookup_or_create(&key, Some(key)).unwrap();
            }
            assert_eq!(store.shrink(0, 100).unwrap(), 0);
            assert_eq!(store.size().unwrap(), 10);

            // Threshold 10 - 4 = 6: versions 0..=5 go, 6..=9 stay.
            assert_eq!(store.shrink(4, 10).unwrap(), 6);
            let mut keys = store.snapshot().unwrap().keys;
            keys.sort_unstable();
            assert_eq!(keys, vec![6, 7, 8, 9]);
            assert!(store.shrink(-1, 10).is_err());
        }
    }

    #[test]
    fn test_removed_key_recreated_from_default() {
        let store = new_store(StoreOptions::default());
        let view = store.lookup_or_create(&1, Some(1)).unwrap();
        view.copy_from(&[9.0; 4]);
        assert_eq!(store.shrink(1, 10).unwrap(), 1);
        // The old view still reads its buffer.
        assert_eq!(view.to_vec(), vec![9.0; 4]);
        assert_eq!(store.lookup_or_create(&1, None).unwrap().to_vec(), vec![1.5; 4]);
    }

    #[test]
    fn test_import_first_writer_wins() {
        let store = new_store(StoreOptions::default());
        store.lookup_or_create(&2, Some(0)).unwrap();
        let summary = store
            .import(&[1, 2, 3], &[1.0; 12], &[10, 20, 30])
            .unwrap();
        assert_eq!(summary.imported, 2);
        assert_eq!(summary.skipped_existing, 1);
        assert_eq!(store.find(&2).unwrap().unwrap().to_vec(), vec![1.5; 4]);
        assert_eq!(store.get_version(&2).unwrap(), Some(0));
        assert_eq!(store.get_version(&3).unwrap(), Some(30));
        assert!(store.import(&[4], &[1.0; 3], &[0]).is_err());
    }

    #[test]
    fn test_partitioned_import_routes_by_key() {
        let keys: Vec<i64> = (-5..15).collect();
        let values: Vec<f32> = keys.iter().flat_map(|k| vec![*k as f32; 4]).collect();
        let buffer = RestoreBuffer::new(keys.clone(), values, vec![1; keys.len()], 4).unwrap();

        let mut total = 0;
        for partition_id in 0..3 {
            let store = new_store(StoreOptions::default());
            let summary = store
                .partitioned_import(&buffer, buffer.len(), 10, partition_id, 3)
                .unwrap();
            assert_eq!(summary.total(), keys.len());
            for key in &keys {
                let owned = key.rem_euclid(10) as u64 % 3 == partition_id;
                assert_eq!(store.find(key).unwrap().is_some(), owned, "key {key}");
            }
            total += summary.imported;
        }
        assert_eq!(total, keys.len());

        let store = new_store(StoreOptions::default());
        assert!(store.partitioned_import(&buffer, 1, 10, 3, 3).is_err());
        assert!(store.partitioned_import(&buffer, 1, 0, 0, 3).is_err());
        assert!(store.partitioned_import(&buffer, 100, 10, 0, 3).is_err());
    }

    #[test]
    fn test_hybrid_in_memory_path() {
        let store = new_store(StoreOptions::default());
        assert!(!store.use_tiered_store());
        store.hybrid_insert(&3, &[4.0; 4]).unwrap();
        let mut out = [0.0f32; 4];
        store.hybrid_lookup_or_create(&3, &mut out, None).unwrap();
        assert_eq!(out, [4.0; 4]);
        store.hybrid_lookup_or_create(&4, &mut out, Some(&[7.0; 4])).unwrap();
        assert_eq!(out, [7.0; 4]);
        assert_eq!(store.hybrid_size().unwrap(), 2);
    }

    #[test]
    fn test_hybrid_tiered_path() {
        let store = UninitializedStore::<String, f32>::primary(
            EmbeddingConfig::new("tiered"),
            StoreOptions::default().with_tiered_storage(None),
        )
        .unwrap()
        .with_tiered_store(Box::new(MemoryTieredStore::new()))
        .initialize(&HostTensor::vector(vec![2.0f32; 2]))
        .unwrap();
        assert!(store.use_tiered_store());

        let key = "user:1".to_string();
        let mut out = [0.0f32; 2];
        store.hybrid_lookup_or_create(&key, &mut out, None).unwrap();
        assert_eq!(out, [2.0; 2]);
        assert_eq!(store.hybrid_size().unwrap(), 0);

        store.hybrid_insert(&key, &[5.0, 6.0]).unwrap();
        store.hybrid_lookup_or_create(&key, &mut out, None).unwrap();
        assert_eq!(out, [5.0, 6.0]);
        assert_eq!(store.hybrid_size().unwrap(), 1);
        assert_eq!(store.size().unwrap(), 0);

        for result in [
            store.lookup_or_create(&key, None).map(|_| ()),
            store.lookup_value_ptr(&key).map(|_| ()),
            store.find(&key).map(|_| ()),
            store.get_version(&key).map(|_| ()),
        ] {
            assert!(matches!(result, Err(HashTableError::InvalidArgument(_))), "{result:?}");
        }
        assert_eq!(store.size().unwrap(), 0);
        assert_eq!(store.shrink(1, 100).unwrap(), 0);
    }

    #[test]
    fn test_multi_part_embedding_shares_keys() {
        let primary_config = EmbeddingConfig::new("multi").with_layout(1, 1);
        let primary = UninitializedStore::<i64, f32>::primary(primary_config, StoreOptions::default())
            .unwrap()
            .initialize(&HostTensor::vector(vec![1.0f32; 4]))
            .unwrap();
        let aux = UninitializedStore::attached(
            EmbeddingConfig::new("multi").with_part(1, 0).with_layout(1, 1),
            &primary,
        )
        .unwrap()
        .initialize(&HostTensor::vector(vec![0.0f32; 2]))
        .unwrap();

        primary.lookup_or_create(&7, Some(3)).unwrap();
        // Non-primary parts never stamp versions.
        let aux_view = aux.lookup_or_create(&7, Some(99)).unwrap();
        assert_eq!(aux_view.to_vec(), vec![0.0; 2]);
        assert_eq!(primary.get_version(&7).unwrap(), Some(3));
        assert_eq!(aux.size().unwrap(), 1);

        primary.lookup_or_create(&8, None).unwrap();
        assert_eq!(primary.snapshot().unwrap().len(), 2);
        assert_eq!(aux.snapshot().unwrap().keys, vec![7]);

        // Shrink on a non-primary part does nothing.
        assert_eq!(aux.shrink(1, 100).unwrap(), 0);

        drop(primary);
        assert!(matches!(aux.size(), Err(HashTableError::Detached { .. })));
        assert!(matches!(
            aux.lookup_or_create(&7, None),
            Err(HashTableError::Detached { .. })
        ));
        // Views taken before the primary went away stay readable.
        assert_eq!(aux_view.to_vec(), vec![0.0; 2]);
    }

    #[test]
    fn test_attach_rejects_mismatched_layout() {
        let primary = new_store(StoreOptions::default());
        let config = EmbeddingConfig::new("emb").with_part(1, 0).with_layout(1, 1);
        assert!(matches!(
            UninitializedStore::attached(config, &primary),
            Err(HashTableError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_snapshot_streams_values() {
        let store = new_store(StoreOptions::default());
        store.lookup_or_create(&1, Some(5)).unwrap().copy_from(&[1.0, 2.0, 3.0, 4.0]);
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.value_len(), 4);
        let mut bytes = Vec::new();
        assert!(snapshot.write_value_le(0, &mut bytes));
        assert!(!snapshot.write_value_le(1, &mut bytes));
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(snapshot.versions, vec![5]);
    }

    #[test]
    fn test_memory_usage_grows() {
        let store = new_store(StoreOptions::default());
        let before = store.memory_usage().unwrap();
        for key in 0..100 {
            store.lookup_or_create(&key, None).unwrap();
        }
        assert!(store.memory_usage().unwrap() > before);
    }
}
