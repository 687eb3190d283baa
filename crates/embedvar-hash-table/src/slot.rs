//! Value slots: the memory block holding one key's vectors and version.
//!
//! A slot is shared through `Arc` between the index that owns the key and any
//! caller still holding a view. Removing a key from an index only drops the
//! index's reference; the buffer is freed when the last view goes away, so a
//! lookup racing with a shrink never reads freed memory.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use embedvar_tensor::Element;
use once_cell::sync::OnceCell;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Version reported for slots that carry no version word.
pub const UNVERSIONED: i64 = 0;

/// Slot shape shared by every slot of one embedding group.
///
/// Computed once when the group is configured: the number of parts a slot
/// can hold (`block_count * (slot_count + 1)`) and whether a version word is
/// appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    parts: usize,
    has_version: bool,
}

impl SlotLayout {
    /// Creates a layout; `parts` is clamped to at least one.
    pub fn new(parts: usize, has_version: bool) -> Self {
        Self {
            parts: parts.max(1),
            has_version,
        }
    }

    /// Number of parts per slot.
    pub fn parts(&self) -> usize {
        self.parts
    }

    /// Whether slots carry a version word.
    pub fn has_version(&self) -> bool {
        self.has_version
    }
}

/// One fixed-width vector inside a slot.
///
/// The length never changes after allocation and the buffer is never moved,
/// so views stay valid for as long as they hold the slot.
pub struct SlotPart<V> {
    len: usize,
    values: RwLock<Box<[V]>>,
}

impl<V: Element> SlotPart<V> {
    fn from_slice(init: &[V]) -> Self {
        Self {
            len: init.len(),
            values: RwLock::new(init.to_vec().into_boxed_slice()),
        }
    }

    /// Vector width of this part.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for a zero-width part.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Locks the vector for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[V]>> {
        self.values.read()
    }

    /// Locks the vector for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[V]>> {
        self.values.write()
    }

    /// Copies the vector into `out`, returning the number of elements copied.
    pub fn copy_to(&self, out: &mut [V]) -> usize {
        let values = self.values.read();
        let n = values.len().min(out.len());
        out[..n].copy_from_slice(&values[..n]);
        n
    }

    /// Overwrites the vector from `src`, returning the number of elements copied.
    pub fn copy_from(&self, src: &[V]) -> usize {
        let mut values = self.values.write();
        let n = values.len().min(src.len());
        values[..n].copy_from_slice(&src[..n]);
        n
    }

    /// Returns an owned copy of the vector.
    pub fn to_vec(&self) -> Vec<V> {
        self.values.read().to_vec()
    }
}

impl<V: fmt::Debug> fmt::Debug for SlotPart<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPart").field("len", &self.len).finish()
    }
}

/// The record stored for one key: lazily allocated parts plus an optional
/// version word.
///
/// # Example
///
/// ```
/// use embedvar_hash_table::{SlotLayout, ValueSlot};
///
/// let slot = ValueSlot::<f32>::new(SlotLayout::new(2, true));
/// assert!(slot.part(0).is_none());
///
/// let part = slot.get_or_allocate(0, &[1.0, 2.0]).unwrap();
/// assert_eq!(part.to_vec(), vec![1.0, 2.0]);
///
/// slot.set_version(7);
/// assert_eq!(slot.version(), Some(7));
/// ```
pub struct ValueSlot<V> {
    parts: Box<[OnceCell<Arc<SlotPart<V>>>]>,
    version: Option<AtomicI64>,
}

impl<V: Element> ValueSlot<V> {
    /// Creates a slot with no parts allocated yet.
    pub fn new(layout: SlotLayout) -> Self {
        let parts = (0..layout.parts()).map(|_| OnceCell::new()).collect();
        Self {
            parts,
            version: layout
                .has_version()
                .then(|| AtomicI64::new(UNVERSIONED)),
        }
    }

    /// Creates a slot with part `index` already filled from `values` and the
    /// version word set to `version`. Used by bulk restore.
    pub fn with_part(layout: SlotLayout, index: usize, values: &[V], version: i64) -> Self {
        let slot = Self::new(layout);
        slot.try_allocate(index, values);
        slot.set_version(version);
        slot
    }

    /// Number of parts this slot can hold.
    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    /// Returns part `index` if it has been allocated.
    #[inline]
    pub fn part(&self, index: usize) -> Option<&Arc<SlotPart<V>>> {
        self.parts.get(index)?.get()
    }

    /// Returns part `index`, allocating it from `init` if absent.
    ///
    /// Concurrent callers on the same part converge on a single allocation;
    /// only one `init` copy is ever made. Returns `None` if `index` is out of
    /// range for the layout.
    pub fn get_or_allocate(&self, index: usize, init: &[V]) -> Option<&Arc<SlotPart<V>>> {
        let cell = self.parts.get(index)?;
        Some(cell.get_or_init(|| Arc::new(SlotPart::from_slice(init))))
    }

    /// Allocates part `index` from `init` only if it is absent.
    ///
    /// Returns `true` if this call performed the allocation. A losing racer's
    /// buffer is dropped immediately.
    pub fn try_allocate(&self, index: usize, init: &[V]) -> bool {
        match self.parts.get(index) {
            Some(cell) => cell.set(Arc::new(SlotPart::from_slice(init))).is_ok(),
            None => false,
        }
    }

    /// Whether the slot carries a version word.
    pub fn has_version(&self) -> bool {
        self.version.is_some()
    }

    /// Returns the stamped version, or `None` if the slot is unversioned.
    #[inline]
    pub fn version(&self) -> Option<i64> {
        self.version.as_ref().map(|v| v.load(Ordering::Relaxed))
    }

    /// Returns the stamped version, or [`UNVERSIONED`].
    #[inline]
    pub fn version_or_default(&self) -> i64 {
        self.version().unwrap_or(UNVERSIONED)
    }

    /// Stamps the version word. Last writer wins; there is no ordering with
    /// respect to concurrent value writes.
    ///
    /// Returns `false` if the slot is unversioned.
    #[inline]
    pub fn set_version(&self, version: i64) -> bool {
        match &self.version {
            Some(word) => {
                word.store(version, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_size(&self) -> usize {
        let parts: usize = self
            .parts
            .iter()
            .filter_map(|cell| cell.get())
            .map(|part| part.len() * std::mem::size_of::<V>())
            .sum();
        parts
            + self.parts.len() * std::mem::size_of::<OnceCell<Arc<SlotPart<V>>>>()
            + self.version.as_ref().map_or(0, |_| std::mem::size_of::<i64>())
    }
}

impl<V> fmt::Debug for ValueSlot<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allocated = self.parts.iter().filter(|cell| cell.get().is_some()).count();
        f.debug_struct("ValueSlot")
            .field("parts", &self.parts.len())
            .field("allocated", &allocated)
            .field("version", &self.version.as_ref().map(|v| v.load(Ordering::Relaxed)))
            .finish()
    }
}
