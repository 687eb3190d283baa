//! Eviction policies for embedding stores.
//!
//! A policy decides, from a slot's stamped version and the current global
//! step, whether the slot is stale enough to be removed by a shrink pass.
//!
//! # Available Policies
//!
//! - [`NoEviction`] - Never evict entries
//! - [`StepsToLiveEviction`] - Evict entries whose version lags the global step
//!   by more than a fixed number of steps

/// A trait defining the interface for eviction policies.
///
/// # Thread Safety
///
/// Policies are consulted from shrink passes that run concurrently with
/// lookups, so all implementations must be `Send + Sync`.
///
/// # Example
///
/// ```
/// use embedvar_hash_table::eviction::{EvictionPolicy, StepsToLiveEviction};
///
/// let policy = StepsToLiveEviction::new(10);
///
/// // Threshold at step 100 is 90.
/// assert!(policy.should_evict(89, 100));
/// assert!(!policy.should_evict(90, 100));
/// ```
pub trait EvictionPolicy: Send + Sync {
    /// Returns `true` if a slot stamped with `version` should be evicted at
    /// `global_step`.
    fn should_evict(&self, version: i64, global_step: i64) -> bool;

    /// Returns `true` if this policy never evicts anything, letting callers
    /// skip the scan entirely.
    fn is_disabled(&self) -> bool {
        false
    }
}

/// A policy that never evicts entries.
///
/// ```
/// use embedvar_hash_table::eviction::{EvictionPolicy, NoEviction};
///
/// assert!(!NoEviction.should_evict(i64::MIN, i64::MAX));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEviction;

impl EvictionPolicy for NoEviction {
    fn should_evict(&self, _version: i64, _global_step: i64) -> bool {
        false
    }

    fn is_disabled(&self) -> bool {
        true
    }
}

/// Staleness eviction: a slot is evicted when its version is strictly older
/// than `global_step - steps_to_live`.
///
/// A `steps_to_live` of zero disables eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepsToLiveEviction {
    steps_to_live: i64,
}

impl StepsToLiveEviction {
    /// Creates a policy with the given staleness window.
    pub fn new(steps_to_live: i64) -> Self {
        Self { steps_to_live }
    }

    /// Returns the staleness window.
    pub fn steps_to_live(&self) -> i64 {
        self.steps_to_live
    }

    /// Oldest version that survives at `global_step`.
    pub fn threshold(&self, global_step: i64) -> i64 {
        global_step.saturating_sub(self.steps_to_live)
    }
}

impl EvictionPolicy for StepsToLiveEviction {
    fn should_evict(&self, version: i64, global_step: i64) -> bool {
        !self.is_disabled() && version < self.threshold(global_step)
    }

    fn is_disabled(&self) -> bool {
        self.steps_to_live == 0
    }
}
