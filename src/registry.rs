//! Identity-keyed registry that holds its keys weakly
//!
//! Correlation keys are arbitrary objects shared through `Arc`. The registry
//! identifies a key by its allocation address and stores only a [`Weak`] handle,
//! so registering an object never extends its lifetime.
//!
//! Holding the `Weak` keeps the allocation itself reserved (only the value is
//! dropped when the last strong handle goes away), which means the address of a
//! registered key cannot be handed out to a new object while its slot exists.
//! Identity lookups therefore never confuse a dead key with a fresh one.
//!
//! Dead slots are reclaimed by a sweep that runs every `sweep_interval` puts, or
//! explicitly through [`IdentityWeakRegistry::sweep`].

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Default number of puts between two sweeps
pub const DEFAULT_SWEEP_INTERVAL: usize = 64;

struct Slot<K: ?Sized, V> {
    key: Weak<K>,
    value: V,
}

/// Concurrent map from object identity to a value
pub struct IdentityWeakRegistry<K: ?Sized, V> {
    slots: DashMap<usize, Slot<K, V>>,
    puts: AtomicUsize,
    sweep_interval: usize,
}

fn identity<T: ?Sized>(key: &Arc<T>) -> usize {
    Arc::as_ptr(key).cast::<()>() as usize
}

impl<K: ?Sized, V: Clone> IdentityWeakRegistry<K, V> {
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a registry sweeping dead slots every `sweep_interval` puts
    ///
    /// An interval of zero disables automatic sweeping.
    pub fn with_sweep_interval(sweep_interval: usize) -> Self {
        IdentityWeakRegistry {
            slots: DashMap::new(),
            puts: AtomicUsize::new(0),
            sweep_interval,
        }
    }

    /// Store `value` under the identity of `key`, returning the previous value
    pub fn put(&self, key: &Arc<K>, value: V) -> Option<V> {
        if self.sweep_interval > 0 {
            let puts = self.puts.fetch_add(1, Ordering::Relaxed) + 1;
            if puts % self.sweep_interval == 0 {
                self.sweep();
            }
        }

        let slot = Slot {
            key: Arc::downgrade(key),
            value,
        };
        self.slots
            .insert(identity(key), slot)
            .filter(|previous| previous.key.strong_count() > 0)
            .map(|previous| previous.value)
    }

    /// Look up the value registered for `key`
    ///
    /// Accepts any `Arc` pointing at the same allocation, including one typed
    /// as the concrete type of a `dyn` key.
    pub fn get<Q: ?Sized>(&self, key: &Arc<Q>) -> Option<V> {
        let slot = self.slots.get(&identity(key))?;
        if slot.key.strong_count() == 0 {
            return None;
        }
        Some(slot.value.clone())
    }

    /// Remove the entry for `key`, returning its value
    pub fn remove<Q: ?Sized>(&self, key: &Arc<Q>) -> Option<V> {
        self.slots
            .remove(&identity(key))
            .filter(|(_, slot)| slot.key.strong_count() > 0)
            .map(|(_, slot)| slot.value)
    }

    /// Drop every slot whose key is no longer alive
    ///
    /// Returns the number of reclaimed slots.
    pub fn sweep(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.key.strong_count() > 0);
        before.saturating_sub(self.slots.len())
    }

    /// Every entry whose key is still alive, with the key upgraded
    pub fn live_entries(&self) -> Vec<(Arc<K>, V)> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let key = slot.key.upgrade()?;
                Some((key, slot.value.clone()))
            })
            .collect()
    }

    /// Number of slots, including dead ones not yet swept
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<K: ?Sized, V: Clone> Default for IdentityWeakRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ?Sized, V> std::fmt::Debug for IdentityWeakRegistry<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityWeakRegistry")
            .field("slots", &self.slots.len())
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}
