//! Global Associative Caches
//!
//! [`Cache`] maps structural create-info keys to GPU resources with
//! last-use tracking. It backs every process-lifetime resource kind: render
//! passes, framebuffers, samplers, shader modules, descriptor-set layouts,
//! pipeline layouts, descriptor pools, pipeline bases and concrete
//! pipelines.
//!
//! Cached values are cheap to clone (`Copy` handles or `Arc`-backed), so a
//! hit clones the value out instead of returning a reference into the map;
//! interning identity stays observable through handle equality.
//!
//! # Locking
//!
//! One reader-writer lock per cache. Lookups take the shared side and stamp
//! the entry's last-use frame with a relaxed atomic store. A miss upgrades
//! to the exclusive side and *holds it across the creation call*: contending
//! acquires of the same key block and then hit, so a create-info never
//! materializes twice. Creation failures leave the map unchanged.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::errors::Result;

struct Entry<V> {
    value: V,
    last_use_frame: AtomicU64,
}

/// A create-info keyed resource cache with LRU collection.
pub struct Cache<K, V> {
    map: RwLock<FxHashMap<K, Entry<V>>>,
}

impl<K, V> Default for Cache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Cache<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self { map: RwLock::new(FxHashMap::default()) }
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Looks up `key`, materializing the resource through `create` on a
    /// miss. On a hit the entry's last-use stamp is updated to `frame`.
    ///
    /// The writer lock is held across `create`; see the module docs.
    pub fn acquire(
        &self,
        key: &K,
        frame: u64,
        create: impl FnOnce() -> Result<V>,
    ) -> Result<V> {
        {
            let map = self.map.read();
            if let Some(entry) = map.get(key) {
                entry.last_use_frame.store(frame, Ordering::Relaxed);
                return Ok(entry.value.clone());
            }
        }

        let mut map = self.map.write();
        // A contending thread may have inserted while we re-acquired.
        if let Some(entry) = map.get(key) {
            entry.last_use_frame.store(frame, Ordering::Relaxed);
            return Ok(entry.value.clone());
        }
        let value = create()?;
        map.insert(
            key.clone(),
            Entry { value: value.clone(), last_use_frame: AtomicU64::new(frame) },
        );
        Ok(value)
    }

    /// Removes the entry for `key`, returning the resource so the caller
    /// may physically destroy it.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.write().remove(key).map(|e| e.value)
    }

    /// Removes the first entry matching `pred`, returning the resource.
    /// Used for one-at-a-time eviction under memory pressure.
    pub fn remove_if(&self, mut pred: impl FnMut(&K, &V) -> bool) -> Option<V> {
        let mut map = self.map.write();
        let key = map
            .iter()
            .find(|(k, e)| pred(k, &e.value))
            .map(|(k, _)| k.clone())?;
        map.remove(&key).map(|e| e.value)
    }

    /// Linear scan for the first entry matching `pred`.
    ///
    /// Used to identify resources that must be re-created when a dependency
    /// (e.g. a shader module) changed.
    pub fn find(&self, mut pred: impl FnMut(&K, &V) -> bool) -> Option<V> {
        let map = self.map.read();
        map.iter()
            .find(|(k, e)| pred(k, &e.value))
            .map(|(_, e)| e.value.clone())
    }

    /// Evicts every entry whose last use is more than `threshold` frames
    /// before `frame`, handing each evicted resource to `destroy`.
    pub fn collect(&self, frame: u64, threshold: u64, mut destroy: impl FnMut(V)) {
        let mut evicted = Vec::new();
        {
            let mut map = self.map.write();
            map.retain(|_, entry| {
                let last_use = entry.last_use_frame.load(Ordering::Relaxed);
                if frame.saturating_sub(last_use) > threshold {
                    evicted.push(entry.value.clone());
                    false
                } else {
                    true
                }
            });
        }
        for value in evicted {
            destroy(value);
        }
    }

    /// Drains every live entry. Teardown path: the caller hands each value
    /// to the matching destroy entry point exactly once, after the device
    /// has gone idle.
    pub fn drain(&self) -> Vec<V> {
        self.map.write().drain().map(|(_, e)| e.value).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
