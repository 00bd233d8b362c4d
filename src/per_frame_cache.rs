//! Per-Frame Caches
//!
//! A [`PerFrameCache`] is a cache whose entries have frame-bounded
//! lifetime and whose owner is one frame slot: linear scratch allocators
//! and cached descriptor sets. It keeps one sub-cache per frame slot;
//! within a slot, insertions are buffered per thread in parallel
//! key/value append arrays and flushed into the slot's main map exactly
//! once per frame entry.
//!
//! The hot path is "thread T inserts into slot f" during recording:
//! sharding by thread removes contention on the main map, and the natural
//! flush point is when the frame pipeline returns to slot f.
//!
//! Visibility: an entry created late in a frame is visible to the creating
//! thread immediately (linear scan of its own shard) and to all threads
//! after the next flush.

use std::hash::Hash;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::FRAME_COUNT;
use crate::errors::Result;

/// The shard budget: the maximum number of worker threads that may record
/// into one frame. A static budget; raising it means growing the shard
/// arrays. Thread indices are assigned densely and wrap into the budget.
pub const MAX_THREADS: usize = 32;

struct FrameEntry<V> {
    value: V,
    last_use_frame: u64,
}

struct Shard<K, V> {
    keys: Vec<K>,
    values: Vec<V>,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self { keys: Vec::new(), values: Vec::new() }
    }
}

struct Slot<K, V> {
    map: Mutex<FxHashMap<K, FrameEntry<V>>>,
    shards: [Mutex<Shard<K, V>>; MAX_THREADS],
}

/// A per-frame-slot cache with thread-local insertion buffers.
pub struct PerFrameCache<K, V> {
    slots: [Slot<K, V>; FRAME_COUNT],
}

impl<K, V> Default for PerFrameCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PerFrameCache<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot {
                map: Mutex::new(FxHashMap::default()),
                shards: std::array::from_fn(|_| Mutex::new(Shard::default())),
            }),
        }
    }
}

impl<K, V> PerFrameCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Looks up `key` in slot `slot` on behalf of thread `thread`.
    ///
    /// Probes the slot's main map first, stamping the last-use frame on a
    /// hit; then the thread's own append shard; finally materializes the
    /// resource through `create` and buffers it in the shard.
    pub fn acquire(
        &self,
        slot: usize,
        thread: usize,
        frame: u64,
        key: &K,
        create: impl FnOnce() -> Result<V>,
    ) -> Result<V> {
        let slot = &self.slots[slot];
        {
            let mut map = slot.map.lock();
            if let Some(entry) = map.get_mut(key) {
                entry.last_use_frame = frame;
                return Ok(entry.value.clone());
            }
        }

        let mut shard = slot.shards[thread % MAX_THREADS].lock();
        if let Some(i) = shard.keys.iter().position(|k| k == key) {
            return Ok(shard.values[i].clone());
        }
        let value = create()?;
        shard.keys.push(key.clone());
        shard.values.push(value.clone());
        Ok(value)
    }

    /// Flushes every thread shard of `slot` into the slot's main map.
    ///
    /// Called exactly once per frame entry, while the slot's recycle lock is
    /// held. Appends were buffered during the slot's previous occupancy,
    /// `FRAME_COUNT` frames before `frame`; entries are stamped accordingly.
    ///
    /// When two threads raced to materialize the same create-info, one entry
    /// wins the merge; the losers are returned so the caller can destroy
    /// them (safe: the slot's GPU work has completed by flush time).
    #[must_use = "duplicate losers must be destroyed"]
    pub fn flush(&self, slot: usize, frame: u64) -> Vec<V> {
        let creation_frame = frame.saturating_sub(FRAME_COUNT as u64);
        let slot = &self.slots[slot];
        let mut losers = Vec::new();
        let mut map = slot.map.lock();
        for shard in &slot.shards {
            let mut guard = shard.lock();
            let shard = &mut *guard;
            for (key, value) in shard.keys.drain(..).zip(shard.values.drain(..)) {
                match map.entry(key) {
                    std::collections::hash_map::Entry::Occupied(_) => losers.push(value),
                    std::collections::hash_map::Entry::Vacant(vacant) => {
                        vacant.insert(FrameEntry { value, last_use_frame: creation_frame });
                    }
                }
            }
        }
        losers
    }

    /// Evicts entries of `slot` unused for more than `threshold` frames,
    /// handing each to `destroy`. Entries not evicted remain usable.
    pub fn collect(&self, slot: usize, frame: u64, threshold: u64, mut destroy: impl FnMut(V)) {
        let mut evicted = Vec::new();
        {
            let mut map = self.slots[slot].map.lock();
            map.retain(|_, entry| {
                if frame.saturating_sub(entry.last_use_frame) > threshold {
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

    /// Visits every entry in `slot`'s main map.
    pub fn for_each_value(&self, slot: usize, mut f: impl FnMut(&V)) {
        let map = self.slots[slot].map.lock();
        for entry in map.values() {
            f(&entry.value);
        }
    }

    /// Drains every entry from every slot, maps and unflushed shards alike.
    /// Teardown path; the device must already be idle.
    pub fn drain_all(&self) -> Vec<V> {
        let mut values = Vec::new();
        for slot in &self.slots {
            values.extend(slot.map.lock().drain().map(|(_, e)| e.value));
            for shard in &slot.shards {
                let mut shard = shard.lock();
                shard.keys.clear();
                values.append(&mut shard.values);
            }
        }
        values
    }

    /// Number of entries in `slot`'s main map (excludes unflushed shards).
    #[must_use]
    pub fn len(&self, slot: usize) -> usize {
        self.slots[slot].map.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_entries_become_visible_after_flush() {
        let cache: PerFrameCache<u32, u64> = PerFrameCache::new();
        cache.acquire(0, 3, 0, &7, || Ok(70)).unwrap();
        // Not yet flushed: the main map is empty.
        assert_eq!(cache.len(0), 0);
        // The creating thread sees its own append immediately.
        let again = cache.acquire(0, 3, 0, &7, || panic!("must not re-create")).unwrap();
        assert_eq!(again, 70);

        let losers = cache.flush(0, 3);
        assert!(losers.is_empty());
        assert_eq!(cache.len(0), 1);
        // Now every thread hits the main map.
        let other = cache.acquire(0, 9, 3, &7, || panic!("must not re-create")).unwrap();
        assert_eq!(other, 70);
    }

    #[test]
    fn duplicate_appends_from_two_threads_merge_on_flush() {
        let cache: PerFrameCache<u32, u64> = PerFrameCache::new();
        let a = cache.acquire(1, 0, 0, &5, || Ok(1)).unwrap();
        let b = cache.acquire(1, 1, 0, &5, || Ok(2)).unwrap();
        // Each thread materialized its own copy pre-flush.
        assert_ne!(a, b);
        let losers = cache.flush(1, 3);
        // The map keeps exactly one merged entry; the loser is handed back.
        assert_eq!(cache.len(1), 1);
        assert_eq!(losers.len(), 1);
    }

    #[test]
    fn collect_honors_threshold() {
        let cache: PerFrameCache<u32, u64> = PerFrameCache::new();
        cache.acquire(0, 0, 0, &1, || Ok(10)).unwrap();
        let _ = cache.flush(0, 3); // stamped with creation frame 0

        let mut evicted = Vec::new();
        cache.collect(0, 3, 4, |v| evicted.push(v));
        assert!(evicted.is_empty(), "within threshold, entry must survive");

        cache.collect(0, 6, 2, |v| evicted.push(v));
        assert_eq!(evicted, vec![10]);
        assert_eq!(cache.len(0), 0);
    }
}
