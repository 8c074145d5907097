//! Bounded in-process hot tier.
//!
//! Eviction scans every slot and drops the one with the fewest reads,
//! oldest `stored_at` first on ties. Expired slots lose to any live slot.
//! The scan is O(n), fine for the ~1k entries this tier is sized for.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use glob::Pattern;
use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::debug;

use super::entry::CacheEntry;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::hot";
const METRIC_EVICT_TOTAL: &str = "tickvault_cache_evict_total";
const METRIC_HOT_ENTRIES: &str = "tickvault_hot_entries";

#[derive(Debug)]
struct HotSlot {
    entry: CacheEntry,
    /// Hot-tier expiry; independent of the entry's own TTL.
    expires_at: OffsetDateTime,
}

impl HotSlot {
    fn is_live(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }
}

pub struct HotTier {
    capacity: NonZeroUsize,
    slots: Mutex<HashMap<String, HotSlot>>,
}

impl HotTier {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(HashMap::with_capacity(capacity.get())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Return a live entry and count the read. Expired slots are dropped.
    pub fn get(&self, key: &str, now: OffsetDateTime) -> Option<CacheEntry> {
        let mut slots = mutex_lock(&self.slots, SOURCE, "get");
        match slots.get_mut(key) {
            Some(slot) if slot.is_live(now) => {
                slot.entry.access_count += 1;
                Some(slot.entry.clone())
            }
            Some(_) => {
                slots.remove(key);
                gauge!(METRIC_HOT_ENTRIES).set(slots.len() as f64);
                None
            }
            None => None,
        }
    }

    /// Insert or replace `key`, returning the evicted key if the tier was full.
    ///
    /// Replacing an existing key keeps its read count so a popular key does
    /// not become the next eviction victim just because it was refreshed.
    pub fn insert(
        &self,
        key: String,
        mut entry: CacheEntry,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Option<String> {
        let mut slots = mutex_lock(&self.slots, SOURCE, "insert");

        if let Some(existing) = slots.get_mut(&key) {
            entry.access_count = entry.access_count.max(existing.entry.access_count);
            *existing = HotSlot { entry, expires_at };
            return None;
        }

        let evicted = if slots.len() >= self.capacity.get() {
            let victim = select_victim(&slots, now);
            if let Some(victim) = &victim {
                slots.remove(victim);
                counter!(METRIC_EVICT_TOTAL).increment(1);
                debug!(evicted = %victim, incoming = %key, "Hot tier evicted entry");
            }
            victim
        } else {
            None
        };

        slots.insert(key, HotSlot { entry, expires_at });
        gauge!(METRIC_HOT_ENTRIES).set(slots.len() as f64);
        evicted
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut slots = mutex_lock(&self.slots, SOURCE, "remove");
        let removed = slots.remove(key).is_some();
        gauge!(METRIC_HOT_ENTRIES).set(slots.len() as f64);
        removed
    }

    /// Drop every key matching `pattern`; returns how many were removed.
    pub fn remove_matching(&self, pattern: &Pattern) -> usize {
        let mut slots = mutex_lock(&self.slots, SOURCE, "remove_matching");
        let before = slots.len();
        slots.retain(|key, _| !pattern.matches(key));
        gauge!(METRIC_HOT_ENTRIES).set(slots.len() as f64);
        before - slots.len()
    }

    pub fn clear(&self) {
        mutex_lock(&self.slots, SOURCE, "clear").clear();
        gauge!(METRIC_HOT_ENTRIES).set(0.0);
    }

    /// Whether a live copy exists, without counting a read.
    pub fn contains(&self, key: &str, now: OffsetDateTime) -> bool {
        mutex_lock(&self.slots, SOURCE, "contains")
            .get(key)
            .is_some_and(|slot| slot.is_live(now))
    }

    /// Read count of the stored copy, without counting a read.
    pub fn access_count(&self, key: &str) -> Option<u64> {
        mutex_lock(&self.slots, SOURCE, "access_count")
            .get(key)
            .map(|slot| slot.entry.access_count)
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.slots, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn select_victim(slots: &HashMap<String, HotSlot>, now: OffsetDateTime) -> Option<String> {
    slots
        .iter()
        .min_by_key(|(_, slot)| {
            (
                slot.is_live(now),
                slot.entry.access_count,
                slot.entry.stored_at,
            )
        })
        .map(|(key, _)| key.clone())
}
