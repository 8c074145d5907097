//! Change detection and per-key change frequency for `Adaptive` TTLs.

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde_json::Value;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::adaptive";

/// Verdict on whether a refreshed value differs meaningfully from the cached one.
pub trait ChangeDetector: Send + Sync {
    fn has_changed(&self, previous: &Value, current: &Value) -> bool;
}

/// Structural JSON comparison, optionally ignoring volatile top-level fields
/// such as server timestamps.
#[derive(Debug, Clone, Default)]
pub struct JsonChangeDetector {
    ignored_fields: HashSet<String>,
}

impl JsonChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignored_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignored_fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl ChangeDetector for JsonChangeDetector {
    fn has_changed(&self, previous: &Value, current: &Value) -> bool {
        match (previous, current) {
            (Value::Object(before), Value::Object(after)) if !self.ignored_fields.is_empty() => {
                let relevant = |key: &String| !self.ignored_fields.contains(key);
                let before_keys = before.keys().filter(|key| relevant(key)).count();
                let after_keys = after.keys().filter(|key| relevant(key)).count();
                before_keys != after_keys
                    || before
                        .iter()
                        .filter(|(key, _)| relevant(key))
                        .any(|(key, value)| after.get(key) != Some(value))
            }
            _ => previous != current,
        }
    }
}

/// Recent changed/unchanged observations per key, bounded in both keys and
/// observations per key.
pub struct ChangeHistory {
    window: usize,
    keys: Mutex<LruCache<String, VecDeque<bool>>>,
}

impl ChangeHistory {
    pub fn new(capacity: NonZeroUsize, window: NonZeroUsize) -> Self {
        Self {
            window: window.get(),
            keys: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn record(&self, key: &str, changed: bool) {
        let mut keys = mutex_lock(&self.keys, SOURCE, "record");
        if let Some(observations) = keys.get_mut(key) {
            if observations.len() == self.window {
                observations.pop_front();
            }
            observations.push_back(changed);
            return;
        }

        let mut observations = VecDeque::with_capacity(self.window);
        observations.push_back(changed);
        keys.put(key.to_owned(), observations);
    }

    /// Fraction of recorded observations that were changes, or `None`
    /// before the first observation.
    pub fn change_frequency(&self, key: &str) -> Option<f64> {
        let mut keys = mutex_lock(&self.keys, SOURCE, "change_frequency");
        let observations = keys.get(key)?;
        let changes = observations.iter().filter(|changed| **changed).count();
        Some(changes as f64 / observations.len() as f64)
    }

    pub fn forget(&self, key: &str) {
        mutex_lock(&self.keys, SOURCE, "forget").pop(key);
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.keys, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
