// In-memory caches shared between the refresh timers and the readers
use crate::cpm_models::TrainDetail;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Snapshot Cache
// ============================================================================

/// One complete poll result. Never mutated once published.
#[derive(Debug, Clone)]
pub struct Snapshot<V> {
    entries: HashMap<String, V>,
    fetched_at: Option<DateTime<Utc>>,
}

impl<V> Snapshot<V> {
    fn empty() -> Self {
        Snapshot {
            entries: HashMap::new(),
            fetched_at: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> &HashMap<String, V> {
        &self.entries
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }
}

/// Single-writer, many-reader cache. Writers swap in a whole new mapping, so a
/// reader holding a snapshot keeps seeing one complete poll result.
#[derive(Debug)]
pub struct SnapshotCache<V> {
    current: RwLock<Arc<Snapshot<V>>>,
}

impl<V: Clone> SnapshotCache<V> {
    pub fn new() -> Self {
        SnapshotCache {
            current: RwLock::new(Arc::new(Snapshot::empty())),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot<V>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.snapshot().get(key).cloned()
    }

    pub fn keys(&self) -> HashSet<String> {
        self.snapshot().entries.keys().cloned().collect()
    }

    /// Copy-on-write insert of a single entry.
    pub fn put(&self, key: impl Into<String>, value: V) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut entries = guard.entries.clone();
        entries.insert(key.into(), value);
        *guard = Arc::new(Snapshot {
            entries,
            fetched_at: Some(Utc::now()),
        });
    }

    /// Replaces the whole mapping in one step.
    pub fn replace(&self, entries: HashMap<String, V>) {
        let next = Arc::new(Snapshot {
            entries,
            fetched_at: Some(Utc::now()),
        });
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Like `replace`, but an empty result never clears a populated cache.
    pub fn replace_if_populated(&self, entries: HashMap<String, V>) -> bool {
        if entries.is_empty() {
            return false;
        }
        self.replace(entries);
        true
    }

    pub fn clear(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(Snapshot::empty());
    }

    /// Age of the last successful write, for "last updated" indicators.
    pub fn age(&self) -> Option<chrono::Duration> {
        self.snapshot().fetched_at.map(|at| Utc::now() - at)
    }
}

impl<V: Clone> Default for SnapshotCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Train Detail Cache
// ============================================================================

/// Fetched train details reused across map polls while fresh.
#[derive(Debug)]
pub struct DetailCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (TrainDetail, Instant)>>,
}

impl DetailCache {
    const PRUNE_THRESHOLD: usize = 1000;
    const PRUNE_AGE: Duration = Duration::from_secs(600);

    pub fn new(ttl: Duration) -> Self {
        DetailCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_fresh(&self, train_id: &str) -> Option<TrainDetail> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(train_id)
            .filter(|(_, stored_at)| stored_at.elapsed() < self.ttl)
            .map(|(detail, _)| detail.clone())
    }

    pub fn insert(&self, detail: TrainDetail) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(detail.train_id.clone(), (detail, Instant::now()));

        if entries.len() > Self::PRUNE_THRESHOLD {
            entries.retain(|_, (_, stored_at)| stored_at.elapsed() <= Self::PRUNE_AGE);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
