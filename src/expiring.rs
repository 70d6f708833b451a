use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Key set whose entries lapse after a retention window.
///
/// Every operation takes the caller's clock so behaviour is reproducible in
/// tests. Check-and-insert happens under one lock.
#[derive(Debug)]
pub struct ExpiringKeys<K> {
    retention_ms: u64,
    entries: Mutex<HashMap<K, u64>>,
}

impl<K: Eq + Hash + Clone> ExpiringKeys<K> {
    pub fn new(retention_ms: u64) -> Self {
        Self {
            retention_ms: retention_ms.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `key` unless a live entry exists. Returns `true` when inserted.
    pub fn try_insert(&self, key: K, now_ms: u64) -> bool {
        let mut entries = self.lock();
        Self::prune(&mut entries, now_ms, self.retention_ms);
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, now_ms);
        true
    }

    /// Insert or refresh `key`.
    pub fn insert(&self, key: K, now_ms: u64) {
        let mut entries = self.lock();
        Self::prune(&mut entries, now_ms, self.retention_ms);
        entries.insert(key, now_ms);
    }

    pub fn contains(&self, key: &K, now_ms: u64) -> bool {
        let entries = self.lock();
        entries
            .get(key)
            .map(|&at| now_ms.saturating_sub(at) < self.retention_ms)
            .unwrap_or(false)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, u64>> {
        // A poisoned table only ever holds plain timestamps.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn prune(entries: &mut HashMap<K, u64>, now_ms: u64, retention_ms: u64) {
        entries.retain(|_, at| now_ms.saturating_sub(*at) < retention_ms);
    }
}
