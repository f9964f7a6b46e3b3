use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::CachedResult;

/// Key/value store holding cached results
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Arc<CachedResult>>, CacheBackendError>;

    /// Insert or replace; `ttl` of `None` never expires
    async fn set(
        &self,
        key: &str,
        value: Arc<CachedResult>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheBackendError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheBackendError>;

    async fn has(&self, key: &str) -> Result<bool, CacheBackendError>;
}

struct Entry {
    value: Arc<CachedResult>,
    size: usize,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    total_bytes: usize,
}

impl Inner {
    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Delete entries largest first until `target` bytes are freed and
    /// `incoming` more bytes fit in `budget`
    fn evict_largest(&mut self, incoming: usize, target: usize, budget: usize) -> (usize, usize) {
        let mut by_size: Vec<(String, usize)> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.size))
            .collect();
        by_size.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut freed = 0;
        let mut evicted = 0;
        for (key, size) in by_size {
            if freed >= target && self.total_bytes + incoming <= budget {
                break;
            }
            self.remove(&key);
            freed += size;
            evicted += 1;
        }
        (freed, evicted)
    }
}

/// In-process backend bounded by a memory budget.
///
/// When an insert would overflow the budget, entries are evicted largest
/// first until the incoming size plus a fixed headroom has been freed.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    budget: usize,
    headroom: usize,
    evictions: AtomicU64,
}

impl MemoryBackend {
    pub fn new(budget: usize, headroom: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            budget,
            headroom,
            evictions: AtomicU64::new(0),
        }
    }

    /// Summed size of live entries
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Entries evicted for space so far
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn insert(&self, key: &str, value: Arc<CachedResult>, ttl: Option<Duration>) -> Result<(), CacheBackendError> {
        let size = value.size_bytes;
        if size > self.budget {
            return Err(CacheBackendError::EntryTooLarge {
                size,
                budget: self.budget,
            });
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.remove(key);

        if inner.total_bytes + size > self.budget {
            let expired = inner.purge_expired(now);
            if inner.total_bytes + size > self.budget {
                let before = inner.total_bytes;
                let (freed, evicted) = inner.evict_largest(size, size + self.headroom, self.budget);
                self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                info!(
                    before_bytes = before,
                    freed_bytes = freed,
                    evicted,
                    expired,
                    incoming_bytes = size,
                    "Evicted cached results"
                );
            }
        }

        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                size,
                expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
            },
        );
        inner.total_bytes += size;

        if inner.total_bytes > self.budget {
            error!(
                total_bytes = inner.total_bytes,
                budget = self.budget,
                "Cache size exceeds budget after insert"
            );
            let total = inner.total_bytes;
            inner.remove(key);
            return Err(CacheBackendError::EvictionInvariantViolation {
                total,
                budget: self.budget,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Arc<CachedResult>>, CacheBackendError> {
        let mut inner = self.inner.lock();
        let expired = inner.entries.get(key).map(|e| e.is_expired(Instant::now()));
        match expired {
            Some(true) => {
                inner.remove(key);
                debug!(key, "Cached result expired");
                Ok(None)
            }
            Some(false) => Ok(inner.entries.get(key).map(|e| e.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Arc<CachedResult>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheBackendError> {
        self.insert(key, value, ttl)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheBackendError> {
        Ok(self.inner.lock().remove(key).is_some())
    }

    async fn has(&self, key: &str) -> Result<bool, CacheBackendError> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .get(key)
            .map(|e| !e.is_expired(Instant::now()))
            .unwrap_or(false))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheBackendError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Cache backend call timed out after {0} ms")]
    Timeout(u64),

    #[error("Entry of {size} bytes exceeds the cache budget of {budget} bytes")]
    EntryTooLarge { size: usize, budget: usize },

    #[error("Cache holds {total} bytes over a budget of {budget} bytes")]
    EvictionInvariantViolation { total: usize, budget: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Table;

    const MB: usize = 1024 * 1024;

    fn sized(size: usize) -> Arc<CachedResult> {
        let mut result = CachedResult::new("k", Table::empty(), "SELECT 1");
        result.size_bytes = size;
        Arc::new(result)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = MemoryBackend::new(10 * MB, 0);
        backend.set("a", sized(MB), None).await.unwrap();
        assert!(backend.has("a").await.unwrap());
        assert_eq!(backend.get("a").await.unwrap().unwrap().size_bytes, MB);

        // Replacing an entry does not double count it
        backend.set("a", sized(2 * MB), None).await.unwrap();
        assert_eq!(backend.total_bytes(), 2 * MB);

        assert!(backend.delete("a").await.unwrap());
        assert!(!backend.delete("a").await.unwrap());
        assert_eq!(backend.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_evicts_largest_first() {
        let backend = MemoryBackend::new(14 * MB, 0);
        backend.set("big", sized(10 * MB), None).await.unwrap();
        for key in ["s1", "s2", "s3", "s4"] {
            backend.set(key, sized(MB), None).await.unwrap();
        }
        assert_eq!(backend.total_bytes(), 14 * MB);

        backend.set("incoming", sized(MB), None).await.unwrap();
        assert!(!backend.has("big").await.unwrap());
        for key in ["s1", "s2", "s3", "s4", "incoming"] {
            assert!(backend.has(key).await.unwrap(), "{key} was evicted");
        }
        assert_eq!(backend.eviction_count(), 1);
    }

    #[tokio::test]
    async fn test_headroom_frees_extra() {
        let backend = MemoryBackend::new(10 * MB, 3 * MB);
        for (key, size) in [("a", 4), ("b", 3), ("c", 2), ("d", 1)] {
            backend.set(key, sized(size * MB), None).await.unwrap();
        }
        // Needs 1 + 3 MB freed: only "a" goes
        backend.set("e", sized(MB), None).await.unwrap();
        assert!(!backend.has("a").await.unwrap());
        assert!(backend.has("b").await.unwrap());
        assert_eq!(backend.total_bytes(), 7 * MB);
    }

    #[tokio::test]
    async fn test_budget_holds_after_every_set() {
        let budget = 20 * MB;
        let backend = MemoryBackend::new(budget, MB);
        let sizes = [7, 1, 13, 2, 2, 9, 20, 1, 5, 5, 5, 3, 11, 1];
        for (i, size) in sizes.iter().enumerate() {
            backend.set(&format!("k{i}"), sized(size * MB), None).await.unwrap();
            assert!(backend.total_bytes() <= budget);
        }
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let backend = MemoryBackend::new(MB, 0);
        let err = backend.set("huge", sized(2 * MB), None).await.unwrap_err();
        assert!(matches!(err, CacheBackendError::EntryTooLarge { .. }));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_accounting_drift_rejects_insert() {
        let backend = MemoryBackend::new(4 * MB, 0);
        // Bytes counted for entries that no longer exist cannot be evicted
        backend.inner.lock().total_bytes = 4 * MB;
        let err = backend.set("x", sized(MB), None).await.unwrap_err();
        assert_eq!(
            err,
            CacheBackendError::EvictionInvariantViolation {
                total: 5 * MB,
                budget: 4 * MB
            }
        );
        assert!(!backend.has("x").await.unwrap());
        assert_eq!(backend.total_bytes(), 4 * MB);
    }

    #[tokio::test]
    async fn test_expired_entries_are_misses() {
        let backend = MemoryBackend::new(MB, 0);
        backend
            .set("short", sized(10), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!backend.has("short").await.unwrap());
        assert!(backend.get("short").await.unwrap().is_none());
        assert_eq!(backend.total_bytes(), 0);
    }
}
