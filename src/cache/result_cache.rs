use futures::future::{BoxFuture, FutureExt, Shared};
use moka::sync::Cache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CacheBackend, CacheBackendError, CachedResult};
use crate::config::CacheConfig;
use crate::error::ChartDataError;

type Computation = Shared<BoxFuture<'static, Result<Arc<CachedResult>, ChartDataError>>>;
type InFlight = Arc<Mutex<HashMap<String, Computation>>>;

/// Removes the in-flight registration when the computation ends, panics included
struct Registration {
    in_flight: InFlight,
    key: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

/// Whether a coalesced computation writes its result back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePolicy {
    Skip,
    Ttl(Option<Duration>),
}

/// Backend calls with a deadline; failures are counted and logged, never returned
struct GuardedBackend {
    backend: Arc<dyn CacheBackend>,
    timeout: Duration,
    errors: AtomicU64,
}

impl GuardedBackend {
    async fn call<T, F>(&self, op: &'static str, key: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, CacheBackendError>>,
    {
        let outcome = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheBackendError::Timeout(self.timeout.as_millis() as u64)),
        };
        match outcome {
            Ok(value) => Some(value),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(op, key, error = %e, "Cache backend call failed");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Arc<CachedResult>, ttl: Option<Duration>) -> bool {
        if !value.is_success() {
            return false;
        }
        self.call("set", key, self.backend.set(key, value, ttl))
            .await
            .is_some()
    }
}

/// Cache of query results in front of a [`CacheBackend`].
///
/// Backend failures never reach callers: reads degrade to misses and writes
/// are logged and dropped.
pub struct ResultCache {
    backend: Arc<GuardedBackend>,
    in_flight: InFlight,
    /// Whole-request payloads
    contexts: Cache<String, Arc<serde_json::Value>>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend: Arc::new(GuardedBackend {
                backend,
                timeout: Duration::from_millis(config.backend_timeout_ms),
                errors: AtomicU64::new(0),
            }),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            contexts: Cache::builder()
                .max_capacity(config.context_max_entries)
                .time_to_live(Duration::from_secs(config.context_ttl_secs))
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<CachedResult>> {
        let found = self
            .backend
            .call("get", key, self.backend.backend.get(key))
            .await
            .flatten();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Store a result; failed results are never stored
    pub async fn set(&self, key: &str, value: Arc<CachedResult>, ttl: Option<Duration>) -> bool {
        self.backend.set(key, value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.backend
            .call("delete", key, self.backend.backend.delete(key))
            .await
            .unwrap_or(false)
    }

    pub async fn has(&self, key: &str) -> bool {
        self.backend
            .call("has", key, self.backend.backend.has(key))
            .await
            .unwrap_or(false)
    }

    /// Run `compute` unless a computation for `key` is already in flight, in
    /// which case await that one instead. The flag is true for the caller
    /// that started the computation.
    ///
    /// The computation runs as its own task. It writes a successful result
    /// back per `policy` before unregistering, and it keeps running when
    /// callers stop waiting for it.
    pub async fn coalesce<F>(
        &self,
        key: &str,
        policy: StorePolicy,
        compute: F,
    ) -> (Result<Arc<CachedResult>, ChartDataError>, bool)
    where
        F: Future<Output = Result<Arc<CachedResult>, ChartDataError>> + Send + 'static,
    {
        let (shared, leader) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    // The task cannot unregister before this insert: it needs the lock held here
                    let registration = Registration {
                        in_flight: self.in_flight.clone(),
                        key: key.to_string(),
                    };
                    let backend = self.backend.clone();
                    let task = tokio::spawn(async move {
                        let result = compute.await;
                        if let (Ok(value), StorePolicy::Ttl(ttl)) = (&result, policy) {
                            if backend.set(&registration.key, value.clone(), ttl).await {
                                debug!(key = %registration.key, size_bytes = value.size_bytes, "Stored result");
                            }
                        }
                        drop(registration);
                        result
                    });
                    let shared = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(ChartDataError::Execution(format!("Query task failed: {}", e))),
                        }
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key.to_string(), shared.clone());
                    (shared, true)
                }
            }
        };

        if !leader {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Awaiting in-flight query");
        }
        (shared.await, leader)
    }

    pub fn set_context(&self, key: &str, payload: serde_json::Value) {
        self.contexts.insert(key.to_string(), Arc::new(payload));
    }

    pub fn get_context(&self, key: &str) -> Option<Arc<serde_json::Value>> {
        self.contexts.get(key)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            backend_errors: self.backend.errors.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            context_entries: self.contexts.entry_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
    pub backend_errors: u64,
    /// Callers that awaited another caller's execution
    pub coalesced: u64,
    pub context_entries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use crate::data::{Table, Value};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        async fn get(&self, _key: &str) -> Result<Option<Arc<CachedResult>>, CacheBackendError> {
            Err(CacheBackendError::Unavailable("connection refused".into()))
        }

        async fn set(&self, _: &str, _: Arc<CachedResult>, _: Option<Duration>) -> Result<(), CacheBackendError> {
            Err(CacheBackendError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> Result<bool, CacheBackendError> {
            Err(CacheBackendError::Unavailable("connection refused".into()))
        }

        async fn has(&self, _key: &str) -> Result<bool, CacheBackendError> {
            Err(CacheBackendError::Unavailable("connection refused".into()))
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl CacheBackend for SlowBackend {
        async fn get(&self, _key: &str) -> Result<Option<Arc<CachedResult>>, CacheBackendError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }

        async fn set(&self, _: &str, _: Arc<CachedResult>, _: Option<Duration>) -> Result<(), CacheBackendError> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> Result<bool, CacheBackendError> {
            Ok(false)
        }

        async fn has(&self, _key: &str) -> Result<bool, CacheBackendError> {
            Ok(false)
        }
    }

    fn result(key: &str) -> Arc<CachedResult> {
        let table = Table::from_columns(vec![("x", vec![Value::Int64(1)])]).unwrap();
        Arc::new(CachedResult::new(key, table, "SELECT x FROM t"))
    }

    fn memory_cache() -> ResultCache {
        ResultCache::new(Arc::new(MemoryBackend::new(1 << 20, 0)), &CacheConfig::default())
    }

    #[tokio::test]
    async fn test_hit_and_miss_counts() {
        let cache = memory_cache();
        assert!(cache.get("k").await.is_none());
        assert!(cache.set("k", result("k"), None).await);
        assert!(cache.has("k").await);
        assert!(cache.get("k").await.is_some());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[tokio::test]
    async fn test_failed_results_not_stored() {
        let cache = memory_cache();
        let failed = Arc::new(CachedResult::failed("k", "SELECT 1", "boom"));
        assert!(!cache.set("k", failed, None).await);
        assert!(!cache.has("k").await);
    }

    #[tokio::test]
    async fn test_broken_backend_degrades_to_miss() {
        let cache = ResultCache::new(Arc::new(BrokenBackend), &CacheConfig::default());
        assert!(cache.get("k").await.is_none());
        assert!(!cache.set("k", result("k"), None).await);
        assert!(!cache.has("k").await);
        assert!(!cache.delete("k").await);
        assert_eq!(cache.stats().backend_errors, 4);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let config = CacheConfig {
            backend_timeout_ms: 10,
            ..Default::default()
        };
        let cache = ResultCache::new(Arc::new(SlowBackend), &config);
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.stats().backend_errors, 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let cache = Arc::new(memory_cache());
        let runs = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let runs = runs.clone();
                tokio::spawn(async move {
                    let compute = async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(result("k"))
                    };
                    cache.coalesce("k", StorePolicy::Skip, compute).await
                })
            })
            .collect();

        let mut leaders = 0;
        for task in tasks {
            let (outcome, leader) = task.await.unwrap();
            assert_eq!(outcome.unwrap().row_count, 1);
            leaders += usize::from(leader);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(cache.stats().coalesced, 3);

        // Registration is gone once the leader finished
        let (_, leader) = cache
            .coalesce("k", StorePolicy::Skip, async { Ok(result("k")) })
            .await;
        assert!(leader);
        assert!(!cache.has("k").await);
    }

    #[tokio::test]
    async fn test_result_stored_before_registration_ends() {
        let cache = memory_cache();
        let (outcome, leader) = cache
            .coalesce("k", StorePolicy::Ttl(None), async { Ok(result("k")) })
            .await;
        assert!(leader);
        assert!(outcome.is_ok());
        assert!(cache.has("k").await);
        assert!(cache.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_computation_still_completes() {
        let cache = memory_cache();
        let slow = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(result("k"))
        };
        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            cache.coalesce("k", StorePolicy::Ttl(None), slow),
        )
        .await;
        assert!(abandoned.is_err());

        // A later caller joins the computation that is still running
        let (outcome, leader) = cache
            .coalesce("k", StorePolicy::Ttl(None), async {
                Err(ChartDataError::Execution("should not run".into()))
            })
            .await;
        assert!(!leader);
        assert_eq!(outcome.unwrap().row_count, 1);
        assert!(cache.has("k").await);
    }

    #[test]
    fn test_context_payloads() {
        let cache = memory_cache();
        cache.set_context("ctx", serde_json::json!({"queries": []}));
        assert_eq!(cache.get_context("ctx").unwrap()["queries"], serde_json::json!([]));
        assert!(cache.get_context("other").is_none());
    }
}
