use serde::{Deserialize, Serialize};

/// Timeout value meaning "never read from or write to the cache"
pub const CACHE_DISABLED_TIMEOUT: i64 = -1;

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on the summed size of cached results
    pub memory_budget_bytes: usize,
    /// Extra room freed on each eviction pass beyond the incoming entry
    pub eviction_headroom_bytes: usize,
    /// Cache timeout applied when the datasource sets none
    pub default_timeout_secs: i64,
    /// Deadline for a single cache backend call
    pub backend_timeout_ms: u64,
    /// Lifetime of context-level payloads
    pub context_ttl_secs: u64,
    /// Capacity of the context-level payload cache
    pub context_max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 1024 * 1024 * 1024,
            eviction_headroom_bytes: 100 * 1024 * 1024,
            default_timeout_secs: 86_400,
            backend_timeout_ms: 1_000,
            context_ttl_secs: 3_600,
            context_max_entries: 1_000,
        }
    }
}

impl CacheConfig {
    /// Whether caching is switched off globally
    pub fn is_disabled(&self) -> bool {
        self.default_timeout_secs == CACHE_DISABLED_TIMEOUT
    }

    /// Timeout for one result: the datasource's own, else the default
    pub fn effective_timeout(&self, datasource_timeout: Option<i64>) -> i64 {
        if self.is_disabled() {
            return CACHE_DISABLED_TIMEOUT;
        }
        datasource_timeout.unwrap_or(self.default_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Row limit applied when a query names none
    pub default_row_limit: u64,
    /// Server-side cap on any row limit
    pub max_row_limit: u64,
    /// Deadline for a single datasource query
    pub query_timeout_secs: u64,
    /// Row limit for `samples` requests
    pub samples_row_limit: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_row_limit: 10_000,
            max_row_limit: 50_000,
            query_timeout_secs: 300,
            samples_row_limit: 1_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Megabytes to bytes; `None` when unset or too large to represent
fn mb_to_bytes(mb: Option<usize>) -> Option<usize> {
    mb.and_then(|mb| mb.checked_mul(1024 * 1024))
}

impl EngineConfig {
    /// Load configuration from environment variables
    /// CHARTQ_CACHE_MEMORY_MB=1024
    /// CHARTQ_CACHE_HEADROOM_MB=100
    /// CHARTQ_CACHE_DEFAULT_TIMEOUT=86400 (-1 disables caching)
    /// CHARTQ_CACHE_BACKEND_TIMEOUT_MS=1000
    /// CHARTQ_CONTEXT_TTL_SECS=3600
    /// CHARTQ_DEFAULT_ROW_LIMIT=10000
    /// CHARTQ_MAX_ROW_LIMIT=50000
    /// CHARTQ_QUERY_TIMEOUT_SECS=300
    /// CHARTQ_SAMPLES_ROW_LIMIT=1000
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let cache = CacheConfig {
            memory_budget_bytes: mb_to_bytes(env_parse("CHARTQ_CACHE_MEMORY_MB"))
                .unwrap_or(defaults.cache.memory_budget_bytes),
            eviction_headroom_bytes: mb_to_bytes(env_parse("CHARTQ_CACHE_HEADROOM_MB"))
                .unwrap_or(defaults.cache.eviction_headroom_bytes),
            default_timeout_secs: env_parse("CHARTQ_CACHE_DEFAULT_TIMEOUT")
                .unwrap_or(defaults.cache.default_timeout_secs),
            backend_timeout_ms: env_parse("CHARTQ_CACHE_BACKEND_TIMEOUT_MS")
                .unwrap_or(defaults.cache.backend_timeout_ms),
            context_ttl_secs: env_parse("CHARTQ_CONTEXT_TTL_SECS")
                .unwrap_or(defaults.cache.context_ttl_secs),
            context_max_entries: defaults.cache.context_max_entries,
        };
        let query = QueryConfig {
            default_row_limit: env_parse("CHARTQ_DEFAULT_ROW_LIMIT")
                .unwrap_or(defaults.query.default_row_limit),
            max_row_limit: env_parse("CHARTQ_MAX_ROW_LIMIT").unwrap_or(defaults.query.max_row_limit),
            query_timeout_secs: env_parse("CHARTQ_QUERY_TIMEOUT_SECS")
                .unwrap_or(defaults.query.query_timeout_secs),
            samples_row_limit: env_parse("CHARTQ_SAMPLES_ROW_LIMIT")
                .unwrap_or(defaults.query.samples_row_limit),
        };
        Self { cache, query }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.memory_budget_bytes, 1 << 30);
        assert_eq!(config.cache.eviction_headroom_bytes, 100 << 20);
        assert!(!config.cache.is_disabled());
        assert!(config.query.default_row_limit <= config.query.max_row_limit);
    }

    #[test]
    fn test_disabled_sentinel() {
        let cache = CacheConfig {
            default_timeout_secs: CACHE_DISABLED_TIMEOUT,
            ..Default::default()
        };
        assert!(cache.is_disabled());
        assert_eq!(cache.effective_timeout(Some(60)), CACHE_DISABLED_TIMEOUT);
    }

    #[test]
    fn test_datasource_timeout_wins() {
        let cache = CacheConfig::default();
        assert_eq!(cache.effective_timeout(Some(60)), 60);
        assert_eq!(cache.effective_timeout(None), 86_400);
    }

    #[test]
    fn test_megabytes_overflow_falls_back() {
        assert_eq!(mb_to_bytes(Some(2)), Some(2 * 1024 * 1024));
        assert_eq!(mb_to_bytes(Some(usize::MAX)), None);
        assert_eq!(mb_to_bytes(None), None);
        let defaults = CacheConfig::default();
        let budget = mb_to_bytes(Some(usize::MAX / 1024)).unwrap_or(defaults.memory_budget_bytes);
        assert_eq!(budget, defaults.memory_budget_bytes);
    }
}
