//! Result caching: a memory-bounded backend and the failure-tolerant
//! `ResultCache` the executor talks to.

pub mod backend;
pub mod result_cache;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::data::Table;

pub use backend::{CacheBackend, CacheBackendError, MemoryBackend};
pub use result_cache::{CacheStats, ResultCache, StorePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Success,
    Failed,
}

/// Stored outcome of one executed query; immutable once stored
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub key: String,
    pub table: Table,
    pub query: String,
    pub row_count: usize,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub status: QueryStatus,
    pub error_message: Option<String>,
}

impl CachedResult {
    pub fn new(key: &str, table: Table, query: &str) -> Self {
        let size_bytes = table.estimated_size() + query.len() + key.len();
        Self {
            key: key.to_string(),
            row_count: table.row_count(),
            table,
            query: query.to_string(),
            size_bytes,
            created_at: Utc::now(),
            status: QueryStatus::Success,
            error_message: None,
        }
    }

    pub fn failed(key: &str, query: &str, message: &str) -> Self {
        Self {
            status: QueryStatus::Failed,
            error_message: Some(message.to_string()),
            ..Self::new(key, Table::empty(), query)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }
}

/// Entry lifetime for a cache timeout in seconds; zero never expires
pub fn ttl_for(timeout_secs: i64) -> Option<Duration> {
    u64::try_from(timeout_secs)
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
